//! Character-budget text splitting for knowledge base construction.
//!
//! Documents are cut into overlapping passages before they are embedded. The
//! splitter prefers natural boundaries: it recursively splits on an ordered list
//! of delimiters (paragraphs first, then lines, sentences and spaces) and only
//! falls back to hard character cuts when no delimiter produces a small enough
//! piece. Segments are then packed greedily into chunks of at most
//! `chunk_size` characters, and each new chunk re-uses trailing segments of the
//! previous one up to `chunk_overlap` characters.
//!
//! Sizes are measured in Unicode scalar values, never bytes, so multi-byte text
//! (CJK in particular) is cut at character boundaries.
//!
//! ```
//! use localrag_context::text::TextSplitter;
//!
//! let splitter = TextSplitter::new(40, 10, 5);
//! let text = "First paragraph about rust.\n\nSecond paragraph about sqlite and vectors.";
//! let chunks = splitter.split("notes.md", text);
//!
//! assert!(chunks.len() >= 2);
//! assert!(chunks.iter().all(|c| c.text.chars().count() <= 40));
//! assert_eq!(chunks[0].source, "notes.md");
//! assert_eq!(chunks[1].sequence, 1);
//! ```
use regex::Regex;
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::Range;

/// Default chunk size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 500;
/// Default overlap between consecutive chunks in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 100;
/// Chunks shorter than this (after trimming) are dropped.
pub const DEFAULT_MIN_CHUNK_SIZE: usize = 10;

/// Delimiters ordered from most to least significant.
///
/// - `\n\s*\n`: paragraph breaks
/// - `\n`: line breaks
/// - `[.!?。！？]\s*`: sentence ends, including full-width punctuation
/// - ` `: spaces
pub const DEFAULT_DELIMITERS: &[&str] = &[
    r"\n\s*\n",          // Paragraphs
    r"\n",               // Line breaks
    r"[.!?。！？]\s*", // Sentence ends
    r" ",                // Spaces
];

/// A passage cut from a source document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextChunk {
    /// Name of the document the chunk came from.
    pub source: String,
    /// Position of the chunk within its document (0-indexed, after filtering).
    pub sequence: usize,
    /// The chunk text, trimmed of surrounding whitespace.
    pub text: String,
}

/// Splits text into overlapping, size-bounded chunks.
#[derive(Debug, Clone)]
pub struct TextSplitter {
    delimiters: Vec<Regex>,
    chunk_size: usize,
    chunk_overlap: usize,
    min_chunk_size: usize,
}

impl Default for TextSplitter {
    fn default() -> Self {
        Self::new(
            DEFAULT_CHUNK_SIZE,
            DEFAULT_CHUNK_OVERLAP,
            DEFAULT_MIN_CHUNK_SIZE,
        )
    }
}

impl TextSplitter {
    /// Creates a splitter with the default delimiters.
    ///
    /// A `chunk_size` of zero is treated as one. An overlap that is not smaller
    /// than the chunk size is reduced to `chunk_size - 1`, otherwise packing
    /// could never make progress.
    pub fn new(chunk_size: usize, chunk_overlap: usize, min_chunk_size: usize) -> Self {
        let delimiters = DEFAULT_DELIMITERS
            .iter()
            .filter_map(|pattern| Regex::new(pattern).ok())
            .collect();
        Self::with_delimiters(delimiters, chunk_size, chunk_overlap, min_chunk_size)
    }

    /// Creates a splitter with caller supplied delimiter patterns.
    ///
    /// # Errors
    /// Returns the regex error for the first pattern that does not compile.
    pub fn with_patterns(
        patterns: &[&str],
        chunk_size: usize,
        chunk_overlap: usize,
        min_chunk_size: usize,
    ) -> Result<Self, regex::Error> {
        let delimiters = patterns
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::with_delimiters(
            delimiters,
            chunk_size,
            chunk_overlap,
            min_chunk_size,
        ))
    }

    fn with_delimiters(
        delimiters: Vec<Regex>,
        chunk_size: usize,
        chunk_overlap: usize,
        min_chunk_size: usize,
    ) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            delimiters,
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size - 1),
            min_chunk_size,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    pub fn min_chunk_size(&self) -> usize {
        self.min_chunk_size
    }

    /// Splits `text` into chunks attributed to `source`.
    ///
    /// Empty input yields no chunks. Chunks whose trimmed length is below the
    /// minimum chunk size are dropped and the remaining chunks are numbered
    /// consecutively.
    pub fn split(&self, source: &str, text: &str) -> Vec<TextChunk> {
        if text.is_empty() {
            return Vec::new();
        }

        let segments = self.split_recursively_into_segments(text, 0, 0);

        let mut chunks = Vec::new();
        let mut window: VecDeque<(Range<usize>, usize)> = VecDeque::new();
        let mut window_chars = 0usize;

        for segment in segments {
            let segment_chars = text[segment.clone()].chars().count();

            if window_chars + segment_chars > self.chunk_size && !window.is_empty() {
                self.push_chunk(source, text, &window, &mut chunks);

                // Keep trailing segments as overlap, as long as the next segment still fits.
                while let Some((_, front_chars)) = window.front() {
                    if window_chars > self.chunk_overlap
                        || window_chars + segment_chars > self.chunk_size
                    {
                        window_chars -= front_chars;
                        window.pop_front();
                    } else {
                        break;
                    }
                }
            }

            window_chars += segment_chars;
            window.push_back((segment, segment_chars));
        }

        if !window.is_empty() {
            self.push_chunk(source, text, &window, &mut chunks);
        }

        chunks
    }

    fn push_chunk(
        &self,
        source: &str,
        text: &str,
        window: &VecDeque<(Range<usize>, usize)>,
        chunks: &mut Vec<TextChunk>,
    ) {
        let (Some((first, _)), Some((last, _))) = (window.front(), window.back()) else {
            return;
        };
        let chunk_text = text[first.start..last.end].trim();
        if chunk_text.is_empty() || chunk_text.chars().count() < self.min_chunk_size {
            return;
        }
        // Overlap can reproduce the previous chunk verbatim when a single segment is carried over.
        if chunks
            .last()
            .is_some_and(|prev: &TextChunk| prev.text == chunk_text)
        {
            return;
        }
        chunks.push(TextChunk {
            source: source.to_string(),
            sequence: chunks.len(),
            text: chunk_text.to_string(),
        });
    }

    // Returns contiguous byte ranges covering `text`, each at most `chunk_size`
    // characters long. Delimiter matches are kept as their own segments so the
    // ranges always tile the input.
    fn split_recursively_into_segments(
        &self,
        text: &str,
        delimiter_idx: usize,
        offset: usize,
    ) -> Vec<Range<usize>> {
        let mut segments = Vec::new();

        if text.is_empty() {
            return segments;
        }

        if text.chars().count() <= self.chunk_size {
            segments.push(offset..offset + text.len());
            return segments;
        }

        if delimiter_idx >= self.delimiters.len() {
            let mut start = 0;
            let mut count = 0;
            for (idx, _) in text.char_indices() {
                if count == self.chunk_size {
                    segments.push(offset + start..offset + idx);
                    start = idx;
                    count = 0;
                }
                count += 1;
            }
            if start < text.len() {
                segments.push(offset + start..offset + text.len());
            }
            return segments;
        }

        let mut local_start = 0;
        for mat in self.delimiters[delimiter_idx].find_iter(text) {
            if mat.start() > local_start {
                segments.extend(self.split_recursively_into_segments(
                    &text[local_start..mat.start()],
                    delimiter_idx + 1,
                    offset + local_start,
                ));
            }
            if !mat.as_str().is_empty() {
                segments.extend(self.split_recursively_into_segments(
                    mat.as_str(),
                    delimiter_idx + 1,
                    offset + mat.start(),
                ));
            }
            local_start = mat.end();
        }

        if local_start < text.len() {
            segments.extend(self.split_recursively_into_segments(
                &text[local_start..],
                delimiter_idx + 1,
                offset + local_start,
            ));
        }

        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_has_no_chunks() {
        let splitter = TextSplitter::default();
        assert!(splitter.split("empty.txt", "").is_empty());
        assert!(splitter.split("blank.txt", "   \n\n  ").is_empty());
    }

    #[test]
    fn test_short_text_is_single_chunk() {
        let splitter = TextSplitter::new(100, 20, 5);
        let chunks = splitter.split("a.txt", "  A short note about vectors.  ");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "A short note about vectors.");
        assert_eq!(chunks[0].sequence, 0);
    }

    #[test]
    fn test_chunks_respect_size_limit() {
        let splitter = TextSplitter::new(50, 10, 1);
        let text = (0..40)
            .map(|i| format!("Sentence number {i} talks about retrieval."))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = splitter.split("long.txt", &text);

        assert!(chunks.len() > 5);
        for chunk in &chunks {
            assert!(
                chunk.text.chars().count() <= 50,
                "chunk too long: {}",
                chunk.text.chars().count()
            );
        }
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.sequence, i);
        }
    }

    #[test]
    fn test_consecutive_chunks_overlap() {
        let splitter = TextSplitter::new(30, 12, 1);
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda mu";
        let chunks = splitter.split("greek.txt", text);

        assert!(chunks.len() >= 2);
        let first_words: Vec<&str> = chunks[0].text.split_whitespace().collect();
        let second_words: Vec<&str> = chunks[1].text.split_whitespace().collect();
        let last_of_first = first_words.last().copied().unwrap();
        assert!(
            second_words.contains(&last_of_first),
            "expected overlap between {:?} and {:?}",
            chunks[0].text,
            chunks[1].text
        );
    }

    #[test]
    fn test_small_chunks_are_dropped() {
        let splitter = TextSplitter::new(20, 0, 8);
        let text = "tiny\n\nThis paragraph is long enough";
        let chunks = splitter.split("mixed.txt", text);

        assert!(chunks.iter().all(|c| c.text.chars().count() >= 8));
        assert!(chunks.iter().all(|c| c.text != "tiny"));
        assert_eq!(chunks[0].sequence, 0);
    }

    #[test]
    fn test_multibyte_text_is_cut_on_char_boundaries() {
        let splitter = TextSplitter::new(8, 2, 1);
        let text = "检索增强生成系统需要向量数据库和重排序模型来提高回答质量";
        let chunks = splitter.split("zh.txt", text);

        assert!(chunks.len() > 2);
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 8));
    }

    #[test]
    fn test_paragraph_boundaries_are_preferred() {
        let splitter = TextSplitter::new(40, 0, 1);
        let text = "First paragraph here.\n\nSecond paragraph here.";
        let chunks = splitter.split("p.txt", text);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "First paragraph here.");
        assert_eq!(chunks[1].text, "Second paragraph here.");
    }

    #[test]
    fn test_overlap_is_clamped_below_chunk_size() {
        let splitter = TextSplitter::new(10, 50, 1);
        assert_eq!(splitter.chunk_overlap(), 9);
        let chunks = splitter.split("x.txt", "abcdefghijklmnopqrstuvwxyz");
        assert!(!chunks.is_empty());
    }

    #[test]
    fn test_custom_patterns() {
        let splitter = TextSplitter::with_patterns(&[r";"], 6, 0, 1).unwrap();
        let chunks = splitter.split("csv", "aaa;bbb;ccc");
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 6));
        assert!(TextSplitter::with_patterns(&[r"("], 6, 0, 1).is_err());
    }
}

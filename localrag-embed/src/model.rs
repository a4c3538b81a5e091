//! Model metadata: family detection, dimension inference and file discovery.
//!
//! ## Key Components
//!
//! - **ModelFamily**: detected from name and path substrings; decides how an
//!   embedding is pulled out of the raw model output and whether it is always
//!   normalized.
//! - **ModelInfo**: what we know about a model directory, read from its
//!   `config.json` with fallbacks for anything missing.
//!
//! ```text
//! model_dir/
//! ├── config.json        (optional: hidden_size, max_position_embeddings, model_type)
//! ├── tokenizer.json
//! └── model.onnx         (or any *.onnx further down)
//! ```

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::OutputTensor;
use crate::error::{EmbedError, Result};

/// Dimension assumed when neither metadata nor the lookup table know better.
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 1024;

const STATIC_QUANT_SUFFIX: &str = "_static_quant";

/// Model families with distinct output handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    Qwen,
    Bge,
    Bert,
    Sentence,
    Unknown,
}

impl ModelFamily {
    /// Detects the family from a model name and path, case-insensitively.
    pub fn detect(name: &str, path: &Path) -> Self {
        let haystack = format!("{} {}", name, path.display()).to_lowercase();
        if haystack.contains("qwen") {
            ModelFamily::Qwen
        } else if haystack.contains("bge") {
            ModelFamily::Bge
        } else if haystack.contains("sentence") {
            ModelFamily::Sentence
        } else if haystack.contains("bert") {
            ModelFamily::Bert
        } else {
            ModelFamily::Unknown
        }
    }

    /// Whether embeddings from this family are normalized given the configured preference.
    ///
    /// Qwen models and unrecognized models always normalize.
    pub fn should_normalize(self, configured: bool) -> bool {
        match self {
            ModelFamily::Qwen | ModelFamily::Unknown => true,
            ModelFamily::Bge | ModelFamily::Bert | ModelFamily::Sentence => configured,
        }
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelFamily::Qwen => write!(f, "qwen"),
            ModelFamily::Bge => write!(f, "bge"),
            ModelFamily::Bert => write!(f, "bert"),
            ModelFamily::Sentence => write!(f, "sentence"),
            ModelFamily::Unknown => write!(f, "unknown"),
        }
    }
}

/// Embedding dimension guessed from the model name when metadata is silent.
pub fn infer_dimension(name: &str) -> usize {
    let name = name.to_lowercase();
    if name.contains("qwen") {
        if name.contains("1.5b") || name.contains("1500m") {
            1536
        } else {
            // 0.6b / 600m and everything else
            1024
        }
    } else if name.contains("bge") {
        if name.contains("small") || name.contains("base") {
            768
        } else if name.contains("large") || name.contains("m3") {
            1024
        } else {
            DEFAULT_EMBEDDING_DIMENSION
        }
    } else if name.contains("bert") {
        if name.contains("large") { 1024 } else { 768 }
    } else if name.contains("sentence") {
        768
    } else {
        DEFAULT_EMBEDDING_DIMENSION
    }
}

/// Everything known about a model directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub name: String,
    pub model_dir: PathBuf,
    pub model_path: PathBuf,
    pub family: ModelFamily,
    pub dimension: usize,
    /// Sequence limit declared by the model, if any
    pub max_position_embeddings: Option<usize>,
}

impl ModelInfo {
    /// Reads `config.json` (if present) and locates the model file.
    pub fn from_dir(model_dir: &Path) -> Result<Self> {
        if !model_dir.is_dir() {
            return Err(EmbedError::ModelFileNotFound {
                path: model_dir.to_path_buf(),
            });
        }

        let config = read_model_config(model_dir)?;
        let dir_name = model_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());

        let declared_name = config.as_ref().and_then(|c| {
            c.get("model_name")
                .or_else(|| c.get("model_type"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| {
                    c.get("architectures")
                        .and_then(|a| a.get(0))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
        });
        // The directory name usually carries the size hints the lookup table needs
        let name = match declared_name {
            Some(declared) if !dir_name.to_lowercase().contains(&declared.to_lowercase()) => {
                format!("{dir_name} ({declared})")
            }
            _ => dir_name,
        };

        let model_path = find_model_file(model_dir)?;
        let family = ModelFamily::detect(&name, model_dir);

        let hidden_size = config.as_ref().and_then(|c| {
            c.get("hidden_size")
                .or_else(|| c.get("dim"))
                .and_then(Value::as_u64)
                .map(|v| v as usize)
        });
        let dimension = match hidden_size {
            Some(size) if size > 0 => size,
            _ => {
                let guessed = infer_dimension(&name);
                debug!("No hidden size in model config, inferred dimension {guessed}");
                guessed
            }
        };

        let max_position_embeddings = config
            .as_ref()
            .and_then(|c| c.get("max_position_embeddings"))
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .filter(|&v| v > 0);

        Ok(Self {
            name,
            model_dir: model_dir.to_path_buf(),
            model_path,
            family,
            dimension,
            max_position_embeddings,
        })
    }

    /// The sequence length actually fed to the model.
    pub fn effective_max_length(&self, configured: usize) -> usize {
        match self.max_position_embeddings {
            Some(limit) => configured.min(limit),
            None => configured,
        }
        .max(2)
    }
}

fn read_model_config(model_dir: &Path) -> Result<Option<Value>> {
    let path = model_dir.join("config.json");
    if !path.is_file() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    match serde_json::from_str(&content) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!("Ignoring malformed {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

/// `model.onnx` in `model_dir`, else the first `*.onnx` of a sorted recursive walk.
pub fn find_model_file(model_dir: &Path) -> Result<PathBuf> {
    let preferred = model_dir.join("model.onnx");
    if preferred.is_file() {
        return Ok(preferred);
    }
    find_onnx_recursive(model_dir)?.ok_or_else(|| EmbedError::ModelFileNotFound {
        path: preferred,
    })
}

fn find_onnx_recursive(dir: &Path) -> Result<Option<PathBuf>> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    for path in &entries {
        if path.is_file() && path.extension().is_some_and(|ext| ext == "onnx") {
            return Ok(Some(path.clone()));
        }
    }
    for path in &entries {
        if path.is_dir() {
            if let Some(found) = find_onnx_recursive(path)? {
                return Ok(Some(found));
            }
        }
    }
    Ok(None)
}

/// `tokenizer.json` for a model directory.
///
/// Statically quantized exports (`<name>_static_quant`) often ship without a
/// tokenizer; those fall back to the base model directory next to them.
pub fn find_tokenizer_file(model_dir: &Path) -> Result<PathBuf> {
    let direct = model_dir.join("tokenizer.json");
    if direct.is_file() {
        return Ok(direct);
    }

    let base = model_dir
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(STATIC_QUANT_SUFFIX))
        .and_then(|base_name| model_dir.parent().map(|p| p.join(base_name)));
    if let Some(base_dir) = base {
        let fallback = base_dir.join("tokenizer.json");
        if fallback.is_file() {
            debug!("Using tokenizer from base model {}", base_dir.display());
            return Ok(fallback);
        }
    }

    Err(EmbedError::ModelFileNotFound { path: direct })
}

/// Pulls one embedding out of the raw model output.
///
/// `valid_len` is the number of real (unpadded) tokens in the input.
pub fn extract_embedding(
    family: ModelFamily,
    output: &OutputTensor,
    valid_len: usize,
    mean_pooling: bool,
) -> Result<Vec<f32>> {
    match output.shape.as_slice() {
        // [batch, hidden]: already pooled
        [_, hidden] => row(output, 0, *hidden),
        // [batch, seq, hidden]
        [_, seq, hidden] => {
            let (seq, hidden) = (*seq, *hidden);
            if seq == 0 || hidden == 0 {
                return Err(EmbedError::inference("model returned an empty sequence"));
            }
            let valid = valid_len.clamp(1, seq);
            match family {
                ModelFamily::Qwen if mean_pooling => {
                    let mut pooled = vec![0.0f32; hidden];
                    for position in 0..valid {
                        let token = row(output, position, hidden)?;
                        for (acc, x) in pooled.iter_mut().zip(token) {
                            *acc += x;
                        }
                    }
                    for x in pooled.iter_mut() {
                        *x /= valid as f32;
                    }
                    Ok(pooled)
                }
                ModelFamily::Qwen => row(output, valid - 1, hidden),
                _ => row(output, 0, hidden),
            }
        }
        shape => Err(EmbedError::inference(format!(
            "unexpected output shape: {shape:?}"
        ))),
    }
}

fn row(output: &OutputTensor, index: usize, width: usize) -> Result<Vec<f32>> {
    let start = index * width;
    output
        .data
        .get(start..start + width)
        .map(<[f32]>::to_vec)
        .ok_or_else(|| {
            EmbedError::inference(format!(
                "output buffer of {} values is too short for row {index} of width {width}",
                output.data.len()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_family_detection() {
        let p = Path::new("/models");
        assert_eq!(ModelFamily::detect("Qwen3-Embedding-0.6B", p), ModelFamily::Qwen);
        assert_eq!(ModelFamily::detect("bge-small-zh", p), ModelFamily::Bge);
        assert_eq!(ModelFamily::detect("bert-base-uncased", p), ModelFamily::Bert);
        assert_eq!(
            ModelFamily::detect("all-MiniLM", Path::new("/m/sentence-transformers")),
            ModelFamily::Sentence
        );
        assert_eq!(ModelFamily::detect("e5", p), ModelFamily::Unknown);
    }

    #[test]
    fn test_normalization_policy() {
        assert!(ModelFamily::Qwen.should_normalize(false));
        assert!(ModelFamily::Unknown.should_normalize(false));
        assert!(!ModelFamily::Bge.should_normalize(false));
        assert!(ModelFamily::Bert.should_normalize(true));
    }

    #[test]
    fn test_dimension_table() {
        assert_eq!(infer_dimension("bge-large-en"), 1024);
        assert_eq!(infer_dimension("bge-small-zh"), 768);
        assert_eq!(infer_dimension("bge-base"), 768);
        assert_eq!(infer_dimension("bert-large"), 1024);
        assert_eq!(infer_dimension("bert-base"), 768);
        assert_eq!(infer_dimension("qwen3-embedding-0.6b"), 1024);
        assert_eq!(infer_dimension("qwen2-1.5b"), 1536);
        assert_eq!(infer_dimension("mystery"), 1024);
        assert_eq!(infer_dimension("bge-m3"), 1024);
        assert_eq!(infer_dimension("BGE-Small-Large-Distill"), 768);
    }

    #[test]
    fn test_model_info_from_config() {
        let dir = tempdir().unwrap();
        let model_dir = dir.path().join("bge-small");
        fs::create_dir(&model_dir).unwrap();
        fs::write(
            model_dir.join("config.json"),
            r#"{"model_type":"bert","hidden_size":384,"max_position_embeddings":256}"#,
        )
        .unwrap();
        fs::write(model_dir.join("model.onnx"), b"onnx").unwrap();

        let info = ModelInfo::from_dir(&model_dir).unwrap();
        assert_eq!(info.dimension, 384);
        assert_eq!(info.family, ModelFamily::Bge);
        assert_eq!(info.model_path, model_dir.join("model.onnx"));
        assert_eq!(info.effective_max_length(512), 256);
        assert_eq!(info.effective_max_length(128), 128);
    }

    #[test]
    fn test_model_info_without_config_uses_table() {
        let dir = tempdir().unwrap();
        let model_dir = dir.path().join("bert-large-cased");
        fs::create_dir_all(model_dir.join("onnx")).unwrap();
        fs::write(model_dir.join("onnx/b.onnx"), b"x").unwrap();
        fs::write(model_dir.join("onnx/a.onnx"), b"x").unwrap();

        let info = ModelInfo::from_dir(&model_dir).unwrap();
        assert_eq!(info.dimension, 1024);
        assert_eq!(info.model_path, model_dir.join("onnx/a.onnx"));
        assert_eq!(info.max_position_embeddings, None);
    }

    #[test]
    fn test_dimension_ignores_parent_directories() {
        let dir = tempdir().unwrap();
        let model_dir = dir.path().join("database").join("bge-m3");
        fs::create_dir_all(&model_dir).unwrap();
        fs::write(model_dir.join("model.onnx"), b"x").unwrap();

        let info = ModelInfo::from_dir(&model_dir).unwrap();
        assert_eq!(info.name, "bge-m3");
        assert_eq!(info.dimension, 1024);
    }

    #[test]
    fn test_missing_model_file() {
        let dir = tempdir().unwrap();
        let err = ModelInfo::from_dir(dir.path()).unwrap_err();
        assert!(matches!(err, EmbedError::ModelFileNotFound { .. }));
    }

    #[test]
    fn test_tokenizer_static_quant_fallback() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("bge-m3");
        let quant = dir.path().join("bge-m3_static_quant");
        fs::create_dir(&base).unwrap();
        fs::create_dir(&quant).unwrap();
        fs::write(base.join("tokenizer.json"), "{}").unwrap();

        assert_eq!(find_tokenizer_file(&quant).unwrap(), base.join("tokenizer.json"));
        assert_eq!(find_tokenizer_file(&base).unwrap(), base.join("tokenizer.json"));
        assert!(find_tokenizer_file(dir.path()).is_err());
    }

    #[test]
    fn test_extract_head_and_pooling() {
        // [1, 3, 2]
        let output = OutputTensor {
            shape: vec![1, 3, 2],
            data: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        };
        assert_eq!(
            extract_embedding(ModelFamily::Bge, &output, 3, true).unwrap(),
            vec![1.0, 2.0]
        );
        assert_eq!(
            extract_embedding(ModelFamily::Qwen, &output, 2, true).unwrap(),
            vec![2.0, 3.0]
        );
        assert_eq!(
            extract_embedding(ModelFamily::Qwen, &output, 2, false).unwrap(),
            vec![3.0, 4.0]
        );

        let pooled = OutputTensor {
            shape: vec![1, 2],
            data: vec![0.5, 0.25],
        };
        assert_eq!(
            extract_embedding(ModelFamily::Unknown, &pooled, 9, true).unwrap(),
            vec![0.5, 0.25]
        );
    }

    #[test]
    fn test_extract_rejects_bad_shapes() {
        let output = OutputTensor {
            shape: vec![4],
            data: vec![0.0; 4],
        };
        assert!(extract_embedding(ModelFamily::Bert, &output, 1, true).is_err());

        let short = OutputTensor {
            shape: vec![1, 2, 4],
            data: vec![0.0; 3],
        };
        assert!(extract_embedding(ModelFamily::Bert, &short, 1, true).is_err());
    }
}

use clap::Parser;
use localrag_context::text::{
    DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE, DEFAULT_MIN_CHUNK_SIZE, TextSplitter,
};
use std::fs;
use std::io::{self, Read};

/// A CLI tool to split text files into JSON chunks using localrag-context.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input text file. If not provided, reads from stdin.
    #[arg(short, long)]
    input: Option<String>,

    /// Source name recorded on every chunk.
    #[arg(short, long, default_value = "stdin")]
    source: String,

    /// Maximum length for each chunk, in characters.
    #[arg(short = 'c', long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Overlap between consecutive chunks, in characters.
    #[arg(short, long, default_value_t = DEFAULT_CHUNK_OVERLAP)]
    overlap: usize,

    /// Chunks shorter than this are dropped.
    #[arg(short, long, default_value_t = DEFAULT_MIN_CHUNK_SIZE)]
    min_chunk_size: usize,

    /// Comma-separated list of regex patterns for delimiters.
    /// Defaults to paragraph, line, sentence and space delimiters.
    #[arg(short, long, value_delimiter = ',')]
    delimiters: Option<Vec<String>>,
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    let (content, source) = if let Some(input_path) = args.input {
        (fs::read_to_string(&input_path)?, input_path)
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        (buffer, args.source)
    };

    let splitter = match args.delimiters {
        Some(patterns) => {
            let refs: Vec<&str> = patterns.iter().map(|s| s.as_str()).collect();
            TextSplitter::with_patterns(&refs, args.chunk_size, args.overlap, args.min_chunk_size)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
        }
        None => TextSplitter::new(args.chunk_size, args.overlap, args.min_chunk_size),
    };

    let chunks = splitter.split(&source, &content);

    let json_output = serde_json::to_string_pretty(&chunks)?;
    println!("{}", json_output);

    Ok(())
}

pub mod text;

// Re-export the splitter for external use
pub use text::{TextChunk, TextSplitter};

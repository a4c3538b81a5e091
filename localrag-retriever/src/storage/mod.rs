//! Storage layer for knowledge bases
//!
//! A knowledge base is a directory holding a SQLite vector store and a JSON
//! metadata sidecar describing the models that produced its vectors.
//!
//! ## Key Components
//!
//! - **VectorStore**: insert and similarity-search operations
//! - **SqliteVectorStore**: the SQLite implementation, including the
//!   dimension checks made when a store is opened for writing
//! - **KnowledgeBaseMetadata**: the `metadata.json` sidecar
//! - **StoreError**: failures that must reach the caller unmodified
//!
//! ## Layout
//!
//! ```text
//! <kb_root>/<name>/
//! ├── vectorstore.db              chunks and embeddings
//! ├── vectorstore.db.building     overwrite builds in progress
//! ├── metadata.json               models, dimension, counts
//! └── intermediate_chunks.json    extraction output while a build runs
//! ```

use async_trait::async_trait;
use serde::Serialize;

pub mod metadata;
pub mod sqlite_store;

pub use metadata::KnowledgeBaseMetadata;
pub use sqlite_store::SqliteVectorStore;

/// Blake3 hash of a source file (32 bytes).
pub type FileHash = [u8; 32];

/// Database ID for a stored chunk.
pub type ChunkId = i64;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Vectors of a different length cannot share a store
    #[error("Embedding dimension mismatch: store holds {expected}-dimensional vectors, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Database error: {source}")]
    Database {
        #[from]
        source: sqlx::Error,
    },

    #[error("Metadata error: {source}")]
    Metadata {
        #[from]
        source: serde_json::Error,
    },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// A second writer tried to start on a knowledge base that is being built
    #[error("A build is already running for knowledge base '{name}'")]
    BuildInProgress { name: String },

    #[error("Knowledge base not found: {path}")]
    NotFound { path: std::path::PathBuf },
}

/// One chunk of source text with its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub id: Option<ChunkId>,
    /// Where the text came from, usually a file path
    pub source: String,
    pub file_hash: FileHash,
    /// Position of the chunk within its source
    pub sequence: usize,
    pub text: String,
    pub vector: Vec<f32>,
}

/// A stored chunk ranked against a query vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub chunk_id: ChunkId,
    pub text: String,
    pub source: String,
    pub similarity: f32,
}

/// Per-source summary of a store's contents.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSummary {
    pub source: String,
    pub file_hash: String,
    pub chunks: usize,
}

/// Persisted, queryable vectors for one knowledge base.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Length every stored vector has
    fn dimension(&self) -> usize;

    /// Snapshot of the metadata sidecar
    fn metadata(&self) -> KnowledgeBaseMetadata;

    /// Insert one chunk
    async fn insert(&self, chunk: ChunkRecord) -> Result<ChunkId>;

    /// Insert all chunks of one source atomically
    async fn insert_batch(&self, chunks: Vec<ChunkRecord>) -> Result<Vec<ChunkId>>;

    /// The `k` most similar chunks, most similar first
    async fn search_similar(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>>;

    /// Number of stored chunks
    async fn chunk_count(&self) -> Result<usize>;

    /// Whether chunks from a file with this content hash are stored
    async fn contains_file(&self, hash: &FileHash) -> Result<bool>;

    /// Stored sources with their chunk counts
    async fn sources(&self) -> Result<Vec<SourceSummary>>;

    /// Release the underlying connections
    async fn close(&self);
}

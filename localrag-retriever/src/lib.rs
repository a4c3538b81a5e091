//! localrag-retriever: knowledge base building and retrieval
//!
//! This crate turns documents into persisted knowledge bases of embedded text
//! chunks and answers questions against them with vector search followed by
//! cross-encoder reranking. Model handling lives in `localrag-embed` and text
//! splitting in `localrag-context`.
//!
//! ## Key Modules
//!
//! - **[`retrieval`]**: build orchestration, the build worker, query flow and model repointing
//! - **[`storage`]**: the SQLite vector store and the `metadata.json` sidecar
//! - **[`events`]**: progress and outcome events for a presentation layer
//! - **[`config`]**: TOML configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use localrag_embed::{CancellationToken, OnnxEmbeddingPipeline};
//! use localrag_retriever::config::RagConfig;
//! use localrag_retriever::retrieval::build_mode::BuildMode;
//! use localrag_retriever::retrieval::builder::{BuildRequest, KnowledgeBaseBuilder};
//! use std::path::Path;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = RagConfig::default();
//! let embedder = OnnxEmbeddingPipeline::load(config.embed_config(Path::new("models/bge"))).await?;
//! let builder = KnowledgeBaseBuilder::new(
//!     &config.paths.knowledge_bases,
//!     config.splitter(),
//!     Arc::new(embedder),
//! );
//! let request = BuildRequest::new("notes", vec!["notes.md".into()], BuildMode::Overwrite);
//! let task = builder.build(request, &CancellationToken::new()).await?;
//! println!("{} chunks stored", task.chunks_written);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Files → TextSplitter → EmbeddingProvider → process_vector → SqliteVectorStore
//!                                                                   ↓
//! Question → EmbeddingProvider → search_similar(depth) → Reranker(top k) → Passages
//! ```

pub mod config;
pub mod events;
pub mod retrieval;
pub mod storage;

//! # localrag-embed
//!
//! Everything in a local RAG system that touches a neural model: turning text
//! into vectors, scoring candidate passages with a cross-encoder, and keeping
//! the native model sessions behind both alive.
//!
//! ## Features
//!
//! - **Resilient Sessions**: lazy loading, bounded recovery and a single
//!   in-flight load per model, with every inference call serialized
//! - **Vector Hygiene**: NaN, zero and runaway vectors are repaired before they
//!   reach an index
//! - **Model Families**: qwen, bge, bert and sentence-transformer exports are
//!   recognized from their names and handled accordingly
//! - **Cooperative Cancellation**: a token threaded through every call, with a
//!   stop coordinator that only resets once every module has wound down
//!
//! ## Quick Start
//!
//! ```no_run
//! use localrag_embed::{CancellationToken, EmbedConfig, EmbeddingProvider, OnnxEmbeddingPipeline};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pipeline = OnnxEmbeddingPipeline::load(EmbedConfig::new("models/bge-small-zh")).await?;
//!
//! let vector = pipeline
//!     .embed_text("How do I rotate my API keys?", &CancellationToken::new())
//!     .await?;
//! println!("{} dimensions, normalized: {}", vector.dimension, vector.is_normalized);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! text ──► Tokenizer ──► ModelSession<B> ──► extract ──► anomaly ──► normalize ──► EmbeddingVector
//!                              ▲
//!                  InferenceBackend (ort, or a mock)
//! ```
//!
//! - [`session`]: session lifecycle state machine
//! - [`provider`]: the embedding pipeline and [`EmbeddingProvider`] trait
//! - [`reranker`]: batched cross-encoder scoring
//! - [`anomaly`]: detection and repair of degenerate vectors
//! - [`model`]: family detection, dimension inference, file discovery
//! - [`tokenizer`] and [`backend`]: the two collaborator seams
//! - [`cancel`]: cancellation token and stop coordinator
//! - [`mock`]: deterministic collaborators for tests
//!
//! ## Error Handling
//!
//! All operations return [`Result<T>`] using the crate's [`EmbedError`] type.
//! [`EmbedError::Cancelled`] is a normal outcome, not a failure.

pub mod anomaly;
pub mod backend;
pub mod cancel;
pub mod config;
pub mod error;
pub mod mock;
pub mod model;
pub mod provider;
pub mod reranker;
pub mod session;
pub mod tokenizer;

// Re-export main types for easy access
pub use anomaly::{AnomalyKind, AnomalyResult, detect_anomalies, process_vector, repair_vector};
pub use backend::{InferenceBackend, OrtBackend};
pub use cancel::{CancellationToken, StopCoordinator, StopModule};
pub use config::{EmbedConfig, RerankConfig, RetryPolicy};
pub use error::{EmbedError, Result};
pub use model::{ModelFamily, ModelInfo};
pub use provider::{EmbeddingProvider, EmbeddingVector, OnnxEmbeddingPipeline};
pub use reranker::{RerankProgress, RerankResult, Reranker};
pub use session::{ModelSession, SessionState};
pub use tokenizer::{HfTokenizer, Tokenizer};

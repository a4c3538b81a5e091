//! Configuration for embedding and reranking models

use crate::error::{EmbedError, Result};
use derive_builder::Builder;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default maximum sequence length fed to a model.
pub const DEFAULT_MAX_SEQUENCE_LENGTH: usize = 512;
/// Default number of documents scored per reranking batch.
pub const DEFAULT_RERANK_BATCH_SIZE: usize = 8;
/// Default hard limit for one inference call.
pub const DEFAULT_INFERENCE_TIMEOUT: Duration = Duration::from_secs(600);
/// Token id written into the last position of a truncated sequence.
pub const DEFAULT_SEP_TOKEN_ID: i64 = 2;

/// Number of intra-op threads used when none is configured: half the CPUs, at least one.
pub fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| (n.get() / 2).max(1))
        .unwrap_or(1)
}

/// Bounded recovery settings for a model session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Recovery attempts allowed after a failed load
    pub max_retries: u32,
    /// Pause before each recovery attempt
    pub retry_delay: Duration,
    /// Interval between polls while another caller is loading
    pub loading_poll_interval: Duration,
    /// Number of polls before giving up on a concurrent load
    pub loading_poll_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            loading_poll_interval: Duration::from_millis(100),
            loading_poll_attempts: 30,
        }
    }
}

impl RetryPolicy {
    /// Total time a caller is willing to wait for a concurrent load.
    pub fn loading_wait_budget(&self) -> Duration {
        self.loading_poll_interval * self.loading_poll_attempts
    }
}

/// Configuration for the embedding pipeline
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct EmbedConfig {
    /// Directory holding the model file, tokenizer.json and config.json
    pub model_dir: PathBuf,
    /// Upper bound on tokens per input; the model's own limit may lower it
    #[builder(default = "DEFAULT_MAX_SEQUENCE_LENGTH")]
    pub max_sequence_length: usize,
    /// Whether to normalize embeddings (qwen models always normalize)
    #[builder(default = "true")]
    pub normalize: bool,
    /// Mean-pool qwen outputs; when off the last valid token is used
    #[builder(default = "true")]
    pub mean_pooling: bool,
    /// Token forced into the final position of a truncated sequence
    #[builder(default = "DEFAULT_SEP_TOKEN_ID")]
    pub sep_token_id: i64,
    /// Intra-op thread count; `None` uses [`default_thread_count`]
    #[builder(default)]
    pub threads: Option<usize>,
    /// Hard limit for one inference call
    #[builder(default = "DEFAULT_INFERENCE_TIMEOUT")]
    pub inference_timeout: Duration,
    /// Session recovery policy
    #[builder(default)]
    pub retry: RetryPolicy,
}

impl EmbedConfig {
    /// Create a new embedding configuration using the builder
    pub fn builder() -> EmbedConfigBuilder {
        EmbedConfigBuilder::default()
    }

    /// Create a configuration with defaults for the given model directory
    pub fn new<P: AsRef<Path>>(model_dir: P) -> Self {
        Self {
            model_dir: model_dir.as_ref().to_path_buf(),
            max_sequence_length: DEFAULT_MAX_SEQUENCE_LENGTH,
            normalize: true,
            mean_pooling: true,
            sep_token_id: DEFAULT_SEP_TOKEN_ID,
            threads: None,
            inference_timeout: DEFAULT_INFERENCE_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    /// Set whether to normalize embeddings (builder style)
    pub fn with_normalize(self, normalize: bool) -> Self {
        Self { normalize, ..self }
    }

    /// Set the maximum sequence length (builder style)
    pub fn with_max_sequence_length(self, max_sequence_length: usize) -> Self {
        Self {
            max_sequence_length,
            ..self
        }
    }

    /// Set the intra-op thread count (builder style)
    pub fn with_threads(self, threads: usize) -> Self {
        Self {
            threads: Some(threads),
            ..self
        }
    }

    /// Set the per-call inference timeout (builder style)
    pub fn with_inference_timeout(self, inference_timeout: Duration) -> Self {
        Self {
            inference_timeout,
            ..self
        }
    }

    /// Set the session recovery policy (builder style)
    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        Self { retry, ..self }
    }

    /// Effective thread count
    pub fn thread_count(&self) -> usize {
        self.threads.unwrap_or_else(default_thread_count).max(1)
    }

    /// Validate the settings that do not depend on the filesystem
    pub fn validate(&self) -> Result<()> {
        if self.max_sequence_length < 2 {
            return Err(EmbedError::invalid_config(format!(
                "max_sequence_length must be at least 2, got {}",
                self.max_sequence_length
            )));
        }
        if self.inference_timeout.is_zero() {
            return Err(EmbedError::invalid_config("inference_timeout must be positive"));
        }
        Ok(())
    }
}

/// Configuration for the reranking engine
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct RerankConfig {
    /// Directory holding the cross-encoder model and its tokenizer
    pub model_dir: PathBuf,
    /// Tokens kept per (query, document) pair
    #[builder(default = "DEFAULT_MAX_SEQUENCE_LENGTH")]
    pub max_sequence_length: usize,
    /// Documents scored per batch
    #[builder(default = "DEFAULT_RERANK_BATCH_SIZE")]
    pub batch_size: usize,
    /// Intra-op thread count; `None` uses [`default_thread_count`]
    #[builder(default)]
    pub threads: Option<usize>,
    /// Hard limit for scoring one document
    #[builder(default = "DEFAULT_INFERENCE_TIMEOUT")]
    pub inference_timeout: Duration,
    /// Session recovery policy
    #[builder(default)]
    pub retry: RetryPolicy,
}

impl RerankConfig {
    /// Create a new reranking configuration using the builder
    pub fn builder() -> RerankConfigBuilder {
        RerankConfigBuilder::default()
    }

    /// Create a configuration with defaults for the given model directory
    pub fn new<P: AsRef<Path>>(model_dir: P) -> Self {
        Self {
            model_dir: model_dir.as_ref().to_path_buf(),
            max_sequence_length: DEFAULT_MAX_SEQUENCE_LENGTH,
            batch_size: DEFAULT_RERANK_BATCH_SIZE,
            threads: None,
            inference_timeout: DEFAULT_INFERENCE_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    /// Set the batch size (builder style); zero is treated as one
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            ..self
        }
    }

    /// Set the per-document inference timeout (builder style)
    pub fn with_inference_timeout(self, inference_timeout: Duration) -> Self {
        Self {
            inference_timeout,
            ..self
        }
    }

    /// Set the session recovery policy (builder style)
    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        Self { retry, ..self }
    }

    /// Set the intra-op thread count (builder style)
    pub fn with_threads(self, threads: usize) -> Self {
        Self {
            threads: Some(threads),
            ..self
        }
    }

    /// Effective thread count
    pub fn thread_count(&self) -> usize {
        self.threads.unwrap_or_else(default_thread_count).max(1)
    }
}

//! Error types for the embedding and reranking system

use std::path::PathBuf;
use std::time::Duration;

/// Result type for embedding operations.
///
/// This is a convenience type alias that uses [`EmbedError`] as the error type.
/// Used throughout the crate for operations that can fail.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Comprehensive error type for all model operations.
///
/// # Error Categories
///
/// - **Configuration Errors**: invalid settings or missing model files
/// - **Session Errors**: load failures and exhausted recovery attempts
/// - **Runtime Errors**: tokenization, inference and timeouts
/// - **Cancellation**: a cooperative stop, which callers treat as a normal outcome
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// Error when model files are not found or invalid
    #[error("Model file not found: {path}")]
    ModelFileNotFound { path: PathBuf },

    /// Error when model configuration is invalid
    #[error("Invalid model configuration: {message}")]
    InvalidConfig { message: String },

    /// A native session could not be created from a model file
    #[error("Failed to load model {path}: {source}")]
    ModelLoad {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Recovery attempts are exhausted; the session will not retry again until closed
    #[error("Model session for {model} is unavailable after {attempts} recovery attempts")]
    SessionUnavailable { model: String, attempts: u32 },

    /// Another caller's load did not finish within the polling budget
    #[error("Timed out after {waited:?} waiting for {model} to finish loading")]
    LoadWaitTimeout { model: String, waited: Duration },

    /// The tokenizer failed or is not initialized
    #[error("Tokenization failed: {message}")]
    Tokenization { message: String },

    /// Error during inference
    #[error("Inference failed: {source}")]
    Inference {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A single inference call exceeded its time budget
    #[error("Inference timed out after {timeout:?}")]
    InferenceTimeout { timeout: Duration },

    /// Anomaly repair and the random-vector fallback both failed
    #[error("Vector anomaly could not be repaired: {description}")]
    VectorAnomaly { description: String },

    /// The operation observed a cooperative stop request
    #[error("Operation cancelled")]
    Cancelled,

    /// IO errors when reading model files
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Malformed model metadata
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// Async task join errors
    #[error("Async task failed: {source}")]
    AsyncTask {
        #[from]
        source: tokio::task::JoinError,
    },

    /// Generic errors from other libraries
    #[error("External error: {source}")]
    External {
        #[from]
        source: anyhow::Error,
    },
}

impl EmbedError {
    /// Create a model load error for `path` from any error type.
    pub fn model_load<P, E>(path: P, source: E) -> Self
    where
        P: Into<PathBuf>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::ModelLoad {
            path: path.into(),
            source: source.into(),
        }
    }

    /// Create an inference error from any error type.
    pub fn inference<E>(source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Inference {
            source: source.into(),
        }
    }

    /// Create a tokenization error with a custom message.
    pub fn tokenization<S: Into<String>>(message: S) -> Self {
        Self::Tokenization {
            message: message.into(),
        }
    }

    /// Create an invalid configuration error with a custom message.
    ///
    /// This is a convenience constructor for configuration validation errors,
    /// such as invalid model parameters, missing required settings, or
    /// incompatible configuration combinations.
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Whether this error is a cooperative stop rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the model itself is unusable, as opposed to one input failing.
    pub fn is_session_failure(&self) -> bool {
        matches!(
            self,
            Self::ModelFileNotFound { .. }
                | Self::InvalidConfig { .. }
                | Self::ModelLoad { .. }
                | Self::SessionUnavailable { .. }
                | Self::LoadWaitTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = EmbedError::model_load("/models/bge", "bad header");
        assert_eq!(err.to_string(), "Failed to load model /models/bge: bad header");

        let err = EmbedError::SessionUnavailable {
            model: "bge-small".to_string(),
            attempts: 3,
        };
        assert!(err.to_string().contains("after 3 recovery attempts"));

        let err = EmbedError::InferenceTimeout {
            timeout: Duration::from_secs(600),
        };
        assert!(err.to_string().contains("600s"));
    }

    #[test]
    fn test_cancelled_is_not_a_failure_kind() {
        assert!(EmbedError::Cancelled.is_cancelled());
        assert!(!EmbedError::tokenization("empty").is_cancelled());
    }

    #[test]
    fn test_session_failures() {
        assert!(EmbedError::model_load("/m", "corrupt").is_session_failure());
        assert!(!EmbedError::tokenization("empty").is_session_failure());
        assert!(
            !EmbedError::InferenceTimeout {
                timeout: Duration::from_secs(1)
            }
            .is_session_failure()
        );
    }
}

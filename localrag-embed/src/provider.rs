//! Embedding pipeline: tokenize → infer → extract → repair → normalize.
//!
//! [`OnnxEmbeddingPipeline`] is generic over its two collaborators so that the
//! same pipeline drives a real ONNX model in production and the deterministic
//! [`mock`](crate::mock) pair in tests.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::anomaly;
use crate::backend::{InferenceBackend, InputTensor, OrtBackend, SessionOptions};
use crate::cancel::{CancellationToken, StopModule};
use crate::config::EmbedConfig;
use crate::error::{EmbedError, Result};
use crate::model::{ModelInfo, extract_embedding};
use crate::session::ModelSession;
use crate::tokenizer::{HfTokenizer, Tokenizer};

/// One embedding produced by a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVector {
    pub values: Vec<f32>,
    pub dimension: usize,
    pub is_normalized: bool,
}

impl EmbeddingVector {
    pub fn new(values: Vec<f32>, is_normalized: bool) -> Self {
        Self {
            dimension: values.len(),
            values,
            is_normalized,
        }
    }
}

/// Trait for anything that turns text into vectors
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate the embedding for a single text
    async fn embed_text(&self, text: &str, cancel: &CancellationToken) -> Result<EmbeddingVector>;

    /// Generate embeddings for several texts, stopping at the first failure
    async fn embed_texts(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<EmbeddingVector>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            cancel.check()?;
            vectors.push(self.embed_text(text, cancel).await?);
        }
        Ok(vectors)
    }

    /// Dimension of the vectors this provider produces
    fn embedding_dimension(&self) -> usize;

    /// Human readable model name
    fn model_name(&self) -> &str;

    /// Directory the model was loaded from
    fn model_dir(&self) -> &Path;
}

/// Embedding pipeline over a tokenizer and an inference backend.
pub struct OnnxEmbeddingPipeline<T: Tokenizer = HfTokenizer, B: InferenceBackend = OrtBackend> {
    config: EmbedConfig,
    info: ModelInfo,
    max_length: usize,
    tokenizer: Mutex<T>,
    session: ModelSession<B>,
    observed_dimension: AtomicUsize,
}

impl<T: Tokenizer, B: InferenceBackend> std::fmt::Debug for OnnxEmbeddingPipeline<T, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxEmbeddingPipeline")
            .field("model", &self.info.name)
            .field("family", &self.info.family)
            .field("max_length", &self.max_length)
            .field("session", &self.session)
            .finish()
    }
}

impl OnnxEmbeddingPipeline<HfTokenizer, OrtBackend> {
    /// Reads model metadata and the tokenizer from `config.model_dir`.
    ///
    /// The ONNX session itself is created lazily on the first embedding call.
    pub async fn load(config: EmbedConfig) -> Result<Self> {
        config.validate()?;
        let model_dir = config.model_dir.clone();
        let (info, tokenizer) = tokio::task::spawn_blocking(move || -> Result<_> {
            let info = ModelInfo::from_dir(&model_dir)?;
            let tokenizer = HfTokenizer::load(&model_dir)?;
            Ok((info, tokenizer))
        })
        .await??;
        Ok(Self::with_parts(config, info, tokenizer, Arc::new(OrtBackend)))
    }
}

impl<T: Tokenizer, B: InferenceBackend> OnnxEmbeddingPipeline<T, B> {
    /// Assembles a pipeline from already prepared collaborators.
    pub fn with_parts(config: EmbedConfig, info: ModelInfo, tokenizer: T, backend: Arc<B>) -> Self {
        let max_length = info.effective_max_length(config.max_sequence_length);
        let session = ModelSession::new(
            backend,
            info.model_path.clone(),
            SessionOptions {
                intra_threads: config.thread_count(),
            },
            config.retry.clone(),
        );
        debug!(
            model = %info.name,
            family = %info.family,
            dimension = info.dimension,
            max_length,
            "Embedding pipeline configured"
        );
        Self {
            config,
            info,
            max_length,
            tokenizer: Mutex::new(tokenizer),
            session,
            observed_dimension: AtomicUsize::new(0),
        }
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    pub fn session(&self) -> &ModelSession<B> {
        &self.session
    }

    /// Tokens fed to the model per input.
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Releases the native session; the next call reloads it.
    pub async fn close(&self) {
        self.session.close().await;
    }

    /// Drops tokenizer state and reloads it from the model directory.
    pub fn reload_tokenizer(&self) -> Result<()> {
        let mut tokenizer = self.tokenizer.lock().unwrap_or_else(|e| e.into_inner());
        tokenizer.reset();
        tokenizer.initialize(&self.info.model_dir)
    }

    pub fn set_tokenizer_debug(&self, debug: bool) {
        self.tokenizer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .set_debug(debug);
    }

    fn tokenize(&self, text: &str) -> Result<Vec<i64>> {
        let mut ids = self
            .tokenizer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tokenize(text)?;
        if ids.is_empty() {
            return Err(EmbedError::tokenization("text produced no tokens"));
        }
        if ids.len() > self.max_length {
            debug!("Truncating {} tokens to {}", ids.len(), self.max_length);
            ids.truncate(self.max_length);
            if let Some(last) = ids.last_mut() {
                *last = self.config.sep_token_id;
            }
        }
        Ok(ids)
    }

    async fn embed(&self, text: &str, cancel: &CancellationToken) -> Result<EmbeddingVector> {
        let _active = cancel.enter(StopModule::Embedding);
        cancel.check()?;

        if text.trim().is_empty() {
            return Err(EmbedError::tokenization("cannot embed empty text"));
        }
        let ids = self.tokenize(text)?;
        let len = ids.len();
        cancel.check()?;

        let handle = self.session.acquire().await?;
        let declared = handle.input_names();
        let mut inputs = vec![InputTensor::sequence("input_ids", ids)];
        if declared.iter().any(|n| n == "attention_mask") {
            inputs.push(InputTensor::sequence("attention_mask", vec![1; len]));
        }
        if declared.iter().any(|n| n == "token_type_ids") {
            inputs.push(InputTensor::sequence("token_type_ids", vec![0; len]));
        }
        let outputs = handle.run(inputs, self.config.inference_timeout).await?;
        cancel.check()?;

        let output = outputs
            .first()
            .ok_or_else(|| EmbedError::inference("model returned no outputs"))?;
        let raw = extract_embedding(self.info.family, output, len, self.config.mean_pooling)?;
        self.observe_dimension(raw.len());

        let mut values = anomaly::process_vector(&raw);
        let normalize = self.info.family.should_normalize(self.config.normalize);
        if normalize {
            values = anomaly::normalize(&values);
        }
        if values.is_empty() || values.iter().any(|x| !x.is_finite()) {
            return Err(EmbedError::VectorAnomaly {
                description: format!("{} values, not all finite", values.len()),
            });
        }

        Ok(EmbeddingVector::new(values, normalize))
    }

    fn observe_dimension(&self, actual: usize) {
        let previous = self.observed_dimension.swap(actual, Ordering::SeqCst);
        if previous == 0 && actual != self.info.dimension {
            warn!(
                "Model {} produces {}-dimensional vectors, metadata said {}",
                self.info.name, actual, self.info.dimension
            );
        }
    }
}

#[async_trait]
impl<T: Tokenizer, B: InferenceBackend> EmbeddingProvider for OnnxEmbeddingPipeline<T, B> {
    async fn embed_text(&self, text: &str, cancel: &CancellationToken) -> Result<EmbeddingVector> {
        self.embed(text, cancel).await
    }

    fn embedding_dimension(&self) -> usize {
        match self.observed_dimension.load(Ordering::SeqCst) {
            0 => self.info.dimension,
            observed => observed,
        }
    }

    fn model_name(&self) -> &str {
        &self.info.name
    }

    fn model_dir(&self) -> &Path {
        &self.info.model_dir
    }
}

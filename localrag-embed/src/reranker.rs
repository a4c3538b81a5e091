//! Cross-encoder reranking.
//!
//! ## Key Components
//!
//! - **Reranker**: scores `(query, document)` pairs with a second model and
//!   returns the best `top_k` documents, best first.
//! - **RerankResult**: a scored document that remembers its position in the
//!   input list.
//!
//! Documents are scored one inference call at a time, in batches of
//! `batch_size`, each call bounded by the configured timeout. A document that
//! times out or fails inference is left out; it never aborts the whole call.
//! When the model cannot be used at all the input order is passed through with
//! synthetic, strictly decreasing scores, so callers always get the same shape
//! of answer.

use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::anomaly::{self, AnomalyKind};
use crate::backend::{InferenceBackend, InputTensor, OrtBackend, SessionOptions};
use crate::cancel::{CancellationToken, StopModule};
use crate::config::RerankConfig;
use crate::error::{EmbedError, Result};
use crate::model::ModelInfo;
use crate::session::ModelSession;
use crate::tokenizer::{HfTokenizer, Tokenizer};

/// Score assigned when the logits cannot be trusted.
pub const NEUTRAL_SCORE: f32 = 0.5;

/// A document with its relevance score.
#[derive(Debug, Clone, PartialEq)]
pub struct RerankResult {
    pub text: String,
    pub score: f32,
    /// Position of the document in the list passed to [`Reranker::rerank`]
    pub original_index: usize,
}

/// Emitted after each scored document.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RerankProgress {
    /// 1-based count of documents handled so far
    pub index: usize,
    pub total: usize,
    pub score: f32,
}

/// Sigmoid that stays finite for any input.
pub fn sigmoid(x: f32) -> f32 {
    if x.is_nan() {
        NEUTRAL_SCORE
    } else if x > 700.0 {
        1.0
    } else if x < -700.0 {
        0.0
    } else {
        1.0 / (1.0 + (-x).exp())
    }
}

/// The input documents in their original order with strictly decreasing scores.
pub fn passthrough(documents: &[String], top_k: usize) -> Vec<RerankResult> {
    documents
        .iter()
        .take(top_k)
        .enumerate()
        .map(|(i, text)| RerankResult {
            text: text.clone(),
            score: 1.0 - i as f32 * 0.01,
            original_index: i,
        })
        .collect()
}

/// Turns raw logits into a relevance score.
///
/// Single-logit models are scored with `sigmoid(l0)`; two-logit models with
/// `sigmoid(l1)`, the positive class.
pub fn score_from_logits(logits: &[f32]) -> f32 {
    let detected = anomaly::detect_anomalies(logits);
    let logits = if detected.is_anomalous && detected.kind != AnomalyKind::AllZero {
        warn!("Reranker logits anomalous: {}", detected.description);
        match anomaly::repair_vector(logits, detected.kind) {
            Some(repaired) => repaired,
            None => return NEUTRAL_SCORE,
        }
    } else {
        logits.to_vec()
    };

    match logits.as_slice() {
        [] => NEUTRAL_SCORE,
        [single] => sigmoid(*single),
        [negative, positive, ..] => {
            let max = negative.max(*positive);
            let (en, ep) = ((negative - max).exp(), (positive - max).exp());
            debug!("softmax positive probability {:.4}", ep / (en + ep));
            sigmoid(*positive)
        }
    }
}

/// Cross-encoder reranking engine.
pub struct Reranker<T: Tokenizer = HfTokenizer, B: InferenceBackend = OrtBackend> {
    config: RerankConfig,
    model_name: String,
    tokenizer: Mutex<T>,
    session: ModelSession<B>,
}

impl<T: Tokenizer, B: InferenceBackend> std::fmt::Debug for Reranker<T, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reranker")
            .field("model", &self.model_name)
            .field("batch_size", &self.config.batch_size)
            .field("session", &self.session)
            .finish()
    }
}

impl Reranker<HfTokenizer, OrtBackend> {
    /// Locates the model and tokenizer in `config.model_dir`. The session loads lazily.
    pub async fn load(config: RerankConfig) -> Result<Self> {
        let model_dir = config.model_dir.clone();
        let (info, tokenizer) = tokio::task::spawn_blocking(move || -> Result<_> {
            let info = ModelInfo::from_dir(&model_dir)?;
            let tokenizer = HfTokenizer::load(&model_dir)?;
            Ok((info, tokenizer))
        })
        .await??;
        let config = RerankConfig {
            max_sequence_length: info.effective_max_length(config.max_sequence_length),
            ..config
        };
        Ok(Self::with_parts(config, info.model_path, tokenizer, Arc::new(OrtBackend)))
    }
}

impl<T: Tokenizer, B: InferenceBackend> Reranker<T, B> {
    pub fn with_parts(config: RerankConfig, model_path: PathBuf, tokenizer: T, backend: Arc<B>) -> Self {
        let model_name = config
            .model_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "reranker".to_string());
        let session = ModelSession::new(
            backend,
            model_path,
            SessionOptions {
                intra_threads: config.thread_count(),
            },
            config.retry.clone(),
        );
        Self {
            config,
            model_name,
            tokenizer: Mutex::new(tokenizer),
            session,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn session(&self) -> &ModelSession<B> {
        &self.session
    }

    pub async fn close(&self) {
        self.session.close().await;
    }

    fn tokenize(&self, text: &str) -> Result<Vec<i64>> {
        let mut ids = self
            .tokenizer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tokenize(text)?;
        ids.truncate(self.config.max_sequence_length);
        Ok(ids)
    }

    /// Scores `documents` against `query` and returns at most `top_k` of them, best first.
    ///
    /// Equal scores keep their input order. Only tokenizer failures are returned
    /// as errors; an unusable model, a blank query or a stop request yield
    /// [`passthrough`] instead.
    pub async fn rerank<F>(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<Vec<RerankResult>>
    where
        F: FnMut(RerankProgress) + Send,
    {
        if documents.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let _active = cancel.enter(StopModule::Reranker);
        if query.trim().is_empty() {
            warn!("Empty rerank query, keeping original order");
            return Ok(passthrough(documents, top_k));
        }
        if cancel.is_cancelled() {
            return Ok(passthrough(documents, top_k));
        }

        match self.session.acquire().await {
            Ok(handle) => drop(handle),
            Err(e) => {
                warn!("Reranker {} unavailable, keeping original order: {}", self.model_name, e);
                return Ok(passthrough(documents, top_k));
            }
        }

        let total = documents.len();
        let mut results = Vec::with_capacity(total);
        let batch_size = self.config.batch_size.max(1);
        for (batch_index, batch) in documents.chunks(batch_size).enumerate() {
            debug!("Scoring rerank batch {} ({} documents)", batch_index, batch.len());
            for (offset, document) in batch.iter().enumerate() {
                let index = batch_index * batch_size + offset;
                if cancel.is_cancelled() {
                    info!("Rerank stopped after {} of {} documents", index, total);
                    return Ok(passthrough(documents, top_k));
                }
                if document.trim().is_empty() {
                    debug!("Skipping blank document {}", index);
                    continue;
                }

                let Some(score) = self.score(query, document).await? else {
                    continue;
                };
                on_progress(RerankProgress {
                    index: index + 1,
                    total,
                    score,
                });
                results.push(RerankResult {
                    text: document.clone(),
                    score,
                    original_index: index,
                });
            }
        }

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        results.truncate(top_k);
        Ok(results)
    }

    /// `Ok(None)` when the document has to be skipped.
    async fn score(&self, query: &str, document: &str) -> Result<Option<f32>> {
        let input = format!("[Q] {query} [SEP] [D] {document} [SEP]");
        let ids = self.tokenize(&input)?;
        if ids.is_empty() {
            return Ok(None);
        }
        let len = ids.len();

        let handle = match self.session.acquire().await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Skipping document, reranker session unavailable: {}", e);
                return Ok(None);
            }
        };
        let declared = handle.input_names();
        let mut inputs = vec![InputTensor::sequence("input_ids", ids)];
        if declared.iter().any(|n| n == "attention_mask") {
            inputs.push(InputTensor::sequence("attention_mask", vec![1; len]));
        }
        if declared.iter().any(|n| n == "token_type_ids") {
            inputs.push(InputTensor::sequence("token_type_ids", vec![0; len]));
        }

        let outputs = match handle.run(inputs, self.config.inference_timeout).await {
            Ok(outputs) => outputs,
            Err(e @ EmbedError::InferenceTimeout { .. }) => {
                warn!("Skipping document: {}", e);
                return Ok(None);
            }
            Err(e) => {
                warn!("Skipping document, inference failed: {}", e);
                return Ok(None);
            }
        };

        let Some(output) = outputs.first() else {
            warn!("Skipping document, reranker returned no outputs");
            return Ok(None);
        };
        let width = output.shape.last().copied().unwrap_or(output.data.len());
        let logits = &output.data[..width.min(output.data.len())];
        Ok(Some(score_from_logits(logits)))
    }
}

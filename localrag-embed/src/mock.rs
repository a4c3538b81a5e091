//! Deterministic stand-ins for the tokenizer and inference backend.
//!
//! Used by the test suites of this workspace and by dry runs that must not
//! load a real model. Token ids are derived from word hashes, and embeddings
//! are bags of hashed one-hot rows, so texts sharing words produce similar
//! vectors after mean pooling.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{InferenceBackend, InputTensor, OutputTensor, SessionOptions};
use crate::error::{EmbedError, Result};
use crate::tokenizer::Tokenizer;

/// Stable token id for a word (FNV-1a over its lowercase bytes).
pub fn token_id(word: &str) -> i64 {
    let mut h: u32 = 0x811c9dc5;
    for b in word.to_lowercase().as_bytes() {
        h ^= *b as u32;
        h = h.wrapping_mul(0x01000193);
    }
    1 + (h % 29_999) as i64
}

/// Whitespace tokenizer producing [`token_id`]s.
#[derive(Debug, Default)]
pub struct MockTokenizer {
    initialized: bool,
    debug: bool,
    fail_on: Option<String>,
}

impl MockTokenizer {
    /// An already initialized tokenizer.
    pub fn new() -> Self {
        Self {
            initialized: true,
            ..Self::default()
        }
    }

    /// Fails tokenization of any text containing `needle`.
    pub fn failing_on(needle: impl Into<String>) -> Self {
        Self {
            fail_on: Some(needle.into()),
            ..Self::new()
        }
    }
}

impl Tokenizer for MockTokenizer {
    fn initialize(&mut self, _model_dir: &Path) -> Result<()> {
        self.initialized = true;
        Ok(())
    }

    fn tokenize(&self, text: &str) -> Result<Vec<i64>> {
        if !self.initialized {
            return Err(EmbedError::tokenization("tokenizer is not initialized"));
        }
        if let Some(needle) = &self.fail_on {
            if text.contains(needle.as_str()) {
                return Err(EmbedError::tokenization(format!("cannot tokenize {needle:?}")));
            }
        }
        Ok(text.split_whitespace().map(token_id).collect())
    }

    fn reset(&mut self) {
        self.initialized = false;
    }

    fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}

type OutputFn = dyn Fn(&[i64]) -> Option<OutputTensor> + Send + Sync;

/// Handle returned by [`MockBackend`].
#[derive(Debug)]
pub struct MockHandle {
    pub id: usize,
}

/// Instrumented backend. Counts loads and closes and can inject failures.
pub struct MockBackend {
    output: Arc<OutputFn>,
    input_names: Vec<String>,
    load_delay: Duration,
    failing_loads: AtomicUsize,
    slow_tokens: Vec<(i64, Duration)>,
    failing_tokens: HashSet<i64>,
    pub loads: AtomicUsize,
    pub close_count: AtomicUsize,
    pub runs: AtomicUsize,
    /// Input names fed to each run, in call order
    pub seen_inputs: Mutex<Vec<Vec<String>>>,
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend")
            .field("input_names", &self.input_names)
            .field("loads", &self.load_count())
            .finish()
    }
}

impl MockBackend {
    pub fn new<F>(output: F) -> Self
    where
        F: Fn(&[i64]) -> Option<OutputTensor> + Send + Sync + 'static,
    {
        Self {
            output: Arc::new(output),
            input_names: vec!["input_ids".to_string(), "attention_mask".to_string()],
            load_delay: Duration::ZERO,
            failing_loads: AtomicUsize::new(0),
            slow_tokens: Vec::new(),
            failing_tokens: HashSet::new(),
            loads: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
            seen_inputs: Mutex::new(Vec::new()),
        }
    }

    /// Emits `[1, seq, dimension]` hidden states: row `p` is one-hot at `id_p % dimension`
    /// plus a small constant offset.
    pub fn embedding(dimension: usize) -> Self {
        Self::new(move |ids| {
            let seq = ids.len().max(1);
            let mut data = vec![0.01f32; seq * dimension];
            for (p, &id) in ids.iter().enumerate() {
                let d = id.unsigned_abs() as usize % dimension.max(1);
                data[p * dimension + d] += 1.0;
            }
            Some(OutputTensor {
                shape: vec![1, seq, dimension],
                data,
            })
        })
    }

    /// Emits `[1, n]` logits computed by `logits`.
    pub fn logits<F>(logits: F) -> Self
    where
        F: Fn(&[i64]) -> Vec<f32> + Send + Sync + 'static,
    {
        Self::new(move |ids| {
            let values = logits(ids);
            Some(OutputTensor {
                shape: vec![1, values.len()],
                data: values,
            })
        })
    }

    pub fn with_input_names(mut self, names: &[&str]) -> Self {
        self.input_names = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// The first `count` loads fail.
    pub fn with_failing_loads(self, count: usize) -> Self {
        self.failing_loads.store(count, Ordering::SeqCst);
        self
    }

    /// Runs containing `token` sleep for `delay` before answering.
    pub fn with_slow_token(mut self, token: i64, delay: Duration) -> Self {
        self.slow_tokens.push((token, delay));
        self
    }

    /// Runs containing `token` fail with an inference error.
    pub fn with_failing_token(mut self, token: i64) -> Self {
        self.failing_tokens.insert(token);
        self
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl InferenceBackend for MockBackend {
    type Handle = MockHandle;

    fn create_session(&self, model_path: &Path, _options: &SessionOptions) -> Result<MockHandle> {
        let id = self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            std::thread::sleep(self.load_delay);
        }
        let failing = self
            .failing_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EmbedError::model_load(model_path, "injected load failure"));
        }
        Ok(MockHandle { id })
    }

    fn input_names(&self, _handle: &MockHandle) -> Vec<String> {
        self.input_names.clone()
    }

    fn run(&self, _handle: &mut MockHandle, inputs: Vec<InputTensor>) -> Result<Vec<OutputTensor>> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen_inputs.lock() {
            seen.push(inputs.iter().map(|i| i.name.clone()).collect());
        }

        let ids = inputs
            .iter()
            .find(|i| i.name == "input_ids")
            .map(|i| i.data.as_slice())
            .ok_or_else(|| EmbedError::inference("input_ids missing"))?;

        for (token, delay) in &self.slow_tokens {
            if ids.contains(token) {
                std::thread::sleep(*delay);
            }
        }
        if ids.iter().any(|id| self.failing_tokens.contains(id)) {
            return Err(EmbedError::inference("injected inference failure"));
        }

        (self.output)(ids)
            .map(|output| vec![output])
            .ok_or_else(|| EmbedError::inference("mock produced no output"))
    }

    fn close(&self, _handle: MockHandle) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

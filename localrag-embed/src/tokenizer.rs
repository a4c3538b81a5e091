//! Tokenizer seam and its HuggingFace `tokenizers` implementation

use std::path::Path;

use tracing::{debug, info};

use crate::error::{EmbedError, Result};
use crate::model::find_tokenizer_file;

/// Text to token ids.
///
/// The pipeline owns the tokenizer's lifecycle (initialize, reset) but not
/// how tokens are produced.
pub trait Tokenizer: Send + Sync + 'static {
    /// Loads vocabulary for the model in `model_dir`.
    fn initialize(&mut self, model_dir: &Path) -> Result<()>;

    /// Token ids for `text`, including any special tokens the model expects.
    fn tokenize(&self, text: &str) -> Result<Vec<i64>>;

    /// Drops loaded state; [`Tokenizer::initialize`] must be called again.
    fn reset(&mut self);

    fn set_debug(&mut self, debug: bool);

    fn is_initialized(&self) -> bool;
}

/// `tokenizer.json` driven tokenizer.
#[derive(Default)]
pub struct HfTokenizer {
    inner: Option<tokenizers::Tokenizer>,
    debug: bool,
}

impl std::fmt::Debug for HfTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfTokenizer")
            .field("initialized", &self.inner.is_some())
            .field("debug", &self.debug)
            .finish()
    }
}

impl HfTokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and initializes a tokenizer for `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self> {
        let mut tokenizer = Self::new();
        tokenizer.initialize(model_dir)?;
        Ok(tokenizer)
    }
}

impl Tokenizer for HfTokenizer {
    fn initialize(&mut self, model_dir: &Path) -> Result<()> {
        let path = find_tokenizer_file(model_dir)?;
        let tokenizer = tokenizers::Tokenizer::from_file(&path)
            .map_err(|e| EmbedError::model_load(&path, e.to_string()))?;
        info!("Loaded tokenizer from {}", path.display());
        self.inner = Some(tokenizer);
        Ok(())
    }

    fn tokenize(&self, text: &str) -> Result<Vec<i64>> {
        let tokenizer = self
            .inner
            .as_ref()
            .ok_or_else(|| EmbedError::tokenization("tokenizer is not initialized"))?;
        let encoding = tokenizer
            .encode(text, true)
            .map_err(|e| EmbedError::tokenization(e.to_string()))?;
        let ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        if self.debug {
            debug!(tokens = ids.len(), "Tokenized {:?} -> {:?}", text, encoding.get_tokens());
        }
        Ok(ids)
    }

    fn reset(&mut self) {
        self.inner = None;
    }

    fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    fn is_initialized(&self) -> bool {
        self.inner.is_some()
    }
}

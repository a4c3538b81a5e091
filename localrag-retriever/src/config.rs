//! Configuration provider for the retriever.
//!
//! Settings come from an optional TOML file. Every section and field has a
//! default, so a missing file or a partial one is fine:
//!
//! ```toml
//! [chunking]
//! chunk_size = 500
//! chunk_overlap = 100
//! min_chunk_size = 10
//!
//! [retrieval]
//! search_depth = 20
//! rerank_count = 5
//! rerank_batch_size = 8
//!
//! [model]
//! max_sequence_length = 512
//! normalize_embeddings = true
//!
//! [paths]
//! knowledge_bases = "knowledge_bases"
//! embedding_models = "models/embeddings"
//! reranker_models = "models/rerankers"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use localrag_context::TextSplitter;
use localrag_embed::{EmbedConfig, RerankConfig};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_CONFIG_FILE: &str = "localrag.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub model: ModelConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: localrag_context::text::DEFAULT_CHUNK_SIZE,
            chunk_overlap: localrag_context::text::DEFAULT_CHUNK_OVERLAP,
            min_chunk_size: localrag_context::text::DEFAULT_MIN_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Candidates fetched by similarity search
    pub search_depth: usize,
    /// Passages kept after reranking
    pub rerank_count: usize,
    pub rerank_batch_size: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            search_depth: 20,
            rerank_count: 5,
            rerank_batch_size: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub max_sequence_length: usize,
    pub threads: Option<usize>,
    pub normalize_embeddings: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            max_sequence_length: 512,
            threads: None,
            normalize_embeddings: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub knowledge_bases: PathBuf,
    pub embedding_models: PathBuf,
    pub reranker_models: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            knowledge_bases: PathBuf::from("knowledge_bases"),
            embedding_models: PathBuf::from("models/embeddings"),
            reranker_models: PathBuf::from("models/rerankers"),
        }
    }
}

impl RagConfig {
    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Directory of the knowledge base called `name`
    pub fn kb_dir(&self, name: &str) -> PathBuf {
        self.paths.knowledge_bases.join(name)
    }

    pub fn splitter(&self) -> TextSplitter {
        TextSplitter::new(
            self.chunking.chunk_size,
            self.chunking.chunk_overlap,
            self.chunking.min_chunk_size,
        )
    }

    pub fn embed_config(&self, model_dir: &Path) -> EmbedConfig {
        let config = EmbedConfig::new(model_dir)
            .with_max_sequence_length(self.model.max_sequence_length)
            .with_normalize(self.model.normalize_embeddings);
        match self.model.threads {
            Some(threads) => config.with_threads(threads),
            None => config,
        }
    }

    pub fn rerank_config(&self, model_dir: &Path) -> RerankConfig {
        let config = RerankConfig {
            max_sequence_length: self.model.max_sequence_length,
            ..RerankConfig::new(model_dir)
        }
        .with_batch_size(self.retrieval.rerank_batch_size);
        match self.model.threads {
            Some(threads) => config.with_threads(threads),
            None => config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = RagConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, RagConfig::default());
        assert_eq!(config.retrieval.search_depth, 20);
        assert_eq!(config.retrieval.rerank_count, 5);
        assert_eq!(config.chunking.chunk_size, 500);
        assert!(config.model.normalize_embeddings);
    }

    #[test]
    fn test_partial_file() {
        let config = RagConfig::from_toml(
            r#"
            [retrieval]
            rerank_count = 3

            [model]
            threads = 2
            normalize_embeddings = false
            "#,
        )
        .unwrap();
        assert_eq!(config.retrieval.rerank_count, 3);
        assert_eq!(config.retrieval.search_depth, 20);
        assert_eq!(config.model.threads, Some(2));
        assert_eq!(config.chunking, ChunkingConfig::default());
    }

    #[test]
    fn test_invalid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[retrieval]\nsearch_depth = \"deep\"\n").unwrap();
        let err = RagConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid config"));
    }

    #[test]
    fn test_model_configs() {
        let mut config = RagConfig::default();
        config.model.threads = Some(3);
        config.model.max_sequence_length = 256;
        config.retrieval.rerank_batch_size = 4;

        let embed = config.embed_config(Path::new("/models/bge"));
        assert_eq!(embed.model_dir, PathBuf::from("/models/bge"));
        assert_eq!(embed.max_sequence_length, 256);
        assert_eq!(embed.thread_count(), 3);

        let rerank = config.rerank_config(Path::new("/models/rr"));
        assert_eq!(rerank.batch_size, 4);
        assert_eq!(rerank.max_sequence_length, 256);
        assert_eq!(rerank.thread_count(), 3);
    }

    #[test]
    fn test_kb_dir() {
        let config = RagConfig::default();
        assert_eq!(config.kb_dir("notes"), PathBuf::from("knowledge_bases/notes"));
    }
}

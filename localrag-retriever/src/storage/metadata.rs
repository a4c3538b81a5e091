//! The `metadata.json` sidecar of a knowledge base.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Result;

pub const METADATA_FILE: &str = "metadata.json";
pub const VECTOR_STORE_TYPE: &str = "sqlite";

/// Models and counts describing one knowledge base.
///
/// Every vector in the knowledge base has `embedding_dimension` entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBaseMetadata {
    pub embedding_model: String,
    pub embedding_dimension: usize,
    #[serde(rename = "modeldir")]
    pub model_dir: PathBuf,
    /// `None` is written as `"none"`
    #[serde(rename = "rerankerdir", with = "reranker_dir")]
    pub reranker_dir: Option<PathBuf>,
    pub chunk_count: usize,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub file_count: usize,
    #[serde(default = "default_store_type")]
    pub vector_store_type: String,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

fn default_store_type() -> String {
    VECTOR_STORE_TYPE.to_string()
}

mod reranker_dir {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::path::PathBuf;

    const NONE: &str = "none";

    pub fn serialize<S: Serializer>(value: &Option<PathBuf>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(path) => s.serialize_str(&path.to_string_lossy()),
            None => s.serialize_str(NONE),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<PathBuf>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        Ok(raw
            .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case(NONE))
            .map(PathBuf::from))
    }
}

impl KnowledgeBaseMetadata {
    pub fn new(
        embedding_model: impl Into<String>,
        embedding_dimension: usize,
        model_dir: impl Into<PathBuf>,
        reranker_dir: Option<PathBuf>,
    ) -> Self {
        let now = Utc::now();
        Self {
            embedding_model: embedding_model.into(),
            embedding_dimension,
            model_dir: model_dir.into(),
            reranker_dir,
            chunk_count: 0,
            files: Vec::new(),
            file_count: 0,
            vector_store_type: default_store_type(),
            created_at: now,
            last_modified: now,
        }
    }

    pub fn path(kb_dir: &Path) -> PathBuf {
        kb_dir.join(METADATA_FILE)
    }

    /// Reads the sidecar, or `None` if the knowledge base has none yet.
    pub fn load(kb_dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(kb_dir);
        if !path.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Writes the sidecar through a temporary file and a rename.
    pub fn save(&self, kb_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(kb_dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(kb_dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(Self::path(kb_dir)).map_err(|e| e.error)?;
        debug!("Saved metadata for {}", kb_dir.display());
        Ok(())
    }

    /// Records sources added by a build.
    pub fn record_files<I: IntoIterator<Item = String>>(&mut self, files: I, chunks_added: usize) {
        for file in files {
            if !self.files.contains(&file) {
                self.files.push(file);
            }
        }
        self.file_count = self.files.len();
        self.chunk_count += chunks_added;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_modified = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let mut metadata = KnowledgeBaseMetadata::new("bge-small", 384, "/models/bge-small", None);
        metadata.record_files(["a.txt".to_string(), "b.txt".to_string()], 7);
        metadata.save(dir.path()).unwrap();

        let loaded = KnowledgeBaseMetadata::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, metadata);
        assert_eq!(loaded.file_count, 2);
        assert_eq!(loaded.chunk_count, 7);
    }

    #[test]
    fn test_wire_field_names() {
        let metadata = KnowledgeBaseMetadata::new(
            "bge-small",
            384,
            "/models/bge-small",
            Some(PathBuf::from("/models/reranker")),
        );
        let json: serde_json::Value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["modeldir"], "/models/bge-small");
        assert_eq!(json["rerankerdir"], "/models/reranker");
        assert_eq!(json["embedding_dimension"], 384);
        assert_eq!(json["vector_store_type"], "sqlite");
    }

    #[test]
    fn test_reranker_none_round_trip() {
        let dir = tempdir().unwrap();
        let metadata = KnowledgeBaseMetadata::new("m", 8, "/models/m", None);
        metadata.save(dir.path()).unwrap();

        let raw = std::fs::read_to_string(KnowledgeBaseMetadata::path(dir.path())).unwrap();
        assert!(raw.contains("\"rerankerdir\": \"none\""));
        let loaded = KnowledgeBaseMetadata::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.reranker_dir, None);
    }

    #[test]
    fn test_missing_metadata() {
        let dir = tempdir().unwrap();
        assert!(KnowledgeBaseMetadata::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_record_files_deduplicates() {
        let mut metadata = KnowledgeBaseMetadata::new("m", 8, "/models/m", None);
        metadata.record_files(["a".to_string()], 2);
        metadata.record_files(["a".to_string(), "b".to_string()], 3);
        assert_eq!(metadata.files, vec!["a", "b"]);
        assert_eq!(metadata.chunk_count, 5);
    }
}

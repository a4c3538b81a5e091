//! Repointing a knowledge base at model directories that moved.
//!
//! The metadata records where the embedding and reranker models lived when the
//! knowledge base was built. When those directories disappear, a replacement
//! is picked from the configured models root: a directory with the same name
//! if there is one, otherwise the first directory in sorted order.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::storage::KnowledgeBaseMetadata;

/// A model directory that was replaced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Repointed {
    pub from: PathBuf,
    pub to: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RepointReport {
    pub model_dir: Option<Repointed>,
    pub reranker_dir: Option<Repointed>,
    pub warnings: Vec<String>,
}

impl RepointReport {
    pub fn changed(&self) -> bool {
        self.model_dir.is_some() || self.reranker_dir.is_some()
    }
}

/// Replaces missing model directories in the metadata of `kb_dir`.
pub fn repoint_models(kb_dir: &Path, embedding_models: &Path, reranker_models: &Path) -> Result<RepointReport> {
    let mut metadata = load_metadata(kb_dir)?;
    let mut report = RepointReport::default();

    if !metadata.model_dir.is_dir() {
        match find_replacement(&metadata.model_dir, embedding_models)? {
            Some(to) => {
                report.model_dir = Some(Repointed {
                    from: std::mem::replace(&mut metadata.model_dir, to.clone()),
                    to,
                });
            }
            None => report.warnings.push(format!(
                "Embedding model {} is missing and {} holds no replacement",
                metadata.model_dir.display(),
                embedding_models.display()
            )),
        }
    }

    // A knowledge base without a reranker keeps "none"
    if let Some(reranker_dir) = metadata.reranker_dir.clone() {
        if !reranker_dir.is_dir() {
            match find_replacement(&reranker_dir, reranker_models)? {
                Some(to) => {
                    metadata.reranker_dir = Some(to.clone());
                    report.reranker_dir = Some(Repointed {
                        from: reranker_dir,
                        to,
                    });
                }
                None => report.warnings.push(format!(
                    "Reranker {} is missing and {} holds no replacement",
                    reranker_dir.display(),
                    reranker_models.display()
                )),
            }
        }
    }

    for warning in &report.warnings {
        warn!("{}", warning);
    }
    if report.changed() {
        metadata.touch();
        metadata.save(kb_dir)?;
        info!("Repointed models of {}", kb_dir.display());
    }
    Ok(report)
}

/// Sets the model directories of `kb_dir` explicitly.
///
/// `reranker_dir` of `Some(None)` records that the knowledge base has no reranker.
pub fn set_model_dirs(
    kb_dir: &Path,
    model_dir: Option<PathBuf>,
    reranker_dir: Option<Option<PathBuf>>,
) -> Result<KnowledgeBaseMetadata> {
    let mut metadata = load_metadata(kb_dir)?;
    if let Some(model_dir) = model_dir {
        metadata.model_dir = model_dir;
    }
    if let Some(reranker_dir) = reranker_dir {
        metadata.reranker_dir = reranker_dir;
    }
    metadata.touch();
    metadata.save(kb_dir)?;
    Ok(metadata)
}

/// Picks a directory under `root` to stand in for `missing`.
pub fn find_replacement(missing: &Path, root: &Path) -> Result<Option<PathBuf>> {
    if !root.is_dir() {
        return Ok(None);
    }

    if let Some(name) = missing.file_name() {
        let same_name = root.join(name);
        if same_name.is_dir() {
            return Ok(Some(same_name));
        }
    }

    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root).with_context(|| format!("Failed to list {}", root.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs.into_iter().next())
}

fn load_metadata(kb_dir: &Path) -> Result<KnowledgeBaseMetadata> {
    KnowledgeBaseMetadata::load(kb_dir)?
        .with_context(|| format!("No knowledge base metadata in {}", kb_dir.display()))
}

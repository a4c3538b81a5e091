//! Knowledge base build orchestration
//!
//! A build turns a list of files into a persisted knowledge base in two stages.
//!
//! ```text
//! Idle → TextExtraction → Vectorization → Completed
//!              │                │
//!              └──── Cancelled ─┘
//! ```
//!
//! ## Key Components
//!
//! - **KnowledgeBaseBuilder**: runs builds and reports [`RagEvent`]s
//! - **BuildRequest**: what to build and how ([`BuildMode`])
//! - **BuildTask**: progress counters and timestamps of one build
//!
//! ## Guarantees
//!
//! - Only one build writes to a knowledge base at a time, across processes.
//!   The builder holds an exclusive lock on `build.lock` in the knowledge base
//!   directory for the whole build; a second request for the same name fails
//!   with [`StoreError::BuildInProgress`].
//! - Cancellation is checked between files and between chunks. An overwrite
//!   build that stops leaves the previous knowledge base untouched; an append
//!   build keeps the files it had fully stored and nothing else.
//! - A dimension mismatch in append mode is returned as
//!   [`StoreError::DimensionMismatch`] before anything is written.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use localrag_context::{TextChunk, TextSplitter};
use localrag_embed::{CancellationToken, EmbeddingProvider, StopModule, process_vector};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::events::{EventSink, RagEvent};
use crate::retrieval::build_mode::BuildMode;
use crate::storage::sqlite_store::StoreIdentity;
use crate::storage::{ChunkRecord, FileHash, SqliteVectorStore, StoreError, VectorStore};

pub const INTERMEDIATE_FILE: &str = "intermediate_chunks.json";
pub const LOCK_FILE: &str = "build.lock";

/// Where a build currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStage {
    Idle,
    TextExtraction,
    Vectorization,
    Completed,
    Cancelled,
}

impl std::fmt::Display for BuildStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildStage::Idle => write!(f, "idle"),
            BuildStage::TextExtraction => write!(f, "text extraction"),
            BuildStage::Vectorization => write!(f, "vectorization"),
            BuildStage::Completed => write!(f, "completed"),
            BuildStage::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A request to build (or extend) one knowledge base.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRequest {
    pub kb_name: String,
    pub files: Vec<PathBuf>,
    pub mode: BuildMode,
    /// Recorded in the metadata for query-time reranking
    pub reranker_dir: Option<PathBuf>,
}

impl BuildRequest {
    pub fn new(kb_name: impl Into<String>, files: Vec<PathBuf>, mode: BuildMode) -> Self {
        Self {
            kb_name: kb_name.into(),
            files,
            mode,
            reranker_dir: None,
        }
    }

    pub fn with_reranker_dir(mut self, reranker_dir: impl Into<PathBuf>) -> Self {
        self.reranker_dir = Some(reranker_dir.into());
        self
    }
}

/// Progress and outcome of one build.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildTask {
    pub kb_name: String,
    pub mode: BuildMode,
    pub stage: BuildStage,
    pub files_total: usize,
    pub files_processed: usize,
    /// Files left out because their content is already stored
    pub files_skipped: usize,
    pub chunks_total: usize,
    pub chunks_processed: usize,
    pub chunks_written: usize,
    /// Stage that was running when the build was stopped
    pub stopped_during: Option<BuildStage>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub warnings: Vec<String>,
}

impl BuildTask {
    fn new(kb_name: &str, mode: BuildMode, files_total: usize) -> Self {
        Self {
            kb_name: kb_name.to_string(),
            mode,
            stage: BuildStage::Idle,
            files_total,
            files_processed: 0,
            files_skipped: 0,
            chunks_total: 0,
            chunks_processed: 0,
            chunks_written: 0,
            stopped_during: None,
            started_at: Utc::now(),
            finished_at: None,
            warnings: Vec::new(),
        }
    }

    /// Overall progress: extraction covers 0-50%, vectorization 50-100%.
    ///
    /// A stopped build reports how far it got before stopping.
    pub fn percentage(&self) -> f32 {
        match self.stage {
            BuildStage::Cancelled => self
                .stopped_during
                .map_or(0.0, |stage| self.percentage_in(stage)),
            stage => self.percentage_in(stage),
        }
    }

    fn percentage_in(&self, stage: BuildStage) -> f32 {
        fn ratio(done: usize, total: usize) -> f32 {
            if total == 0 {
                1.0
            } else {
                done as f32 / total as f32
            }
        }
        match stage {
            BuildStage::Idle | BuildStage::Cancelled => 0.0,
            BuildStage::TextExtraction => ratio(self.files_processed, self.files_total) * 50.0,
            BuildStage::Vectorization => {
                50.0 + ratio(self.chunks_processed, self.chunks_total) * 50.0
            }
            BuildStage::Completed => 100.0,
        }
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at.unwrap_or_else(Utc::now) - self.started_at
    }
}

#[derive(Debug, Clone)]
struct ExtractedFile {
    source: String,
    file_hash: FileHash,
    chunks: Vec<TextChunk>,
}

#[derive(Debug, Serialize)]
struct IntermediateChunk<'a> {
    text: &'a str,
    source: &'a str,
    chunk_index: usize,
}

/// Holds the writer role for one knowledge base until dropped.
struct WriterLock {
    active: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl WriterLock {
    fn acquire(active: &Arc<Mutex<HashSet<String>>>, name: &str) -> std::result::Result<Self, StoreError> {
        let mut names = active.lock().unwrap_or_else(|e| e.into_inner());
        if !names.insert(name.to_string()) {
            return Err(StoreError::BuildInProgress {
                name: name.to_string(),
            });
        }
        Ok(Self {
            active: Arc::clone(active),
            name: name.to_string(),
        })
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.name);
    }
}

/// Builds knowledge bases under one root directory.
#[derive(Clone)]
pub struct KnowledgeBaseBuilder {
    kb_root: PathBuf,
    splitter: TextSplitter,
    embedder: Arc<dyn EmbeddingProvider>,
    events: EventSink,
    active: Arc<Mutex<HashSet<String>>>,
}

impl std::fmt::Debug for KnowledgeBaseBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeBaseBuilder")
            .field("kb_root", &self.kb_root)
            .field("embedder", &self.embedder.model_name())
            .finish()
    }
}

impl KnowledgeBaseBuilder {
    pub fn new(kb_root: impl Into<PathBuf>, splitter: TextSplitter, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            kb_root: kb_root.into(),
            splitter,
            embedder,
            events: EventSink::disabled(),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn kb_dir(&self, name: &str) -> PathBuf {
        self.kb_root.join(name)
    }

    /// Whether a build for `name` is running
    pub fn is_building(&self, name: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }

    /// Runs a build to completion or until `cancel` fires.
    ///
    /// A stopped build is not an error: the returned task has stage
    /// [`BuildStage::Cancelled`].
    pub async fn build(&self, request: BuildRequest, cancel: &CancellationToken) -> Result<BuildTask> {
        validate_kb_name(&request.kb_name)?;
        let kb_dir = self.kb_dir(&request.kb_name);
        let mut lock_file = open_lock_file(&kb_dir)?;
        let _held = lock_file
            .try_write()
            .map_err(|e| lock_error(e, &request.kb_name))?;
        let _writer = WriterLock::acquire(&self.active, &request.kb_name)?;
        let _active = cancel.enter(StopModule::Builder);

        let mut task = BuildTask::new(&request.kb_name, request.mode, request.files.len());
        info!(
            "Building knowledge base '{}' from {} files ({} mode)",
            request.kb_name,
            request.files.len(),
            request.mode
        );

        let result = self.run(&request, &kb_dir, &mut task, cancel).await;
        remove_intermediate(&kb_dir);
        task.finished_at = Some(Utc::now());

        match result {
            Ok(()) if task.stage == BuildStage::Completed => {
                info!(
                    "Built '{}': {} chunks from {} files in {}s",
                    task.kb_name,
                    task.chunks_written,
                    task.files_processed,
                    task.elapsed().num_seconds()
                );
                self.events.emit(RagEvent::BuildCompleted { success: true });
                self.events.emit(RagEvent::TaskCompleted {
                    success: true,
                    message: format!(
                        "Knowledge base '{}' built with {} chunks",
                        task.kb_name, task.chunks_written
                    ),
                });
                Ok(task)
            }
            Ok(()) => {
                self.events.emit(RagEvent::BuildCompleted { success: false });
                self.events.emit(RagEvent::TaskCompleted {
                    success: false,
                    message: format!("Build of '{}' stopped", task.kb_name),
                });
                Ok(task)
            }
            Err(e) => {
                error!("Build of '{}' failed: {:#}", task.kb_name, e);
                self.events.error(format!("{e:#}"));
                self.events.emit(RagEvent::BuildCompleted { success: false });
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        request: &BuildRequest,
        kb_dir: &Path,
        task: &mut BuildTask,
        cancel: &CancellationToken,
    ) -> Result<()> {
        task.stage = BuildStage::TextExtraction;
        let Some(mut files) = self.extract(request, task, cancel).await? else {
            self.stopped(task, BuildStage::TextExtraction);
            return Ok(());
        };
        write_intermediate(kb_dir, &files)?;
        let extracted: usize = files.iter().map(|f| f.chunks.len()).sum();
        self.events.emit(RagEvent::ExtractionComplete { chunks: extracted });

        if request.mode.is_append() {
            self.skip_stored_files(kb_dir, &mut files, task).await?;
        }
        task.chunks_total = files.iter().map(|f| f.chunks.len()).sum();

        task.stage = BuildStage::Vectorization;
        let mut store = None;
        let mut committed = Vec::new();
        let result = self
            .vectorize(request, kb_dir, &files, task, cancel, &mut store, &mut committed)
            .await;

        match (result, store) {
            (Ok(true), Some(store)) => {
                let metadata = store.commit(committed).await?;
                debug!("Metadata now lists {} chunks", metadata.chunk_count);
                self.finished(task);
                Ok(())
            }
            (Ok(true), None) => {
                if task.chunks_total > 0 {
                    bail!("None of the {} chunks could be embedded", task.chunks_total);
                }
                if task.files_skipped == 0 {
                    bail!("No text could be extracted from {} files", task.files_total);
                }
                info!("Every file is already stored in '{}'", request.kb_name);
                self.finished(task);
                Ok(())
            }
            (Ok(false), store) => {
                if let Some(store) = store {
                    close_unfinished(store, committed).await?;
                }
                self.stopped(task, BuildStage::Vectorization);
                Ok(())
            }
            (Err(e), store) => {
                if let Some(store) = store {
                    if let Err(close_err) = close_unfinished(store, committed).await {
                        warn!("Cleanup after failed build: {}", close_err);
                    }
                }
                Err(e)
            }
        }
    }

    /// Reads and splits every file. `None` means the build was stopped.
    async fn extract(
        &self,
        request: &BuildRequest,
        task: &mut BuildTask,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<ExtractedFile>>> {
        let mut extracted = Vec::with_capacity(request.files.len());
        for (index, path) in request.files.iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            match tokio::fs::read(path).await {
                Ok(bytes) => {
                    let file_hash = *blake3::hash(&bytes).as_bytes();
                    let source = path.to_string_lossy().into_owned();
                    let text = String::from_utf8_lossy(&bytes);
                    let chunks = self.splitter.split(&source, &text);
                    debug!("Extracted {} chunks from {}", chunks.len(), source);
                    if chunks.is_empty() {
                        self.warn(task, format!("No text extracted from {source}"));
                    } else {
                        extracted.push(ExtractedFile {
                            source,
                            file_hash,
                            chunks,
                        });
                    }
                }
                Err(e) => self.warn(task, format!("Failed to read {}: {}", path.display(), e)),
            }

            task.files_processed = index + 1;
            self.events.progress(
                BuildStage::TextExtraction,
                task.files_processed,
                task.files_total,
                task.percentage(),
            );
        }
        Ok(Some(extracted))
    }

    async fn skip_stored_files(
        &self,
        kb_dir: &Path,
        files: &mut Vec<ExtractedFile>,
        task: &mut BuildTask,
    ) -> Result<()> {
        let store = match SqliteVectorStore::open(kb_dir).await {
            Ok(store) => store,
            Err(StoreError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut kept = Vec::with_capacity(files.len());
        for file in files.drain(..) {
            if store.contains_file(&file.file_hash).await? {
                info!("Skipping {}, its content is already stored", file.source);
                task.files_skipped += 1;
            } else {
                kept.push(file);
            }
        }
        store.close().await;
        *files = kept;
        Ok(())
    }

    /// Embeds and stores every chunk. Returns `false` if the build was stopped.
    ///
    /// Each file's chunks are inserted in one transaction once all of them are
    /// embedded, so a stop never leaves part of a file in the store.
    #[allow(clippy::too_many_arguments)]
    async fn vectorize(
        &self,
        request: &BuildRequest,
        kb_dir: &Path,
        files: &[ExtractedFile],
        task: &mut BuildTask,
        cancel: &CancellationToken,
        store: &mut Option<SqliteVectorStore>,
        committed: &mut Vec<String>,
    ) -> Result<bool> {
        for file in files {
            let mut records = Vec::with_capacity(file.chunks.len());
            for chunk in &file.chunks {
                if cancel.is_cancelled() {
                    return Ok(false);
                }

                match self.embedder.embed_text(&chunk.text, cancel).await {
                    Ok(embedding) => {
                        let vector = process_vector(&embedding.values);
                        if store.is_none() {
                            *store = Some(self.open_store(request, kb_dir, vector.len(), task).await?);
                        }
                        records.push(ChunkRecord {
                            id: None,
                            source: file.source.clone(),
                            file_hash: file.file_hash,
                            sequence: chunk.sequence,
                            text: chunk.text.clone(),
                            vector,
                        });
                    }
                    Err(e) if e.is_cancelled() => return Ok(false),
                    Err(e) if e.is_session_failure() => return Err(e.into()),
                    Err(e) => self.warn(
                        task,
                        format!("Skipping chunk {} of {}: {}", chunk.sequence, file.source, e),
                    ),
                }

                task.chunks_processed += 1;
                debug!(
                    "Vectorized chunk {}/{} ({:.1}%)",
                    task.chunks_processed,
                    task.chunks_total,
                    task.percentage()
                );
                self.events.progress(
                    BuildStage::Vectorization,
                    task.chunks_processed,
                    task.chunks_total,
                    task.percentage(),
                );
            }

            if let (Some(store), false) = (store.as_ref(), records.is_empty()) {
                let written = records.len();
                store.insert_batch(records).await?;
                task.chunks_written += written;
                committed.push(file.source.clone());
            }
        }
        Ok(true)
    }

    async fn open_store(
        &self,
        request: &BuildRequest,
        kb_dir: &Path,
        dimension: usize,
        task: &mut BuildTask,
    ) -> Result<SqliteVectorStore> {
        let identity = StoreIdentity {
            model_name: self.embedder.model_name().to_string(),
            dimension,
            model_dir: self.embedder.model_dir().to_path_buf(),
            reranker_dir: request.reranker_dir.clone(),
        };
        let (store, warnings) = SqliteVectorStore::open_for_build(kb_dir, request.mode, &identity).await?;
        for warning in warnings {
            self.warn(task, warning);
        }
        Ok(store)
    }

    fn finished(&self, task: &mut BuildTask) {
        task.stage = BuildStage::Completed;
        self.events.emit(RagEvent::VectorizationComplete {
            vectors: task.chunks_written,
        });
    }

    fn stopped(&self, task: &mut BuildTask, stage: BuildStage) {
        info!(
            "Build of '{}' stopped during {} at {:.1}%",
            task.kb_name,
            stage,
            task.percentage_in(stage)
        );
        task.stopped_during = Some(stage);
        task.stage = BuildStage::Cancelled;
        self.events.emit(RagEvent::Cancelled { stage });
    }

    fn warn(&self, task: &mut BuildTask, message: String) {
        warn!("{}", message);
        self.events.warning(message.clone());
        task.warnings.push(message);
    }
}

/// Keeps what an append build fully stored; drops a staged overwrite.
async fn close_unfinished(store: SqliteVectorStore, committed: Vec<String>) -> Result<()> {
    if store.is_staging() {
        store.discard().await?;
    } else {
        store.commit(committed).await?;
    }
    Ok(())
}

fn open_lock_file(kb_dir: &Path) -> Result<fd_lock::RwLock<File>> {
    std::fs::create_dir_all(kb_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(kb_dir.join(LOCK_FILE))?;
    Ok(fd_lock::RwLock::new(file))
}

/// A lock held elsewhere means another build owns the knowledge base.
fn lock_error(e: std::io::Error, name: &str) -> anyhow::Error {
    if e.kind() == std::io::ErrorKind::WouldBlock {
        StoreError::BuildInProgress {
            name: name.to_string(),
        }
        .into()
    } else {
        anyhow::Error::new(e).context(format!("Failed to lock knowledge base '{name}'"))
    }
}

fn validate_kb_name(name: &str) -> Result<()> {
    let invalid = name.trim().is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\']);
    if invalid {
        bail!("Invalid knowledge base name: '{name}'");
    }
    Ok(())
}

fn write_intermediate(kb_dir: &Path, files: &[ExtractedFile]) -> Result<()> {
    std::fs::create_dir_all(kb_dir)?;
    let chunks: Vec<IntermediateChunk<'_>> = files
        .iter()
        .flat_map(|file| {
            file.chunks.iter().map(|chunk| IntermediateChunk {
                text: &chunk.text,
                source: &file.source,
                chunk_index: chunk.sequence,
            })
        })
        .collect();
    let path = kb_dir.join(INTERMEDIATE_FILE);
    std::fs::write(&path, serde_json::to_vec_pretty(&chunks)?)?;
    debug!("Wrote {} chunks to {}", chunks.len(), path.display());
    Ok(())
}

fn remove_intermediate(kb_dir: &Path) {
    let path = kb_dir.join(INTERMEDIATE_FILE);
    if let Err(e) = std::fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

/// Expands directories into the files they contain, honoring `.gitignore`.
///
/// The result is sorted within each argument and free of duplicates.
pub fn collect_input_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut seen = HashSet::new();
    let mut files = Vec::new();
    for path in paths {
        if path.is_file() {
            if seen.insert(path.clone()) {
                files.push(path.clone());
            }
            continue;
        }
        if !path.is_dir() {
            bail!("No such file or directory: {}", path.display());
        }

        let mut found = Vec::new();
        for entry in ignore::WalkBuilder::new(path).build() {
            let entry = entry?;
            if entry.file_type().is_some_and(|t| t.is_file()) {
                found.push(entry.into_path());
            }
        }
        found.sort();
        for file in found {
            if seen.insert(file.clone()) {
                files.push(file);
            }
        }
    }
    Ok(files)
}

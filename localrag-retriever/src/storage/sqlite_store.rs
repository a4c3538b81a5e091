//! SQLite vector store for one knowledge base
//!
//! Chunks and their embeddings live in a single `chunks` table. Embeddings
//! are stored as little-endian `f32` blobs and similarity search is an
//! in-memory cosine scan over every stored vector.
//!
//! ## Opening for a build
//!
//! - **Append** writes into `vectorstore.db` directly. The existing
//!   dimension (from `metadata.json`, or from a stored vector when the
//!   sidecar is missing) must equal the new one, otherwise the open fails
//!   with [`StoreError::DimensionMismatch`] and nothing is written.
//! - **Overwrite** writes into `vectorstore.db.building`. [`SqliteVectorStore::commit`]
//!   replaces the old store and metadata; [`SqliteVectorStore::discard`] deletes
//!   the staging file and leaves the old knowledge base untouched.
//!
//! ## Schema
//!
//! ```sql
//! chunks (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     source TEXT NOT NULL,
//!     file_hash BLOB NOT NULL,
//!     sequence INTEGER NOT NULL,
//!     content TEXT NOT NULL,
//!     embedding BLOB NOT NULL,
//!     created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
//! )
//! ```

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use sqlx::Row;
use tracing::{debug, info, warn};

use super::{
    ChunkId, ChunkRecord, FileHash, KnowledgeBaseMetadata, Result, SearchResult, SourceSummary,
    StoreError, VectorStore,
};
use crate::retrieval::build_mode::BuildMode;

pub const STORE_FILE: &str = "vectorstore.db";
pub const STAGING_FILE: &str = "vectorstore.db.building";

/// The model producing the vectors a build writes.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreIdentity {
    pub model_name: String,
    pub dimension: usize,
    pub model_dir: PathBuf,
    pub reranker_dir: Option<PathBuf>,
}

/// SQLite-backed [`VectorStore`]. See module docs for the open modes.
pub struct SqliteVectorStore {
    pool: SqlitePool,
    kb_dir: PathBuf,
    staging: bool,
    dimension: usize,
    metadata: Mutex<KnowledgeBaseMetadata>,
}

impl std::fmt::Debug for SqliteVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteVectorStore")
            .field("kb_dir", &self.kb_dir)
            .field("staging", &self.staging)
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl SqliteVectorStore {
    /// Opens an existing knowledge base for reading and querying.
    pub async fn open(kb_dir: &Path) -> Result<Self> {
        let db_path = kb_dir.join(STORE_FILE);
        if !db_path.is_file() {
            return Err(StoreError::NotFound {
                path: kb_dir.to_path_buf(),
            });
        }
        let pool = connect(&db_path, SqliteJournalMode::Wal).await?;
        create_tables(&pool).await?;

        let metadata = match KnowledgeBaseMetadata::load(kb_dir)? {
            Some(metadata) => metadata,
            None => {
                let Some(dimension) = stored_dimension(&pool).await? else {
                    pool.close().await;
                    return Err(StoreError::NotFound {
                        path: kb_dir.join(super::metadata::METADATA_FILE),
                    });
                };
                warn!(
                    "{} has no metadata, using stored vector dimension {}",
                    kb_dir.display(),
                    dimension
                );
                KnowledgeBaseMetadata::new("unknown", dimension, PathBuf::new(), None)
            }
        };

        Ok(Self {
            pool,
            kb_dir: kb_dir.to_path_buf(),
            staging: false,
            dimension: metadata.embedding_dimension,
            metadata: Mutex::new(metadata),
        })
    }

    /// Opens a knowledge base for writing vectors of `identity.dimension`.
    ///
    /// Returns the store and any non-fatal warnings, such as a model name that
    /// differs from the one recorded in the metadata.
    pub async fn open_for_build(
        kb_dir: &Path,
        mode: BuildMode,
        identity: &StoreIdentity,
    ) -> Result<(Self, Vec<String>)> {
        std::fs::create_dir_all(kb_dir)?;
        match mode {
            BuildMode::Append => Self::open_append(kb_dir, identity).await,
            BuildMode::Overwrite => Self::open_staging(kb_dir, identity).await,
        }
    }

    async fn open_append(kb_dir: &Path, identity: &StoreIdentity) -> Result<(Self, Vec<String>)> {
        let mut warnings = Vec::new();
        let db_path = kb_dir.join(STORE_FILE);
        let existing = KnowledgeBaseMetadata::load(kb_dir)?;

        let metadata = match existing {
            Some(mut metadata) => {
                if metadata.embedding_dimension != identity.dimension {
                    return Err(StoreError::DimensionMismatch {
                        expected: metadata.embedding_dimension,
                        actual: identity.dimension,
                    });
                }
                if metadata.embedding_model != identity.model_name {
                    let message = format!(
                        "Knowledge base was built with model '{}' but '{}' is in use",
                        metadata.embedding_model, identity.model_name
                    );
                    warn!("{}", message);
                    warnings.push(message);
                }
                if identity.reranker_dir.is_some() {
                    metadata.reranker_dir = identity.reranker_dir.clone();
                }
                metadata
            }
            None => KnowledgeBaseMetadata::new(
                identity.model_name.clone(),
                identity.dimension,
                identity.model_dir.clone(),
                identity.reranker_dir.clone(),
            ),
        };

        let pool = connect(&db_path, SqliteJournalMode::Wal).await?;
        create_tables(&pool).await?;
        if let Some(stored) = stored_dimension(&pool).await? {
            if stored != identity.dimension {
                pool.close().await;
                return Err(StoreError::DimensionMismatch {
                    expected: stored,
                    actual: identity.dimension,
                });
            }
        }

        debug!("Opened {} for append", db_path.display());
        Ok((
            Self {
                pool,
                kb_dir: kb_dir.to_path_buf(),
                staging: false,
                dimension: identity.dimension,
                metadata: Mutex::new(metadata),
            },
            warnings,
        ))
    }

    async fn open_staging(kb_dir: &Path, identity: &StoreIdentity) -> Result<(Self, Vec<String>)> {
        let staging_path = kb_dir.join(STAGING_FILE);
        remove_if_exists(&staging_path)?;
        remove_if_exists(&sibling(&staging_path, "-journal"))?;

        if let Some(existing) = KnowledgeBaseMetadata::load(kb_dir)? {
            if existing.embedding_dimension != identity.dimension {
                info!(
                    "Replacing {}-dimensional store in {} with {}-dimensional vectors",
                    existing.embedding_dimension,
                    kb_dir.display(),
                    identity.dimension
                );
            }
        }

        let pool = connect(&staging_path, SqliteJournalMode::Delete).await?;
        create_tables(&pool).await?;

        debug!("Opened staging store {}", staging_path.display());
        let metadata = KnowledgeBaseMetadata::new(
            identity.model_name.clone(),
            identity.dimension,
            identity.model_dir.clone(),
            identity.reranker_dir.clone(),
        );
        Ok((
            Self {
                pool,
                kb_dir: kb_dir.to_path_buf(),
                staging: true,
                dimension: identity.dimension,
                metadata: Mutex::new(metadata),
            },
            Vec::new(),
        ))
    }

    pub fn kb_dir(&self) -> &Path {
        &self.kb_dir
    }

    /// Whether writes go to a staging file that replaces the store on commit
    pub fn is_staging(&self) -> bool {
        self.staging
    }

    /// Records `files`, swaps in a staged store and writes the metadata sidecar.
    pub async fn commit(self, files: Vec<String>) -> Result<KnowledgeBaseMetadata> {
        let chunk_count = self.chunk_count().await?;
        let mut metadata = self.metadata();
        metadata.record_files(files, 0);
        metadata.chunk_count = chunk_count;

        self.pool.close().await;

        if self.staging {
            let live = self.kb_dir.join(STORE_FILE);
            for path in [sibling(&live, "-wal"), sibling(&live, "-shm"), live.clone()] {
                remove_if_exists(&path)?;
            }
            std::fs::rename(self.kb_dir.join(STAGING_FILE), &live)?;
            info!("Replaced vector store in {}", self.kb_dir.display());
        }

        metadata.save(&self.kb_dir)?;
        Ok(metadata)
    }

    /// Closes the store. A staged store is deleted; appended files that were
    /// already inserted stay in place.
    pub async fn discard(self) -> Result<()> {
        self.pool.close().await;
        if self.staging {
            let staging_path = self.kb_dir.join(STAGING_FILE);
            remove_if_exists(&staging_path)?;
            remove_if_exists(&sibling(&staging_path, "-journal"))?;
            debug!("Discarded staging store {}", staging_path.display());
        }
        Ok(())
    }

    fn check_dimension(&self, actual: usize) -> Result<()> {
        if actual != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                actual,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn metadata(&self) -> KnowledgeBaseMetadata {
        self.metadata
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn insert(&self, chunk: ChunkRecord) -> Result<ChunkId> {
        let mut ids = self.insert_batch(vec![chunk]).await?;
        Ok(ids.pop().unwrap_or_default())
    }

    async fn insert_batch(&self, chunks: Vec<ChunkRecord>) -> Result<Vec<ChunkId>> {
        for chunk in &chunks {
            self.check_dimension(chunk.vector.len())?;
        }

        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let result = sqlx::query(
                r#"
                INSERT INTO chunks (source, file_hash, sequence, content, embedding)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.source)
            .bind(&chunk.file_hash[..])
            .bind(chunk.sequence as i64)
            .bind(&chunk.text)
            .bind(bytemuck::cast_slice::<f32, u8>(&chunk.vector))
            .execute(&mut *tx)
            .await?;
            ids.push(result.last_insert_rowid());
        }
        tx.commit().await?;

        Ok(ids)
    }

    async fn search_similar(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        self.check_dimension(query.len())?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query("SELECT id, source, content, embedding FROM chunks")
            .fetch_all(&self.pool)
            .await?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let embedding = decode_embedding(&row.get::<Vec<u8>, _>("embedding"));
            if embedding.len() != query.len() {
                warn!(
                    "Skipping chunk {} with {} dimensions",
                    row.get::<i64, _>("id"),
                    embedding.len()
                );
                continue;
            }
            results.push(SearchResult {
                chunk_id: row.get("id"),
                text: row.get("content"),
                source: row.get("source"),
                similarity: cosine_similarity(query, &embedding),
            });
        }

        // sort_by is stable, so equal scores keep insertion order
        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(k);

        Ok(results)
    }

    async fn chunk_count(&self) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count") as usize)
    }

    async fn contains_file(&self, hash: &FileHash) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM chunks WHERE file_hash = ?")
            .bind(&hash[..])
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count") > 0)
    }

    async fn sources(&self) -> Result<Vec<SourceSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT source, file_hash, COUNT(*) AS chunks
            FROM chunks
            GROUP BY source, file_hash
            ORDER BY source
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| SourceSummary {
                source: row.get("source"),
                file_hash: hex::encode(row.get::<Vec<u8>, _>("file_hash")),
                chunks: row.get::<i64, _>("chunks") as usize,
            })
            .collect())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

async fn connect(path: &Path, journal_mode: SqliteJournalMode) -> Result<SqlitePool> {
    let pool = SqlitePool::connect_with(
        SqliteConnectOptions::new()
            .filename(path)
            .journal_mode(journal_mode)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .foreign_keys(true)
            .create_if_missing(true),
    )
    .await?;
    Ok(pool)
}

async fn create_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            file_hash BLOB NOT NULL,
            sequence INTEGER NOT NULL,
            content TEXT NOT NULL,
            embedding BLOB NOT NULL,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_file_hash ON chunks(file_hash)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Length of the first stored vector, if any.
async fn stored_dimension(pool: &SqlitePool) -> Result<Option<usize>> {
    let row = sqlx::query("SELECT embedding FROM chunks ORDER BY id LIMIT 1")
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|row| decode_embedding(&row.get::<Vec<u8>, _>("embedding")).len()))
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    match bytemuck::try_cast_slice::<u8, f32>(bytes) {
        Ok(values) => values.to_vec(),
        // Unaligned buffers
        Err(_) => bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    }
}

/// Cosine similarity in `[-1, 1]`; zero when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot_product = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let norm_a = norm_a.sqrt();
    let norm_b = norm_b.sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    let similarity = dot_product / (norm_a * norm_b);
    if similarity.is_nan() {
        0.0
    } else {
        similarity.clamp(-1.0, 1.0)
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn identity(dimension: usize) -> StoreIdentity {
        StoreIdentity {
            model_name: format!("model-{dimension}"),
            dimension,
            model_dir: PathBuf::from(format!("/models/model-{dimension}")),
            reranker_dir: None,
        }
    }

    fn record(source: &str, sequence: usize, vector: Vec<f32>) -> ChunkRecord {
        ChunkRecord {
            id: None,
            source: source.to_string(),
            file_hash: *blake3::hash(source.as_bytes()).as_bytes(),
            sequence,
            text: format!("{source} chunk {sequence}"),
            vector,
        }
    }

    #[tokio::test]
    async fn test_insert_and_search() {
        let dir = tempdir().unwrap();
        let (store, warnings) = SqliteVectorStore::open_for_build(dir.path(), BuildMode::Append, &identity(3))
            .await
            .unwrap();
        assert!(warnings.is_empty());

        store
            .insert_batch(vec![
                record("a.txt", 0, vec![1.0, 0.0, 0.0]),
                record("a.txt", 1, vec![0.0, 1.0, 0.0]),
                record("b.txt", 0, vec![0.7, 0.7, 0.0]),
            ])
            .await
            .unwrap();
        assert_eq!(store.chunk_count().await.unwrap(), 3);

        let results = store.search_similar(&[1.0, 0.0, 0.0], 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].text, "a.txt chunk 0");
        assert!((results[0].similarity - 1.0).abs() < 1e-6);
        assert_eq!(results[1].source, "b.txt");
        assert!(results[0].similarity >= results[1].similarity);

        let none = store.search_similar(&[1.0, 0.0, 0.0], 0).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_insert_rejects_wrong_dimension() {
        let dir = tempdir().unwrap();
        let (store, _) = SqliteVectorStore::open_for_build(dir.path(), BuildMode::Append, &identity(3))
            .await
            .unwrap();

        let err = store
            .insert(record("a.txt", 0, vec![1.0, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { expected: 3, actual: 2 }));

        let err = store.search_similar(&[1.0; 4], 1).await.unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { expected: 3, actual: 4 }));
    }

    #[tokio::test]
    async fn test_append_dimension_mismatch_leaves_store_untouched() {
        let dir = tempdir().unwrap();
        let (store, _) = SqliteVectorStore::open_for_build(dir.path(), BuildMode::Append, &identity(4))
            .await
            .unwrap();
        store.insert(record("a.txt", 0, vec![1.0; 4])).await.unwrap();
        let before = store.commit(vec!["a.txt".into()]).await.unwrap();

        let err = SqliteVectorStore::open_for_build(dir.path(), BuildMode::Append, &identity(8))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { expected: 4, actual: 8 }));

        let after = KnowledgeBaseMetadata::load(dir.path()).unwrap().unwrap();
        assert_eq!(after, before);
        let store = SqliteVectorStore::open(dir.path()).await.unwrap();
        assert_eq!(store.chunk_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_append_model_name_mismatch_warns() {
        let dir = tempdir().unwrap();
        let (store, _) = SqliteVectorStore::open_for_build(dir.path(), BuildMode::Append, &identity(4))
            .await
            .unwrap();
        store.commit(Vec::new()).await.unwrap();

        let mut other = identity(4);
        other.model_name = "another-model".to_string();
        let (_store, warnings) = SqliteVectorStore::open_for_build(dir.path(), BuildMode::Append, &other)
            .await
            .unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("another-model"));
    }

    #[tokio::test]
    async fn test_overwrite_replaces_on_commit() {
        let dir = tempdir().unwrap();
        let (store, _) = SqliteVectorStore::open_for_build(dir.path(), BuildMode::Append, &identity(4))
            .await
            .unwrap();
        store.insert(record("old.txt", 0, vec![1.0; 4])).await.unwrap();
        store.commit(vec!["old.txt".into()]).await.unwrap();

        let (staged, _) = SqliteVectorStore::open_for_build(dir.path(), BuildMode::Overwrite, &identity(2))
            .await
            .unwrap();
        assert!(staged.is_staging());
        staged.insert(record("new.txt", 0, vec![0.0, 1.0])).await.unwrap();

        // The old knowledge base is still readable while the build runs
        let live = SqliteVectorStore::open(dir.path()).await.unwrap();
        assert_eq!(live.dimension(), 4);
        live.close().await;

        let metadata = staged.commit(vec!["new.txt".into()]).await.unwrap();
        assert_eq!(metadata.embedding_dimension, 2);
        assert_eq!(metadata.files, vec!["new.txt"]);
        assert_eq!(metadata.chunk_count, 1);
        assert!(!dir.path().join(STAGING_FILE).exists());

        let store = SqliteVectorStore::open(dir.path()).await.unwrap();
        assert_eq!(store.dimension(), 2);
        let sources = store.sources().await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].source, "new.txt");
        assert_eq!(sources[0].file_hash.len(), 64);
    }

    #[tokio::test]
    async fn test_overwrite_discard_keeps_old_store() {
        let dir = tempdir().unwrap();
        let (store, _) = SqliteVectorStore::open_for_build(dir.path(), BuildMode::Append, &identity(4))
            .await
            .unwrap();
        store.insert(record("old.txt", 0, vec![1.0; 4])).await.unwrap();
        store.commit(vec!["old.txt".into()]).await.unwrap();

        let (staged, _) = SqliteVectorStore::open_for_build(dir.path(), BuildMode::Overwrite, &identity(2))
            .await
            .unwrap();
        staged.insert(record("new.txt", 0, vec![0.0, 1.0])).await.unwrap();
        staged.discard().await.unwrap();

        assert!(!dir.path().join(STAGING_FILE).exists());
        let store = SqliteVectorStore::open(dir.path()).await.unwrap();
        assert_eq!(store.dimension(), 4);
        assert_eq!(store.chunk_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_contains_file() {
        let dir = tempdir().unwrap();
        let (store, _) = SqliteVectorStore::open_for_build(dir.path(), BuildMode::Append, &identity(2))
            .await
            .unwrap();
        let chunk = record("a.txt", 0, vec![1.0, 0.0]);
        let hash = chunk.file_hash;
        assert!(!store.contains_file(&hash).await.unwrap());
        store.insert(chunk).await.unwrap();
        assert!(store.contains_file(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_open_missing_store() {
        let dir = tempdir().unwrap();
        let err = SqliteVectorStore::open(dir.path()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[f32::NAN, 1.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_decode_unaligned_embedding() {
        let values = [0.5f32, -2.0, 3.25];
        let mut bytes = vec![0u8];
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        assert_eq!(decode_embedding(&bytes[1..]), values.to_vec());
    }
}

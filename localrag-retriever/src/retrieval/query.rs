//! Query-time flow: embed the question, search, rerank.
//!
//! ```text
//! question → EmbeddingProvider → process_vector → VectorStore::search_similar(depth)
//!                                                          │
//!                        Reranker::rerank(top_k) ◄─────────┘   (or original order)
//! ```

use std::sync::Arc;

use anyhow::{Result, bail};
use localrag_embed::reranker::passthrough;
use localrag_embed::{
    CancellationToken, EmbeddingProvider, HfTokenizer, InferenceBackend, OrtBackend, Reranker,
    StopModule, Tokenizer, process_vector,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::RetrievalConfig;
use crate::events::{EventSink, RagEvent};
use crate::storage::{ChunkId, SearchResult, VectorStore};

/// A passage returned for a question, best first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Passage {
    pub chunk_id: ChunkId,
    pub text: String,
    pub source: String,
    /// Cosine similarity from the vector search
    pub similarity: f32,
    /// Reranker score, or a synthetic rank score when no reranking happened
    pub score: f32,
    pub reranked: bool,
}

pub struct QueryPipeline<T: Tokenizer = HfTokenizer, B: InferenceBackend = OrtBackend> {
    embedder: Arc<dyn EmbeddingProvider>,
    reranker: Option<Arc<Reranker<T, B>>>,
    search_depth: usize,
    rerank_count: usize,
    events: EventSink,
}

impl<T: Tokenizer, B: InferenceBackend> QueryPipeline<T, B> {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        reranker: Option<Arc<Reranker<T, B>>>,
        retrieval: &RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            reranker,
            search_depth: retrieval.search_depth,
            rerank_count: retrieval.rerank_count,
            events: EventSink::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Finds the passages of `store` that best answer `question`.
    pub async fn query(
        &self,
        store: &dyn VectorStore,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Passage>> {
        let _active = cancel.enter(StopModule::Query);
        if question.trim().is_empty() {
            bail!("Question is empty");
        }
        self.check_models(store);

        let embedding = self.embedder.embed_text(question, cancel).await?;
        let vector = process_vector(&embedding.values);
        let candidates = store.search_similar(&vector, self.search_depth).await?;
        debug!("Vector search returned {} candidates", candidates.len());
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        cancel.check()?;

        let documents: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        let (ranked, reranked) = match &self.reranker {
            Some(reranker) => {
                let events = &self.events;
                let ranked = reranker
                    .rerank(question, &documents, self.rerank_count, cancel, |progress| {
                        events.emit(RagEvent::RerankProgress {
                            index: progress.index,
                            total: progress.total,
                            score: progress.score,
                        })
                    })
                    .await?;
                (ranked, true)
            }
            None => (passthrough(&documents, self.rerank_count), false),
        };

        let passages: Vec<Passage> = ranked
            .into_iter()
            .filter_map(|result| {
                candidates
                    .get(result.original_index)
                    .map(|candidate| to_passage(candidate, result.score, reranked))
            })
            .collect();
        info!(
            "Query returned {} passages from {} candidates",
            passages.len(),
            candidates.len()
        );
        Ok(passages)
    }

    /// Warns when the store was built with a different embedding model.
    fn check_models(&self, store: &dyn VectorStore) {
        let metadata = store.metadata();
        if metadata.embedding_model != self.embedder.model_name() {
            self.events.warning(format!(
                "Knowledge base was built with '{}', querying with '{}'",
                metadata.embedding_model,
                self.embedder.model_name()
            ));
        }
    }
}

fn to_passage(candidate: &SearchResult, score: f32, reranked: bool) -> Passage {
    Passage {
        chunk_id: candidate.chunk_id,
        text: candidate.text.clone(),
        source: candidate.source.clone(),
        similarity: candidate.similarity,
        score,
        reranked,
    }
}

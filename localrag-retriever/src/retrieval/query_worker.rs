//! Single-worker execution context for queries.
//!
//! Questions are answered one at a time by a dedicated tokio task that owns
//! the query pipeline and the open store, the same way [`BuildWorker`] owns
//! builds. Query-time embedding, search and reranking therefore never share a
//! task with a build.
//!
//! [`BuildWorker`]: super::build_worker::BuildWorker

use std::sync::Arc;

use anyhow::{Result, anyhow};
use localrag_embed::{InferenceBackend, StopCoordinator, Tokenizer};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use super::query::{Passage, QueryPipeline};
use crate::storage::VectorStore;

struct QueryJob {
    question: String,
    reply: oneshot::Sender<Result<Vec<Passage>>>,
}

pub struct QueryWorker {
    sender: flume::Sender<QueryJob>,
    handle: JoinHandle<()>,
    coordinator: StopCoordinator,
}

impl QueryWorker {
    pub fn spawn<T: Tokenizer, B: InferenceBackend>(
        pipeline: Arc<QueryPipeline<T, B>>,
        store: Arc<dyn VectorStore>,
        coordinator: StopCoordinator,
    ) -> Self {
        let (sender, receiver) = flume::unbounded::<QueryJob>();
        let worker_coordinator = coordinator.clone();

        let handle = tokio::spawn(async move {
            debug!("Query worker started");
            while let Ok(job) = receiver.recv_async().await {
                let token = worker_coordinator.token();
                let result = pipeline.query(store.as_ref(), &job.question, &token).await;
                let _ = job.reply.send(result);
            }
            debug!("Query worker stopped");
        });

        Self {
            sender,
            handle,
            coordinator,
        }
    }

    pub fn submit(&self, question: impl Into<String>) -> Result<oneshot::Receiver<Result<Vec<Passage>>>> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(QueryJob {
                question: question.into(),
                reply,
            })
            .map_err(|_| anyhow!("Query worker is no longer running"))?;
        Ok(receiver)
    }

    /// Queues a question and waits for its passages.
    pub async fn ask(&self, question: impl Into<String>) -> Result<Vec<Passage>> {
        self.submit(question)?
            .await
            .map_err(|_| anyhow!("Query worker dropped the question"))?
    }

    /// Asks the running query to stop at its next checkpoint.
    pub fn stop(&self) {
        self.coordinator.request_stop();
    }

    pub async fn shutdown(self) -> Result<()> {
        drop(self.sender);
        self.handle.await?;
        Ok(())
    }
}

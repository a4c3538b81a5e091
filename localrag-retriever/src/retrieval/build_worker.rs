//! Single-worker execution context for builds.
//!
//! Requests are queued on a `flume` channel and run one at a time by a
//! dedicated tokio task, so two builds never touch the embedding session
//! concurrently. Each request gets a fresh token from the shared
//! [`StopCoordinator`] and its result comes back on a oneshot channel.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use localrag_embed::StopCoordinator;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::builder::{BuildRequest, BuildTask, KnowledgeBaseBuilder};

struct BuildJob {
    request: BuildRequest,
    reply: oneshot::Sender<Result<BuildTask>>,
}

/// Handle to the build worker. Dropping it lets the worker drain and exit.
pub struct BuildWorker {
    sender: flume::Sender<BuildJob>,
    handle: JoinHandle<()>,
    coordinator: StopCoordinator,
}

impl BuildWorker {
    pub fn spawn(builder: Arc<KnowledgeBaseBuilder>, coordinator: StopCoordinator) -> Self {
        let (sender, receiver) = flume::unbounded::<BuildJob>();
        let worker_coordinator = coordinator.clone();

        let handle = tokio::spawn(async move {
            debug!("Build worker started");
            while let Ok(job) = receiver.recv_async().await {
                let token = worker_coordinator.token();
                let result = builder.build(job.request, &token).await;
                // The requester may have stopped waiting
                let _ = job.reply.send(result);
            }
            debug!("Build worker stopped");
        });

        Self {
            sender,
            handle,
            coordinator,
        }
    }

    /// Queues a build and returns the receiver for its outcome.
    pub fn submit(&self, request: BuildRequest) -> Result<oneshot::Receiver<Result<BuildTask>>> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(BuildJob { request, reply })
            .map_err(|_| anyhow!("Build worker is no longer running"))?;
        Ok(receiver)
    }

    /// Queues a build and waits for it to finish.
    pub async fn run(&self, request: BuildRequest) -> Result<BuildTask> {
        self.submit(request)?
            .await
            .map_err(|_| anyhow!("Build worker dropped the request"))?
    }

    /// Asks the running build to stop at its next checkpoint.
    pub fn stop(&self) {
        info!("Stop requested for running build");
        self.coordinator.request_stop();
    }

    pub fn pending(&self) -> usize {
        self.sender.len()
    }

    /// Closes the queue and waits for queued builds to finish.
    pub async fn shutdown(self) -> Result<()> {
        drop(self.sender);
        self.handle.await?;
        Ok(())
    }
}

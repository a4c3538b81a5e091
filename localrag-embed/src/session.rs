//! Session lifecycle management for loaded models.
//!
//! A [`ModelSession`] wraps one native model handle in a small state machine
//! with bounded recovery:
//!
//! ```text
//!                 acquire()            load ok
//! Uninitialized ───────────► Loading ───────────► Ready
//!                              │  ▲                 │
//!                     load err │  │ recovery         │ handle lost / invalidate()
//!                              ▼  │ (≤ max_retries)  │
//!                             Error ◄────────────────┘
//!                              │
//!                              └── retries exhausted: SessionUnavailable until close()
//! ```
//!
//! All transitions happen under one async mutex. A caller that finds the
//! session `Loading` releases the lock and polls instead of starting a second
//! load, so at most one load is in flight. Inference holds the same lock for
//! the whole call, which totally orders every use of the native handle.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::backend::{InferenceBackend, InputTensor, OutputTensor, SessionOptions};
use crate::config::RetryPolicy;
use crate::error::{EmbedError, Result};

/// Lifecycle state of a [`ModelSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Loading,
    Ready,
    Error,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Uninitialized => write!(f, "uninitialized"),
            SessionState::Loading => write!(f, "loading"),
            SessionState::Ready => write!(f, "ready"),
            SessionState::Error => write!(f, "error"),
        }
    }
}

struct SessionInner<H> {
    state: SessionState,
    handle: Option<H>,
    retry_count: u32,
    last_checked_at: Option<Instant>,
    last_error: Option<String>,
}

/// Owns one native model handle and its recovery policy.
pub struct ModelSession<B: InferenceBackend> {
    backend: Arc<B>,
    model_path: PathBuf,
    label: String,
    options: SessionOptions,
    policy: RetryPolicy,
    inner: Arc<Mutex<SessionInner<B::Handle>>>,
}

impl<B: InferenceBackend> std::fmt::Debug for ModelSession<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSession")
            .field("model_path", &self.model_path)
            .field("options", &self.options)
            .field("policy", &self.policy)
            .finish()
    }
}

impl<B: InferenceBackend> ModelSession<B> {
    /// Creates an unloaded session. Nothing touches the model file until the first [`acquire`](Self::acquire).
    pub fn new(
        backend: Arc<B>,
        model_path: impl Into<PathBuf>,
        options: SessionOptions,
        policy: RetryPolicy,
    ) -> Self {
        let model_path = model_path.into();
        let label = model_path
            .parent()
            .and_then(|p| p.file_name())
            .or_else(|| model_path.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| model_path.display().to_string());
        Self {
            backend,
            model_path,
            label,
            options,
            policy,
            inner: Arc::new(Mutex::new(SessionInner {
                state: SessionState::Uninitialized,
                handle: None,
                retry_count: 0,
                last_checked_at: None,
                last_error: None,
            })),
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn retry_count(&self) -> u32 {
        self.inner.lock().await.retry_count
    }

    /// When a caller last looked at the session state.
    pub async fn last_checked_at(&self) -> Option<Instant> {
        self.inner.lock().await.last_checked_at
    }

    /// Returns exclusive access to a ready handle, loading or recovering it first if needed.
    ///
    /// Fails with [`EmbedError::SessionUnavailable`] once recovery attempts are
    /// exhausted; the session stays in that state until [`close`](Self::close).
    pub async fn acquire(&self) -> Result<SessionHandle<B>> {
        let mut polls = 0u32;
        loop {
            let mut guard = Arc::clone(&self.inner).lock_owned().await;
            guard.last_checked_at = Some(Instant::now());

            let state = guard.state;
            match state {
                SessionState::Loading => {
                    drop(guard);
                    if polls >= self.policy.loading_poll_attempts {
                        return Err(EmbedError::LoadWaitTimeout {
                            model: self.label.clone(),
                            waited: self.policy.loading_wait_budget(),
                        });
                    }
                    polls += 1;
                    tokio::time::sleep(self.policy.loading_poll_interval).await;
                }
                SessionState::Ready if guard.handle.is_some() => {
                    return Ok(SessionHandle {
                        guard,
                        backend: Arc::clone(&self.backend),
                        label: self.label.clone(),
                    });
                }
                SessionState::Ready => {
                    warn!("Session for {} is ready but has no handle, marking as failed", self.label);
                    guard.state = SessionState::Error;
                    guard.last_error = Some("handle missing".to_string());
                }
                SessionState::Error if polls > 0 => {
                    // We waited on someone else's load and it failed
                    let message = guard.last_error.clone().unwrap_or_default();
                    return Err(EmbedError::model_load(&self.model_path, message));
                }
                SessionState::Uninitialized => {
                    return self.load(guard, false).await;
                }
                SessionState::Error if guard.retry_count < self.policy.max_retries => {
                    return self.load(guard, true).await;
                }
                SessionState::Error => {
                    return Err(EmbedError::SessionUnavailable {
                        model: self.label.clone(),
                        attempts: guard.retry_count,
                    });
                }
            }
        }
    }

    async fn load(
        &self,
        mut guard: OwnedMutexGuard<SessionInner<B::Handle>>,
        recovery: bool,
    ) -> Result<SessionHandle<B>> {
        if recovery {
            guard.retry_count += 1;
            info!(
                attempt = guard.retry_count,
                max = self.policy.max_retries,
                "Recovering session for {}",
                self.label
            );
        } else {
            info!("Loading session for {}", self.label);
        }

        if let Some(old) = guard.handle.take() {
            self.backend.close(old);
        }
        guard.state = SessionState::Loading;
        drop(guard);

        // The load runs detached and settles the state itself, so a caller
        // that stops waiting cannot leave the session stuck in Loading.
        let loader = tokio::spawn(load_session(
            Arc::clone(&self.backend),
            Arc::clone(&self.inner),
            self.model_path.clone(),
            self.options,
            self.label.clone(),
            recovery.then_some(self.policy.retry_delay),
        ));
        loader.await??;

        let guard = Arc::clone(&self.inner).lock_owned().await;
        if guard.state == SessionState::Ready && guard.handle.is_some() {
            return Ok(SessionHandle {
                guard,
                backend: Arc::clone(&self.backend),
                label: self.label.clone(),
            });
        }
        let message = guard
            .last_error
            .clone()
            .unwrap_or_else(|| format!("session left {} after load", guard.state));
        Err(EmbedError::model_load(&self.model_path, message))
    }

    /// Marks a ready session as failed so that the next acquire recovers it.
    pub async fn invalidate(&self) {
        let mut guard = self.inner.lock().await;
        if guard.state == SessionState::Ready {
            warn!("Session for {} invalidated", self.label);
            guard.state = SessionState::Error;
        }
    }

    /// Releases the native handle and resets the retry budget.
    pub async fn close(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(handle) = guard.handle.take() {
            self.backend.close(handle);
        }
        guard.state = SessionState::Uninitialized;
        guard.retry_count = 0;
        guard.last_error = None;
        debug!("Session for {} closed", self.label);
    }
}

/// Creates a native handle and records the outcome in the session state.
async fn load_session<B: InferenceBackend>(
    backend: Arc<B>,
    inner: Arc<Mutex<SessionInner<B::Handle>>>,
    model_path: PathBuf,
    options: SessionOptions,
    label: String,
    delay: Option<Duration>,
) -> Result<()> {
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let loader = Arc::clone(&backend);
    let path = model_path.clone();
    let result = tokio::task::spawn_blocking(move || loader.create_session(&path, &options)).await;

    let mut guard = inner.lock().await;
    if guard.state != SessionState::Loading {
        // Closed while the load was running
        if let Ok(Ok(handle)) = result {
            backend.close(handle);
        }
        return Err(EmbedError::model_load(&model_path, "session closed while loading"));
    }
    match result {
        Ok(Ok(handle)) => {
            guard.handle = Some(handle);
            guard.state = SessionState::Ready;
            guard.last_error = None;
            info!("Session for {} is ready", label);
            Ok(())
        }
        Ok(Err(e)) => {
            warn!("Failed to load {}: {}", label, e);
            guard.state = SessionState::Error;
            guard.last_error = Some(e.to_string());
            Err(e)
        }
        Err(join) => {
            warn!("Model load task for {} failed: {}", label, join);
            guard.state = SessionState::Error;
            guard.last_error = Some(join.to_string());
            Err(EmbedError::from(join))
        }
    }
}

/// Exclusive access to a ready native handle for one inference call.
pub struct SessionHandle<B: InferenceBackend> {
    guard: OwnedMutexGuard<SessionInner<B::Handle>>,
    backend: Arc<B>,
    label: String,
}

impl<B: InferenceBackend> SessionHandle<B> {
    /// Input names declared by the loaded model.
    pub fn input_names(&self) -> Vec<String> {
        self.guard
            .handle
            .as_ref()
            .map(|handle| self.backend.input_names(handle))
            .unwrap_or_default()
    }

    /// Runs inference on a blocking thread with a hard time limit.
    ///
    /// A timed-out call cannot be preempted. Its handle is abandoned to the
    /// still-running thread and the session is marked failed, so the next
    /// acquire loads a fresh one.
    pub async fn run(mut self, inputs: Vec<InputTensor>, timeout: Duration) -> Result<Vec<OutputTensor>> {
        let Some(mut handle) = self.guard.handle.take() else {
            self.guard.state = SessionState::Error;
            return Err(EmbedError::inference("session handle is missing"));
        };

        let backend = Arc::clone(&self.backend);
        let task = tokio::task::spawn_blocking(move || {
            let result = backend.run(&mut handle, inputs);
            (handle, result)
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok((handle, result))) => {
                self.guard.handle = Some(handle);
                result
            }
            Ok(Err(join)) => {
                warn!("Inference task for {} failed: {}", self.label, join);
                self.guard.state = SessionState::Error;
                Err(EmbedError::from(join))
            }
            Err(_) => {
                warn!("Inference on {} timed out after {:?}", self.label, timeout);
                self.guard.state = SessionState::Error;
                self.guard.last_error = Some("inference timed out".to_string());
                Err(EmbedError::InferenceTimeout { timeout })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;
    use std::sync::atomic::Ordering;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            retry_delay: Duration::from_millis(1),
            loading_poll_interval: Duration::from_millis(5),
            loading_poll_attempts: 200,
        }
    }

    fn session(backend: MockBackend) -> (ModelSession<MockBackend>, Arc<MockBackend>) {
        let backend = Arc::new(backend);
        let session = ModelSession::new(
            Arc::clone(&backend),
            "/models/mock-qwen/model.onnx",
            SessionOptions { intra_threads: 1 },
            fast_policy(),
        );
        (session, backend)
    }

    #[tokio::test]
    async fn test_first_acquire_loads_once() {
        let (session, backend) = session(MockBackend::embedding(8));
        assert_eq!(session.state().await, SessionState::Uninitialized);

        drop(session.acquire().await.unwrap());
        drop(session.acquire().await.unwrap());

        assert_eq!(session.state().await, SessionState::Ready);
        assert_eq!(backend.load_count(), 1);
        assert!(session.last_checked_at().await.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_during_load_loads_once() {
        let (session, backend) =
            session(MockBackend::embedding(8).with_load_delay(Duration::from_millis(100)));
        let session = Arc::new(session);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let session = Arc::clone(&session);
            tasks.push(tokio::spawn(async move {
                session.acquire().await.map(|handle| drop(handle))
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(backend.load_count(), 1);
        assert_eq!(session.state().await, SessionState::Ready);
    }

    #[tokio::test]
    async fn test_recovery_after_failed_load() {
        let (session, backend) = session(MockBackend::embedding(8).with_failing_loads(1));

        let err = session.acquire().await.err().unwrap();
        assert!(matches!(err, EmbedError::ModelLoad { .. }));
        assert_eq!(session.state().await, SessionState::Error);

        assert!(session.acquire().await.is_ok());
        assert_eq!(session.retry_count().await, 1);
        assert_eq!(backend.load_count(), 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let (session, backend) = session(MockBackend::embedding(8).with_failing_loads(usize::MAX));

        for _ in 0..4 {
            assert!(session.acquire().await.is_err());
        }
        let err = session.acquire().await.err().unwrap();
        assert!(matches!(err, EmbedError::SessionUnavailable { attempts: 3, .. }));
        // Terminal: no further load attempts
        assert!(session.acquire().await.is_err());
        assert_eq!(backend.load_count(), 4);

        session.close().await;
        assert_eq!(session.retry_count().await, 0);
        assert_eq!(session.state().await, SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_invalidate_triggers_recovery_and_closes_old_handle() {
        let (session, backend) = session(MockBackend::embedding(8));
        drop(session.acquire().await.unwrap());

        session.invalidate().await;
        assert_eq!(session.state().await, SessionState::Error);

        drop(session.acquire().await.unwrap());
        assert_eq!(backend.load_count(), 2);
        assert_eq!(backend.close_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abandoned_acquire_still_settles_state() {
        let (session, backend) =
            session(MockBackend::embedding(8).with_load_delay(Duration::from_millis(100)));

        let abandoned = tokio::time::timeout(Duration::from_millis(20), session.acquire()).await;
        assert!(abandoned.is_err());
        assert_eq!(session.state().await, SessionState::Loading);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(session.state().await, SessionState::Ready);

        drop(session.acquire().await.unwrap());
        drop(session.acquire().await.unwrap());
        assert_eq!(backend.load_count(), 1);
    }

    #[tokio::test]
    async fn test_close_during_load_discards_new_handle() {
        let (session, backend) =
            session(MockBackend::embedding(8).with_load_delay(Duration::from_millis(100)));
        let session = Arc::new(session);

        let waiting = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.acquire().await.map(drop) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.close().await;

        assert!(waiting.await.unwrap().is_err());
        assert_eq!(session.state().await, SessionState::Uninitialized);
        assert_eq!(backend.close_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_and_timeout() {
        let (session, backend) = session(
            MockBackend::embedding(4).with_slow_token(7, Duration::from_millis(300)),
        );

        let handle = session.acquire().await.unwrap();
        let outputs = handle
            .run(vec![InputTensor::sequence("input_ids", vec![1, 2])], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outputs[0].shape, vec![1, 2, 4]);

        let handle = session.acquire().await.unwrap();
        let err = handle
            .run(vec![InputTensor::sequence("input_ids", vec![7])], Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbedError::InferenceTimeout { .. }));
        assert_eq!(session.state().await, SessionState::Error);

        // Next acquire recovers with a fresh handle
        assert!(session.acquire().await.is_ok());
        assert_eq!(backend.load_count(), 2);
    }
}

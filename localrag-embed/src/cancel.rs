//! Cooperative cancellation with a confirm-then-reset stop handshake.
//!
//! ## Key Components
//!
//! - **CancellationToken**: a cheap, cloneable flag threaded through every
//!   long-running call. Work checks it at stage boundaries (tokenize, infer,
//!   extract, store) and between chunks or documents.
//! - **StopCoordinator**: owns the token for top-level operations and tracks
//!   which modules are currently active. A stop request cancels the current
//!   token, but a fresh token is only installed once every active module has
//!   left. Until then, operations that start late still receive the cancelled
//!   token and stop immediately.
//! - **ActivityGuard**: RAII registration of a module as active. Dropping the
//!   guard is the module's confirmation that it has stopped.
//!
//! ```text
//! request_stop() ──► token cancelled ──► modules observe, unwind, drop guards
//!                                              │
//!                      last guard dropped ◄────┘
//!                              │
//!                      fresh token installed, waiters notified
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::{EmbedError, Result};

/// Modules that take part in the stop handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopModule {
    Builder,
    Embedding,
    Reranker,
    Tokenizer,
    Query,
}

impl std::fmt::Display for StopModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopModule::Builder => write!(f, "builder"),
            StopModule::Embedding => write!(f, "embedding"),
            StopModule::Reranker => write!(f, "reranker"),
            StopModule::Tokenizer => write!(f, "tokenizer"),
            StopModule::Query => write!(f, "query"),
        }
    }
}

/// Cloneable cancellation flag.
#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    coordinator: Option<Weak<CoordinatorInner>>,
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("coordinated", &self.coordinator.is_some())
            .finish()
    }
}

impl CancellationToken {
    /// A standalone token, not tied to any coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns [`EmbedError::Cancelled`] if the token has been cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(EmbedError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Registers `module` as active until the returned guard is dropped.
    ///
    /// For standalone tokens the guard does nothing.
    pub fn enter(&self, module: StopModule) -> ActivityGuard {
        let coordinator = self.coordinator.as_ref().and_then(Weak::upgrade);
        if let Some(inner) = &coordinator {
            let mut active = inner.lock_active();
            *active.entry(module).or_insert(0) += 1;
        }
        ActivityGuard {
            module,
            coordinator,
        }
    }
}

/// Marks a module as active for the lifetime of the guard.
#[must_use = "the module is considered stopped as soon as the guard is dropped"]
pub struct ActivityGuard {
    module: StopModule,
    coordinator: Option<Arc<CoordinatorInner>>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.coordinator.take() {
            CoordinatorInner::leave(&inner, self.module);
        }
    }
}

struct CoordinatorInner {
    current: Mutex<CancellationToken>,
    active: Mutex<HashMap<StopModule, usize>>,
    stop_requested: AtomicBool,
    stopped: Notify,
}

impl CoordinatorInner {
    fn lock_active(&self) -> MutexGuard<'_, HashMap<StopModule, usize>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_current(&self) -> MutexGuard<'_, CancellationToken> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn leave(this: &Arc<Self>, module: StopModule) {
        let all_stopped = {
            let mut active = this.lock_active();
            if let Some(count) = active.get_mut(&module) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    active.remove(&module);
                }
            }
            active.is_empty()
        };
        if this.stop_requested.load(Ordering::SeqCst) {
            debug!("Module {} confirmed stop", module);
            if all_stopped {
                Self::reset(this);
            }
        }
    }

    fn reset(this: &Arc<Self>) {
        if this
            .stop_requested
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *this.lock_current() = CancellationToken {
                flag: Arc::new(AtomicBool::new(false)),
                coordinator: Some(Arc::downgrade(this)),
            };
            info!("All modules stopped, cancellation signal reset");
            this.stopped.notify_waiters();
        }
    }
}

/// Coordinates process-level stop requests across modules.
#[derive(Clone)]
pub struct StopCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for StopCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopCoordinator")
            .field("stop_pending", &self.is_stop_pending())
            .field("active_modules", &self.active_modules())
            .finish()
    }
}

impl Default for StopCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl StopCoordinator {
    pub fn new() -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<CoordinatorInner>| CoordinatorInner {
            current: Mutex::new(CancellationToken {
                flag: Arc::new(AtomicBool::new(false)),
                coordinator: Some(weak.clone()),
            }),
            active: Mutex::new(HashMap::new()),
            stop_requested: AtomicBool::new(false),
            stopped: Notify::new(),
        });
        Self { inner }
    }

    /// The token new operations should use.
    ///
    /// While a stop is pending this is the cancelled token.
    pub fn token(&self) -> CancellationToken {
        self.inner.lock_current().clone()
    }

    /// Cancels the current token. The reset happens once every active module
    /// has dropped its guard, or immediately if nothing is active.
    pub fn request_stop(&self) {
        self.inner.lock_current().cancel();
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        let active = self.active_modules();
        info!("Stop requested, waiting for modules: {:?}", active);
        if active.is_empty() {
            CoordinatorInner::reset(&self.inner);
        }
    }

    /// Whether a stop was requested and some module has not confirmed yet.
    pub fn is_stop_pending(&self) -> bool {
        self.inner.stop_requested.load(Ordering::SeqCst)
    }

    /// Modules currently holding an activity guard.
    pub fn active_modules(&self) -> Vec<StopModule> {
        self.inner.lock_active().keys().copied().collect()
    }

    pub fn is_module_stopped(&self, module: StopModule) -> bool {
        !self.inner.lock_active().contains_key(&module)
    }

    /// Waits until a pending stop has been confirmed by every module.
    ///
    /// Returns `false` if `timeout` elapses first.
    pub async fn wait_until_stopped(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.inner.stopped.notified();
                if !self.is_stop_pending() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standalone_token() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(EmbedError::Cancelled)));

        // Guards on standalone tokens are inert
        let _guard = token.enter(StopModule::Embedding);
    }

    #[test]
    fn test_stop_without_active_modules_resets_immediately() {
        let coordinator = StopCoordinator::new();
        let old = coordinator.token();

        coordinator.request_stop();

        assert!(old.is_cancelled());
        assert!(!coordinator.is_stop_pending());
        assert!(!coordinator.token().is_cancelled());
    }

    #[test]
    fn test_reset_waits_for_every_active_module() {
        let coordinator = StopCoordinator::new();
        let token = coordinator.token();
        let builder = token.enter(StopModule::Builder);
        let embedding = token.enter(StopModule::Embedding);

        coordinator.request_stop();
        assert!(token.is_cancelled());
        assert!(coordinator.is_stop_pending());
        // A late starter inherits the cancelled state
        assert!(coordinator.token().is_cancelled());

        drop(builder);
        assert!(coordinator.is_module_stopped(StopModule::Builder));
        assert!(!coordinator.is_module_stopped(StopModule::Embedding));
        assert!(coordinator.is_stop_pending());
        assert!(coordinator.token().is_cancelled());

        drop(embedding);
        assert!(!coordinator.is_stop_pending());
        assert!(!coordinator.token().is_cancelled());
        // The old token stays cancelled for stragglers
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_nested_guards_for_same_module() {
        let coordinator = StopCoordinator::new();
        let token = coordinator.token();
        let first = token.enter(StopModule::Reranker);
        let second = token.enter(StopModule::Reranker);

        coordinator.request_stop();
        drop(first);
        assert!(coordinator.is_stop_pending());
        drop(second);
        assert!(!coordinator.is_stop_pending());
    }

    #[tokio::test]
    async fn test_wait_until_stopped() {
        let coordinator = StopCoordinator::new();
        let token = coordinator.token();
        let guard = token.enter(StopModule::Query);

        coordinator.request_stop();
        assert!(!coordinator.wait_until_stopped(Duration::from_millis(20)).await);

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.wait_until_stopped(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        assert!(waiter.await.unwrap());
        assert!(!coordinator.token().is_cancelled());
    }
}

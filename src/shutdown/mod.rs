//! Graceful shutdown coordination
//!
//! A `Coordinator` is built once at process entry and cloned into every
//! component that runs long-lived work. Components either register work
//! explicitly (`register_work` / `complete_work`) or hold a [`WorkGuard`],
//! and watch the cancellation token to know when to wind down.
//!
//! Shutdown moves through `Idle -> Draining -> Done` exactly once:
//!
//! ```text
//! request_shutdown ──► cancel token fired ──► wait for outstanding == 0 ─┐
//!        │                                                               ├─► done
//!        └──────────────────────► timeout budget elapsed (warn) ─────────┘
//! ```
//!
//! Requests made while draining (or after) are no-ops.

mod signal;

pub use signal::{listen as listen_signals, Termination};

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default drain budget
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

const STATE_IDLE: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_DONE: u8 = 2;

/// Lifecycle phase of the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Draining,
    Done,
}

/// How the drain finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every registered unit of work completed
    Clean,
    /// The timeout budget elapsed first; in-flight work was abandoned
    TimedOut { outstanding: usize },
}

struct Inner {
    state: AtomicU8,
    outstanding: AtomicUsize,
    idle: Notify,
    cancel: CancellationToken,
    done: CancellationToken,
    timed_out: AtomicBool,
    abandoned: AtomicUsize,
    timeout: Duration,
}

impl Inner {
    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a completion between the
            // check and the await is not missed.
            notified.as_mut().enable();

            if self.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn complete(&self) {
        let prev = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        match prev {
            Ok(1) => self.idle.notify_waiters(),
            Ok(_) => {}
            Err(_) => panic!("complete_work called without a matching register_work"),
        }
    }
}

/// Process-wide shutdown coordinator. Cheap to clone.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Create a coordinator with the given drain budget
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(STATE_IDLE),
                outstanding: AtomicUsize::new(0),
                idle: Notify::new(),
                cancel: CancellationToken::new(),
                done: CancellationToken::new(),
                timed_out: AtomicBool::new(false),
                abandoned: AtomicUsize::new(0),
                timeout,
            }),
        }
    }

    /// Register one unit of outstanding work.
    ///
    /// Must be paired with exactly one `complete_work`.
    pub fn register_work(&self) {
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    /// Mark one unit of work as complete.
    ///
    /// # Panics
    ///
    /// Panics when called more often than `register_work`.
    pub fn complete_work(&self) {
        self.inner.complete();
    }

    /// Register one unit of work that completes when the guard is dropped
    pub fn work_guard(&self) -> WorkGuard {
        self.register_work();
        WorkGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of registered units not yet completed
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// The shared cancellation token; fired when shutdown begins
    pub fn token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Whether shutdown has begun
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> Phase {
        match self.inner.state.load(Ordering::Acquire) {
            STATE_IDLE => Phase::Idle,
            STATE_DRAINING => Phase::Draining,
            _ => Phase::Done,
        }
    }

    /// Begin shutdown.
    ///
    /// Returns `true` for the single call that started the drain; every other
    /// call (concurrent or later) returns `false` and has no effect.
    /// Must be called from within a tokio runtime.
    pub fn request_shutdown(&self, reason: &str) -> bool {
        if self
            .inner
            .state
            .compare_exchange(STATE_IDLE, STATE_DRAINING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Shutdown already in progress, ignoring request ({})", reason);
            return false;
        }

        info!("Shutdown requested: {}", reason);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let drain = async {
                debug!("Cancelling shared context");
                inner.cancel.cancel();
                debug!("Waiting for {} outstanding units of work", inner.outstanding.load(Ordering::Acquire));
                inner.wait_idle().await;
            };

            match tokio::time::timeout(inner.timeout, drain).await {
                Ok(()) => info!("All work drained"),
                Err(_) => {
                    let outstanding = inner.outstanding.load(Ordering::Acquire);
                    inner.abandoned.store(outstanding, Ordering::Release);
                    inner.timed_out.store(true, Ordering::Release);
                    warn!(
                        "Shutdown timed out after {:?}, abandoning {} units of work",
                        inner.timeout, outstanding
                    );
                }
            }

            inner.state.store(STATE_DONE, Ordering::Release);
            inner.done.cancel();
        });

        true
    }

    /// Request shutdown (idempotent) and wait until it has fully completed
    pub async fn await_shutdown_complete(&self) -> DrainOutcome {
        self.request_shutdown("awaiting shutdown completion");
        self.wait_done().await
    }

    /// Wait for the done signal without requesting shutdown
    pub async fn wait_done(&self) -> DrainOutcome {
        self.inner.done.cancelled().await;
        self.outcome()
    }

    /// Whether the done signal has fired
    pub fn is_done(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    fn outcome(&self) -> DrainOutcome {
        if self.inner.timed_out.load(Ordering::Acquire) {
            DrainOutcome::TimedOut {
                outstanding: self.inner.abandoned.load(Ordering::Acquire),
            }
        } else {
            DrainOutcome::Clean
        }
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(DEFAULT_SHUTDOWN_TIMEOUT)
    }
}

/// One unit of registered work, completed on drop
pub struct WorkGuard {
    inner: Arc<Inner>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.inner.complete();
    }
}

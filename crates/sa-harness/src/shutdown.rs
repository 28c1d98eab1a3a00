use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal: cooperative shutdown coordination
// ---------------------------------------------------------------------------

/// Watch-based shutdown coordinator shared by the daemon loop, the worker
/// pool and the healing monitor.
///
/// The flag is sticky: a component that starts waiting after `trigger()`
/// still observes the shutdown immediately.
///
/// ```ignore
/// let shutdown = ShutdownSignal::new();
///
/// tokio::select! {
///     _ = shutdown.cancelled() => { /* graceful cleanup */ }
///     _ = run_cycle() => {}
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    state: Arc<watch::Sender<bool>>,
    /// Counts components that finished draining.
    drain_tx: Arc<watch::Sender<usize>>,
    drain_rx: watch::Receiver<usize>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        let (drain_tx, drain_rx) = watch::channel(0);
        Self {
            state: Arc::new(state),
            drain_tx: Arc::new(drain_tx),
            drain_rx,
        }
    }

    /// A receiver that flips to `true` on shutdown.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.state.borrow()
    }

    /// Trigger shutdown for all subscribers. Later calls are ignored.
    pub fn trigger(&self) {
        let first = self.state.send_if_modified(|down| {
            if *down {
                false
            } else {
                *down = true;
                true
            }
        });
        if first {
            info!("shutdown signal triggered");
        } else {
            warn!("shutdown already triggered");
        }
    }

    /// Resolves once shutdown has been triggered.
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this only returns on shutdown.
        let _ = rx.wait_for(|down| *down).await;
    }

    /// Sleep for `duration` unless shutdown arrives first. Returns `true`
    /// when the sleep was cut short (or shutdown was already pending).
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_shutting_down() {
            return true;
        }
        tokio::select! {
            _ = self.cancelled() => true,
            _ = tokio::time::sleep(duration) => self.is_shutting_down(),
        }
    }

    /// A drain guard for one participating component.
    pub fn guard(&self) -> ShutdownGuard {
        ShutdownGuard::new(self.clone())
    }

    /// Notify that a component has finished draining.
    pub fn confirm_drained(&self) {
        self.drain_tx.send_modify(|count| *count += 1);
    }

    /// Wait for `expected` components to confirm drain, with a timeout.
    pub async fn wait_for_drain(&mut self, expected: usize, timeout: Duration) -> DrainResult {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let current = *self.drain_rx.borrow_and_update();
            if current >= expected {
                info!(count = current, "all components drained");
                return DrainResult::Complete(current);
            }

            match tokio::time::timeout_at(deadline, self.drain_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return DrainResult::Complete(*self.drain_rx.borrow()),
                Err(_) => {
                    let confirmed = *self.drain_rx.borrow();
                    warn!(confirmed, expected, "drain timeout, some components did not confirm");
                    return DrainResult::Timeout {
                        confirmed,
                        expected,
                    };
                }
            }
        }
    }

    /// Number of receivers currently watching for shutdown.
    pub fn subscriber_count(&self) -> usize {
        self.state.receiver_count()
    }

    /// Trigger shutdown on ctrl-c, and on SIGTERM where supported.
    pub fn listen_for_os_signals(&self) -> JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                name = os_signal() => {
                    info!(signal = name, "signal received, initiating shutdown");
                    signal.trigger();
                }
                _ = signal.cancelled() => {}
            }
        })
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn os_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => tokio::select! {
            _ = tokio::signal::ctrl_c() => "ctrl_c",
            _ = term.recv() => "sigterm",
        },
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            ctrl_c().await
        }
    }
}

#[cfg(not(unix))]
async fn os_signal() -> &'static str {
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    "ctrl_c"
}

// ---------------------------------------------------------------------------
// DrainResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    /// All expected components confirmed drain.
    Complete(usize),
    /// Timeout expired before all components confirmed.
    Timeout { confirmed: usize, expected: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete(_))
    }
}

// ---------------------------------------------------------------------------
// ShutdownGuard: confirms drain on drop
// ---------------------------------------------------------------------------

/// Calls `confirm_drained()` when dropped. Hand one to each long-running
/// loop; dropping it at loop exit signals completion.
pub struct ShutdownGuard {
    signal: ShutdownSignal,
}

impl ShutdownGuard {
    pub fn new(signal: ShutdownSignal) -> Self {
        Self { signal }
    }

    pub fn signal(&self) -> &ShutdownSignal {
        &self.signal
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.signal.confirm_drained();
    }
}

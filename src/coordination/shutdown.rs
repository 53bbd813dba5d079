//! Graceful shutdown
//!
//! One `GracefulShutdown` per process. Loops and monitor tasks hold a cloned
//! `ShutdownToken` and exit at their next `select!` once shutdown is
//! requested; the orchestrator then drains the task handles, optionally
//! closes positions and disconnects the exchange, each phase bounded by the
//! configured grace period.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM, SIGINT or an operator request
    Graceful,
    /// SIGQUIT; positions are left alone regardless of configuration
    Urgent,
    /// Internal fault; no draining beyond the task handles
    Emergency,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
            ShutdownSignal::Emergency => write!(f, "emergency"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Upper bound for each phase
    pub grace_period: Duration,
    /// Best-effort close of open positions before disconnecting
    pub close_positions: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            close_positions: false,
        }
    }
}

/// Shutdown phase tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    /// Loops told to stop; waiting for their tasks to finish
    DrainingTasks,
    ClosingPositions,
    Disconnecting,
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::DrainingTasks => write!(f, "draining_tasks"),
            ShutdownPhase::ClosingPositions => write!(f, "closing_positions"),
            ShutdownPhase::Disconnecting => write!(f, "disconnecting"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

pub type ShutdownStep = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Graceful shutdown coordinator
pub struct GracefulShutdown {
    config: ShutdownConfig,
    shutdown_requested: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    phase: watch::Sender<ShutdownPhase>,
    phase_rx: watch::Receiver<ShutdownPhase>,
    signal_tx: broadcast::Sender<ShutdownSignal>,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        let (phase, phase_rx) = watch::channel(ShutdownPhase::Running);
        let (signal_tx, _) = broadcast::channel(8);

        Self {
            config,
            shutdown_requested: AtomicBool::new(false),
            cancel_tx,
            phase,
            phase_rx,
            signal_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ShutdownConfig::default())
    }

    pub fn config(&self) -> &ShutdownConfig {
        &self.config
    }

    /// Subscribe to shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.signal_tx.subscribe()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase_rx.borrow()
    }

    /// Request shutdown; every token observes it immediately.
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
            return;
        }

        info!("Shutdown requested: {}", signal);
        self.cancel_tx.send_replace(true);
        let _ = self.signal_tx.send(signal);
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        self.phase.send_replace(phase);
        info!("Shutdown phase: {}", phase);
    }

    /// Token for tasks that must stop when shutdown is requested
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.cancel_tx.subscribe(),
            _detached: None,
        }
    }

    /// Run the shutdown sequence after `request_shutdown`.
    ///
    /// 1. Wait for the task handles, aborting stragglers after the grace period
    /// 2. Close positions when configured and the signal allows it
    /// 3. Disconnect
    pub async fn execute(
        &self,
        signal: ShutdownSignal,
        tasks: Vec<(&'static str, tokio::task::JoinHandle<()>)>,
        close_positions: ShutdownStep,
        disconnect: ShutdownStep,
    ) -> Result<(), ShutdownError> {
        let start = std::time::Instant::now();
        let grace = self.config.grace_period;
        let mut timed_out = false;

        self.set_phase(ShutdownPhase::DrainingTasks);
        for (name, mut handle) in tasks {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => debug!(task = name, "task stopped"),
                Ok(Err(e)) => warn!(task = name, error = %e, "task ended abnormally"),
                Err(_) => {
                    warn!(task = name, "task did not stop within {:?}, aborting", grace);
                    handle.abort();
                    timed_out = true;
                }
            }
        }

        if self.config.close_positions && signal == ShutdownSignal::Graceful {
            self.set_phase(ShutdownPhase::ClosingPositions);
            if tokio::time::timeout(grace, close_positions).await.is_err() {
                warn!("Position close timeout after {:?}, proceeding anyway", grace);
                timed_out = true;
            }
        }

        self.set_phase(ShutdownPhase::Disconnecting);
        if tokio::time::timeout(grace, disconnect).await.is_err() {
            warn!("Disconnect timeout after {:?}", grace);
            timed_out = true;
        }

        self.set_phase(ShutdownPhase::Complete);
        info!("Shutdown completed in {:?}", start.elapsed());

        if timed_out {
            return Err(ShutdownError::Timeout);
        }
        Ok(())
    }
}

/// Cloneable handle observed by long-running tasks
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
    /// Sender owned by a detached token so its channel never closes
    _detached: Option<Arc<watch::Sender<bool>>>,
}

impl ShutdownToken {
    /// A token that is never cancelled, for callers outside the orchestrator
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _detached: Some(Arc::new(tx)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Shutdown errors
#[derive(Debug, Clone)]
pub enum ShutdownError {
    /// A phase exceeded the grace period
    Timeout,
}

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownError::Timeout => write!(f, "shutdown timed out"),
        }
    }
}

impl std::error::Error for ShutdownError {}

/// Install OS signal handlers that request shutdown.
pub fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, name, request) in [
            (SignalKind::terminate(), "SIGTERM", ShutdownSignal::Graceful),
            (SignalKind::interrupt(), "SIGINT", ShutdownSignal::Graceful),
            (SignalKind::quit(), "SIGQUIT", ShutdownSignal::Urgent),
        ] {
            let shutdown = shutdown.clone();
            match signal(kind) {
                Ok(mut stream) => {
                    tokio::spawn(async move {
                        if stream.recv().await.is_some() {
                            info!("Received {}", name);
                            shutdown.request_shutdown(request);
                        }
                    });
                }
                Err(e) => warn!(signal = name, error = %e, "failed to install signal handler"),
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C");
                    shutdown.request_shutdown(ShutdownSignal::Graceful);
                }
                Err(e) => warn!(error = %e, "failed to listen for Ctrl+C"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_signal_display() {
        assert_eq!(ShutdownSignal::Graceful.to_string(), "graceful");
        assert_eq!(ShutdownSignal::Urgent.to_string(), "urgent");
        assert_eq!(ShutdownPhase::DrainingTasks.to_string(), "draining_tasks");
    }

    #[tokio::test]
    async fn test_token_observes_request() {
        let shutdown = GracefulShutdown::with_defaults();
        let token = shutdown.token();
        assert!(!token.is_cancelled());

        let waiter = tokio::spawn({
            let token = token.clone();
            async move { token.cancelled().await }
        });
        shutdown.request_shutdown(ShutdownSignal::Graceful);
        waiter.await.unwrap();
        assert!(token.is_cancelled());
        assert!(shutdown.is_shutdown_requested());

        // duplicate request is ignored
        shutdown.request_shutdown(ShutdownSignal::Urgent);
        assert!(shutdown.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_execute_aborts_stuck_task() {
        let shutdown = GracefulShutdown::new(ShutdownConfig {
            grace_period: Duration::from_millis(20),
            close_positions: true,
        });
        shutdown.request_shutdown(ShutdownSignal::Graceful);

        let stuck = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();

        let result = shutdown
            .execute(
                ShutdownSignal::Graceful,
                vec![("stuck", stuck)],
                Box::pin(async move {
                    flag.store(true, Ordering::SeqCst);
                }),
                Box::pin(async {}),
            )
            .await;

        assert!(matches!(result, Err(ShutdownError::Timeout)));
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(shutdown.current_phase(), ShutdownPhase::Complete);
    }

    #[tokio::test]
    async fn test_urgent_skips_position_close() {
        let shutdown = GracefulShutdown::new(ShutdownConfig {
            grace_period: Duration::from_millis(20),
            close_positions: true,
        });
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        shutdown
            .execute(
                ShutdownSignal::Urgent,
                Vec::new(),
                Box::pin(async move {
                    flag.store(true, Ordering::SeqCst);
                }),
                Box::pin(async {}),
            )
            .await
            .unwrap();
        assert!(!closed.load(Ordering::SeqCst));
    }
}

//! Graceful shutdown coordination.
//!
//! A single [`CancellationToken`] is handed to the HTTP server and to every
//! background loop (sweeps, write-behind flushes, health checks). Each loop
//! holds a [`TaskGuard`] until its final flush has completed, so `main` can
//! wait for buffered usage rows, alert records and security logs to reach
//! storage before exiting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Coordinates shutdown across the server and its background loops.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    /// Background loops that have not finished their final flush.
    in_flight: Arc<AtomicUsize>,
    /// Upper bound on the drain after the signal fires.
    timeout_seconds: u64,
}

impl ShutdownCoordinator {
    pub fn new(timeout_seconds: u64) -> Self {
        Self {
            token: CancellationToken::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            timeout_seconds,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Register a background loop. The returned guard releases it on drop.
    pub fn track_task(&self) -> TaskGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        TaskGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Wait for tracked loops to drain, up to the configured timeout.
    ///
    /// Returns `false` if the timeout expired with loops still running.
    pub async fn wait_for_tasks(&self) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.timeout_seconds);
        loop {
            let count = self.in_flight_count();
            if count == 0 {
                info!("background tasks drained");
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining_tasks = count,
                    timeout_seconds = self.timeout_seconds,
                    "shutdown timeout expired before background tasks drained"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// RAII guard that releases a tracked task on drop.
pub struct TaskGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Signal handling
// ---------------------------------------------------------------------------

/// Resolves when SIGTERM, SIGINT (Ctrl-C elsewhere) or a programmatic
/// trigger is observed, then cancels the shared token.
///
/// If a signal handler cannot be installed the failure is logged and only
/// the remaining sources are awaited.
pub async fn shutdown_signal(coordinator: ShutdownCoordinator) {
    let token = coordinator.token();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let wait_for = |kind: SignalKind, name: &'static str| async move {
            match signal(kind) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!(signal = name, "shutdown signal received");
                }
                Err(e) => {
                    error!(signal = name, error = %e, "failed to install signal handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = wait_for(SignalKind::terminate(), "SIGTERM") => {}
            _ = wait_for(SignalKind::interrupt(), "SIGINT") => {}
            _ = token.cancelled() => {
                info!("shutdown requested programmatically");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!(signal = "ctrl_c", "shutdown signal received"),
                    Err(e) => {
                        error!(error = %e, "failed to listen for Ctrl-C");
                        token.cancelled().await;
                    }
                }
            }
            _ = token.cancelled() => {
                info!("shutdown requested programmatically");
            }
        }
    }

    coordinator.trigger();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_cancels_shared_token() {
        let coord = ShutdownCoordinator::new(30);
        let clone = coord.clone();
        assert!(!clone.is_shutting_down());
        coord.trigger();
        assert!(clone.is_shutting_down());
        assert!(clone.token().is_cancelled());
    }

    #[test]
    fn test_task_guards_are_counted() {
        let coord = ShutdownCoordinator::new(30);
        let a = coord.track_task();
        let b = coord.clone().track_task();
        assert_eq!(coord.in_flight_count(), 2);
        drop(a);
        assert_eq!(coord.in_flight_count(), 1);
        drop(b);
        assert_eq!(coord.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_returns_once_final_flush_finishes() {
        let coord = ShutdownCoordinator::new(5);
        let guard = coord.track_task();
        let token = coord.token();
        tokio::spawn(async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        coord.trigger();
        assert!(coord.wait_for_tasks().await);
    }

    #[tokio::test]
    async fn test_wait_times_out_on_stuck_task() {
        let coord = ShutdownCoordinator::new(1);
        let _guard = coord.track_task();
        let start = tokio::time::Instant::now();
        assert!(!coord.wait_for_tasks().await);
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_signal_future_resolves_on_trigger() {
        let coord = ShutdownCoordinator::new(30);
        let trigger = coord.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.trigger();
        });
        tokio::time::timeout(Duration::from_secs(2), shutdown_signal(coord.clone()))
            .await
            .unwrap();
        assert!(coord.is_shutting_down());
    }
}

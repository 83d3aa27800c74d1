//! Background maintenance loops.
//!
//! Every loop runs until the shutdown token is cancelled. Write-behind loops
//! perform one last flush on the way out, and each loop holds a
//! [`TaskGuard`](crate::shutdown::TaskGuard) until it has returned.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::shutdown::ShutdownCoordinator;
use crate::state::AppState;

/// Run `tick` every `period` until `token` is cancelled, then `finish` once.
fn spawn_periodic<T, TF, F, FF>(
    name: &'static str,
    period: Duration,
    coordinator: &ShutdownCoordinator,
    mut tick: T,
    finish: F,
) -> JoinHandle<()>
where
    T: FnMut() -> TF + Send + 'static,
    TF: Future<Output = ()> + Send,
    F: FnOnce() -> FF + Send + 'static,
    FF: Future<Output = ()> + Send,
{
    let guard = coordinator.track_task();
    let token = coordinator.token();
    tokio::spawn(async move {
        let _guard = guard;
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(10)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => tick().await,
            }
        }
        finish().await;
        debug!(task = name, "background task stopped");
    })
}

async fn nothing() {}

/// Spawn every background loop the configuration enables.
pub fn spawn_background_tasks(
    state: &Arc<AppState>,
    coordinator: &ShutdownCoordinator,
) -> Vec<JoinHandle<()>> {
    let config = &state.config;
    let mut handles = Vec::new();

    let s = Arc::clone(state);
    handles.push(spawn_periodic(
        "admission_sweep",
        Duration::from_secs(config.admission.sweep_interval_seconds),
        coordinator,
        move || {
            let s = Arc::clone(&s);
            async move {
                match s.admission.sweep().await {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "admission sweep"),
                    Err(e) => warn!(error = %e, "admission sweep failed"),
                }
            }
        },
        nothing,
    ));

    let s = Arc::clone(state);
    handles.push(spawn_periodic(
        "csrf_sweep",
        Duration::from_secs(config.csrf.sweep_interval_seconds),
        coordinator,
        move || {
            let s = Arc::clone(&s);
            async move {
                let removed = s.csrf.sweep();
                if removed > 0 {
                    debug!(removed, "csrf sweep");
                }
            }
        },
        nothing,
    ));

    let (tick_state, final_state) = (Arc::clone(state), Arc::clone(state));
    handles.push(spawn_periodic(
        "usage_flush",
        Duration::from_secs(config.quota.flush_interval_seconds),
        coordinator,
        move || {
            let s = Arc::clone(&tick_state);
            async move {
                s.quota.flush().await;
            }
        },
        move || async move {
            let report = final_state.quota.flush().await;
            info!(written = report.written, failed = report.failed, "final usage flush");
        },
    ));

    let (tick_state, final_state) = (Arc::clone(state), Arc::clone(state));
    handles.push(spawn_periodic(
        "alert_flush",
        Duration::from_secs(config.alerts.flush_interval_seconds),
        coordinator,
        move || {
            let s = Arc::clone(&tick_state);
            async move {
                s.alerts.flush().await;
            }
        },
        move || async move {
            let report = final_state.alerts.flush().await;
            info!(written = report.written, failed = report.failed, "final alert flush");
        },
    ));

    handles.push(spawn_security_log_flush(
        Arc::clone(state),
        coordinator,
        Duration::from_secs(config.security_log.flush_interval_seconds),
    ));

    if config.health.enabled {
        let s = Arc::clone(state);
        handles.push(spawn_periodic(
            "health_check",
            Duration::from_secs(config.health.check_interval_seconds),
            coordinator,
            move || {
                let s = Arc::clone(&s);
                async move {
                    s.health.check_and_react().await;
                }
            },
            nothing,
        ));
    }

    info!(tasks = handles.len(), "background tasks started");
    handles
}

/// The security log flushes on its interval or as soon as the buffer
/// reaches its batch size, whichever comes first.
fn spawn_security_log_flush(
    state: Arc<AppState>,
    coordinator: &ShutdownCoordinator,
    period: Duration,
) -> JoinHandle<()> {
    let guard = coordinator.track_task();
    let token: CancellationToken = coordinator.token();
    tokio::spawn(async move {
        let _guard = guard;
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(10)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
                _ = state.security_log.flush_requested() => {}
            }
            state.security_log.flush().await;
        }
        let report = state.security_log.flush().await;
        info!(written = report.written, failed = report.failed, "final security log flush");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use guardian_core::{GuardianConfig, ManualClock, SecurityEventType, StorageConfig, TenantId};
    use guardian_storage::StorageProfile;

    use crate::security_log::SecurityEvent;

    async fn state(config: GuardianConfig) -> Arc<AppState> {
        let storage = StorageProfile::from_config(&StorageConfig::default())
            .unwrap()
            .build()
            .await
            .unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).unwrap(),
        ));
        Arc::new(AppState::new(config, storage, clock).unwrap())
    }

    #[tokio::test]
    async fn test_tasks_flush_on_shutdown() {
        let state = state(GuardianConfig::default()).await;
        let coordinator = ShutdownCoordinator::new(5);
        let handles = spawn_background_tasks(&state, &coordinator);
        assert_eq!(coordinator.in_flight_count(), handles.len());

        state
            .record_usage(&TenantId::new("acme"), "sms", 13.0, 0, 0)
            .await;
        state
            .security_log
            .log(SecurityEvent::new(SecurityEventType::AuthFailure, "10.0.0.1"));
        assert_eq!(state.quota.pending_rows(), 1);

        coordinator.trigger();
        assert!(coordinator.wait_for_tasks().await);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(state.quota.pending_rows(), 0);
        assert_eq!(state.alerts.pending_records(), 0);
        assert_eq!(state.security_log.buffered(), 0);
    }

    #[tokio::test]
    async fn test_security_log_flushes_when_batch_fills() {
        let mut config = GuardianConfig::default();
        config.security_log.buffer_size = 2;
        config.security_log.flush_interval_seconds = 3600;
        let state = state(config).await;
        let coordinator = ShutdownCoordinator::new(5);
        let handle = spawn_security_log_flush(
            Arc::clone(&state),
            &coordinator,
            Duration::from_secs(3600),
        );

        for ip in ["10.0.0.1", "10.0.0.2"] {
            state
                .security_log
                .log(SecurityEvent::new(SecurityEventType::AuthFailure, ip));
        }
        for _ in 0..50 {
            if state.security_log.buffered() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(state.security_log.buffered(), 0);

        coordinator.trigger();
        handle.await.unwrap();
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_health_task_disabled_by_config() {
        let mut config = GuardianConfig::default();
        config.health.enabled = false;
        let state = state(config).await;
        let coordinator = ShutdownCoordinator::new(5);
        let handles = spawn_background_tasks(&state, &coordinator);
        assert_eq!(handles.len(), 5);
        coordinator.trigger();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}

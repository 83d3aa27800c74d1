//! Periodic health checks.
//!
//! Each pass probes the database, the upstream API credentials and the size
//! of the in-memory guardian tables. Warnings raise a WARNING health alert;
//! critical results raise a CRITICAL alert and run the matching auto-heal
//! remediation.

use chrono::{DateTime, Utc};
use guardian_core::{HealthConfig, HealthLevel, SharedClock, UsageRepository};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::admission::AdmissionController;
use crate::auto_heal::{AutoHealController, ModeStatus};
use crate::csrf::CsrfGuard;
use crate::health_alerts::HealthAlerter;

/// Health reports kept for [`HealthMonitor::history`].
const REPORT_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub name: String,
    pub status: CheckStatus,
    pub detail: Value,
}

impl ComponentCheck {
    fn new(name: &str, status: CheckStatus, detail: Value) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail,
        }
    }
}

/// Outcome of one health pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst component status.
    pub status: CheckStatus,
    pub mode: ModeStatus,
    pub components: Vec<ComponentCheck>,
    pub checked_at: DateTime<Utc>,
}

/// Classify `value` against strictly-greater-than warning and critical tiers.
fn tier(value: u64, warning: u64, critical: u64) -> CheckStatus {
    if value > critical {
        CheckStatus::Critical
    } else if value > warning {
        CheckStatus::Warning
    } else {
        CheckStatus::Ok
    }
}

/// Runs health checks and reacts to their results.
pub struct HealthMonitor {
    config: HealthConfig,
    usage: Arc<dyn UsageRepository>,
    admission: Arc<AdmissionController>,
    csrf: Arc<CsrfGuard>,
    auto_heal: Arc<AutoHealController>,
    alerter: Arc<HealthAlerter>,
    clock: SharedClock,
    started: Instant,
    history: Mutex<VecDeque<HealthReport>>,
}

impl HealthMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &HealthConfig,
        usage: Arc<dyn UsageRepository>,
        admission: Arc<AdmissionController>,
        csrf: Arc<CsrfGuard>,
        auto_heal: Arc<AutoHealController>,
        alerter: Arc<HealthAlerter>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config: config.clone(),
            usage,
            admission,
            csrf,
            auto_heal,
            alerter,
            clock,
            started: Instant::now(),
            history: Mutex::new(VecDeque::new()),
        }
    }

    async fn check_database(&self) -> ComponentCheck {
        let start = Instant::now();
        let result = self.usage.health_check().await;
        let latency_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(()) => ComponentCheck::new(
                "database",
                tier(
                    latency_ms,
                    self.config.db_latency_warning_ms,
                    self.config.db_latency_critical_ms,
                ),
                json!({ "latency_ms": latency_ms }),
            ),
            Err(e) => ComponentCheck::new(
                "database",
                CheckStatus::Critical,
                json!({ "latency_ms": latency_ms, "error": e.to_string() }),
            ),
        }
    }

    fn check_apis(&self) -> ComponentCheck {
        let missing = self.auto_heal.missing_credentials();
        let status = if missing.is_empty() {
            CheckStatus::Ok
        } else {
            CheckStatus::Warning
        };
        ComponentCheck::new("apis", status, json!({ "missing": missing }))
    }

    async fn check_memory(&self) -> ComponentCheck {
        let counters = match self.admission.stats().await {
            Ok(stats) => stats.total_tracked,
            Err(e) => {
                warn!(error = %e, "admission stats unavailable for health check");
                0
            }
        };
        let tokens = self.csrf.len();
        let used = (counters + tokens) as u64;
        let capacity = self.config.max_tracked_entries.max(1) as u64;
        let percent = used * 100 / capacity;
        ComponentCheck::new(
            "memory",
            tier(
                percent,
                u64::from(self.config.memory_warning_percent),
                u64::from(self.config.memory_critical_percent),
            ),
            json!({
                "admission_entries": counters,
                "csrf_tokens": tokens,
                "capacity": capacity,
                "usage_percent": percent,
            }),
        )
    }

    /// Probe every component without reacting.
    pub async fn check(&self) -> HealthReport {
        let components = vec![
            self.check_database().await,
            self.check_apis(),
            self.check_memory().await,
            ComponentCheck::new(
                "uptime",
                CheckStatus::Ok,
                json!({ "seconds": self.started.elapsed().as_secs() }),
            ),
        ];
        let status = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(CheckStatus::Ok);
        HealthReport {
            status,
            mode: self.auto_heal.status(),
            components,
            checked_at: self.clock.now(),
        }
    }

    /// Probe, alert on non-ok components and remediate critical ones.
    pub async fn check_and_react(&self) -> HealthReport {
        let report = self.check().await;
        for component in &report.components {
            match component.status {
                CheckStatus::Ok => {}
                CheckStatus::Warning => {
                    self.alerter
                        .send(
                            HealthLevel::Warning,
                            &format!("{} check warning", component.name),
                            component.detail.clone(),
                        )
                        .await;
                }
                CheckStatus::Critical => {
                    self.alerter
                        .send(
                            HealthLevel::Critical,
                            &format!("{} check critical", component.name),
                            component.detail.clone(),
                        )
                        .await;
                    self.auto_heal
                        .attempt(&component.name, component.detail.clone())
                        .await;
                }
            }
        }
        debug!(status = ?report.status, "health check completed");

        let mut history = self.history.lock();
        history.push_back(report.clone());
        while history.len() > REPORT_HISTORY {
            history.pop_front();
        }
        report
    }

    /// Most recent reports from [`check_and_react`](Self::check_and_react),
    /// newest first.
    pub fn history(&self, limit: usize) -> Vec<HealthReport> {
        self.history.lock().iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone};
    use guardian_core::{
        AdmissionConfig, AlertConfig, AutoHealConfig, ClientIdentity, CsrfConfig, DailyUsageRow,
        GuardianError, ManualClock, Result, RouteClass, SecurityLogConfig, TenantId,
    };
    use guardian_storage::{
        InMemoryAdmissionStore, InMemorySecurityLogRepository, InMemoryUsageRepository,
    };

    use crate::auto_heal::Purgeable;
    use crate::metrics::Metrics;
    use crate::security_log::SecurityLogger;

    struct DownRepo;

    #[async_trait]
    impl UsageRepository for DownRepo {
        async fn upsert_daily(&self, _: &DailyUsageRow) -> Result<()> {
            Ok(())
        }
        async fn load_since(&self, _: &TenantId, _: NaiveDate) -> Result<Vec<DailyUsageRow>> {
            Ok(vec![])
        }
        async fn load_all_since(&self, _: NaiveDate) -> Result<Vec<DailyUsageRow>> {
            Ok(vec![])
        }
        async fn health_check(&self) -> Result<()> {
            Err(GuardianError::Storage("unable to open database file".into()))
        }
    }

    struct Fixture {
        monitor: HealthMonitor,
        admission: Arc<AdmissionController>,
        auto_heal: Arc<AutoHealController>,
        alerter: Arc<HealthAlerter>,
    }

    fn fixture(usage: Arc<dyn UsageRepository>, health: HealthConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).unwrap(),
        ));
        let metrics = Metrics::new().unwrap();
        let log = Arc::new(SecurityLogger::new(
            &SecurityLogConfig::default(),
            Arc::new(InMemorySecurityLogRepository::new()),
            clock.clone(),
            metrics.clone(),
        ));
        let admission = Arc::new(AdmissionController::new(
            &AdmissionConfig::default(),
            Arc::new(InMemoryAdmissionStore::new()),
            clock.clone(),
            metrics.clone(),
            log,
        ));
        let csrf = Arc::new(CsrfGuard::new(&CsrfConfig::default(), clock.clone()));
        let alerter =
            Arc::new(HealthAlerter::new(&AlertConfig::default(), clock.clone(), metrics.clone()).unwrap());
        let auto_heal = Arc::new(
            AutoHealController::new(
                &AutoHealConfig::default(),
                clock.clone(),
                metrics,
                vec![
                    admission.clone() as Arc<dyn Purgeable>,
                    csrf.clone() as Arc<dyn Purgeable>,
                ],
            )
            .with_credential_lookup(|_| Some("set".to_string())),
        );
        let monitor = HealthMonitor::new(
            &health,
            usage,
            admission.clone(),
            csrf,
            auto_heal.clone(),
            alerter.clone(),
            clock,
        );
        Fixture {
            monitor,
            admission,
            auto_heal,
            alerter,
        }
    }

    #[test]
    fn test_tier_is_strictly_greater() {
        assert_eq!(tier(75, 75, 90), CheckStatus::Ok);
        assert_eq!(tier(76, 75, 90), CheckStatus::Warning);
        assert_eq!(tier(91, 75, 90), CheckStatus::Critical);
    }

    #[tokio::test]
    async fn test_healthy_report() {
        let f = fixture(Arc::new(InMemoryUsageRepository::new()), HealthConfig::default());
        let report = f.monitor.check_and_react().await;
        assert_eq!(report.status, CheckStatus::Ok);
        assert_eq!(report.components.len(), 4);
        assert!(f.alerter.history(10).is_empty());
        assert_eq!(f.monitor.history(10).len(), 1);
    }

    #[tokio::test]
    async fn test_database_failure_alerts_and_remediates() {
        let f = fixture(Arc::new(DownRepo), HealthConfig::default());
        let report = f.monitor.check_and_react().await;
        assert_eq!(report.status, CheckStatus::Critical);

        let alerts = f.alerter.history(10);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, HealthLevel::Critical);
        assert_eq!(alerts[0].title, "database check critical");

        let actions = f.auto_heal.actions(10);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action.as_deref(), Some("db_reconnect_requested"));
    }

    #[tokio::test]
    async fn test_memory_pressure_purges_tables() {
        let f = fixture(
            Arc::new(InMemoryUsageRepository::new()),
            HealthConfig {
                max_tracked_entries: 10,
                ..HealthConfig::default()
            },
        );
        for i in 0..10 {
            f.admission
                .check(&ClientIdentity::new(format!("10.0.0.{i}")), RouteClass::Api)
                .await;
        }
        let report = f.monitor.check_and_react().await;
        let memory = report
            .components
            .iter()
            .find(|c| c.name == "memory")
            .unwrap();
        assert_eq!(memory.status, CheckStatus::Critical);
        assert_eq!(memory.detail["usage_percent"], 100);

        let actions = f.auto_heal.actions(10);
        assert_eq!(actions[0].metric, "memory");
        assert!(actions[0].success);
    }
}

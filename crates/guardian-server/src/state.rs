//! Shared application state.
//!
//! Every Guardian component is built once at startup and shared behind an
//! `Arc<AppState>` by the HTTP layer and the background tasks.

use guardian_core::{
    AlertRecord, CostStatus, GuardianConfig, GuardianError, HealthLevel, QuotaStatus, Result,
    SharedClock, Storage, SystemClock, TenantId,
};
use guardian_security::ThreatDetector;
use guardian_storage::{build_storage, ScopedStore};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::accounts::AccountService;
use crate::admission::AdmissionController;
use crate::alerts::AlertDispatcher;
use crate::auto_heal::{AutoHealController, Purgeable};
use crate::csrf::CsrfGuard;
use crate::health::HealthMonitor;
use crate::health_alerts::HealthAlerter;
use crate::metrics::Metrics;
use crate::pricing::Pricing;
use crate::quota::{CostReport, QuotaGovernor, UsageSnapshot};
use crate::security_log::SecurityLogger;
use crate::sessions::AdminSessions;
use crate::FlushReport;

/// Shared state available to all handlers and background tasks.
pub struct AppState {
    /// Guardian configuration.
    pub config: GuardianConfig,
    /// Prometheus collectors.
    pub metrics: Metrics,
    pub clock: SharedClock,
    /// Repository bundle.
    pub storage: Storage,
    /// Payload threat scanner.
    pub threat: ThreatDetector,
    pub admission: Arc<AdmissionController>,
    pub csrf: Arc<CsrfGuard>,
    /// Per-tenant and global cost accounting.
    pub quota: QuotaGovernor,
    /// Unit prices for billable services.
    pub pricing: Pricing,
    /// Quota threshold alerts.
    pub alerts: Arc<AlertDispatcher>,
    /// Operational health alerts.
    pub health_alerts: Arc<HealthAlerter>,
    pub auto_heal: Arc<AutoHealController>,
    pub security_log: Arc<SecurityLogger>,
    pub accounts: AccountService,
    /// Bearer sessions for the operator routes.
    pub sessions: Arc<AdminSessions>,
    /// Tenant-scoped access to business records.
    pub scoped: ScopedStore,
    pub health: HealthMonitor,
}

/// Result of [`AppState::record_usage`].
#[derive(Debug, Clone, Serialize)]
pub struct UsageReceipt {
    pub usage: UsageSnapshot,
    pub quota: QuotaStatus,
    /// Quota alerts raised by this call.
    pub alerts: Vec<AlertRecord>,
    pub daily_status: CostStatus,
    pub monthly_status: CostStatus,
    pub degraded: bool,
}

impl AppState {
    /// Wire every component over `storage`.
    ///
    /// # Errors
    ///
    /// Fails when a component rejects its configuration (bad threat
    /// patterns, unknown default plan, unusable HTTP client, ...).
    pub fn new(config: GuardianConfig, storage: Storage, clock: SharedClock) -> Result<Self> {
        let metrics = Metrics::new()
            .map_err(|e| GuardianError::Config(format!("metrics registry: {e}")))?;

        let security_log = Arc::new(SecurityLogger::new(
            &config.security_log,
            Arc::clone(&storage.security_logs),
            Arc::clone(&clock),
            metrics.clone(),
        ));
        let admission = Arc::new(AdmissionController::new(
            &config.admission,
            Arc::clone(&storage.admission),
            Arc::clone(&clock),
            metrics.clone(),
            Arc::clone(&security_log),
        ));
        let csrf = Arc::new(CsrfGuard::new(&config.csrf, Arc::clone(&clock)));
        let sessions = Arc::new(AdminSessions::new(&config.accounts, Arc::clone(&clock)));
        let quota = QuotaGovernor::new(
            &config.quota,
            &config.cost_tiers,
            Arc::clone(&storage.usage),
            Arc::clone(&clock),
        )?;
        let alerts = Arc::new(AlertDispatcher::new(
            &config.alerts,
            Arc::clone(&storage.alerts),
            Arc::clone(&clock),
            metrics.clone(),
        )?);
        let health_alerts = Arc::new(HealthAlerter::new(
            &config.alerts,
            Arc::clone(&clock),
            metrics.clone(),
        )?);
        let purgeables = vec![
            admission.clone() as Arc<dyn Purgeable>,
            csrf.clone() as Arc<dyn Purgeable>,
            sessions.clone() as Arc<dyn Purgeable>,
            alerts.clone() as Arc<dyn Purgeable>,
            health_alerts.clone() as Arc<dyn Purgeable>,
        ];
        let auto_heal = Arc::new(AutoHealController::new(
            &config.auto_heal,
            Arc::clone(&clock),
            metrics.clone(),
            purgeables,
        ));
        let accounts = AccountService::new(
            &config.accounts,
            Arc::clone(&storage.credentials),
            Arc::clone(&clock),
            Arc::clone(&security_log),
        )?;
        let health = HealthMonitor::new(
            &config.health,
            Arc::clone(&storage.usage),
            Arc::clone(&admission),
            Arc::clone(&csrf),
            Arc::clone(&auto_heal),
            Arc::clone(&health_alerts),
            Arc::clone(&clock),
        );

        Ok(Self {
            threat: ThreatDetector::new(&config.threat)?,
            pricing: Pricing::new(&config.quota.pricing),
            scoped: ScopedStore::new(
                Arc::clone(&storage.records),
                &config.isolation.shared_entities,
            ),
            config,
            metrics,
            clock,
            storage,
            admission,
            csrf,
            quota,
            alerts,
            health_alerts,
            auto_heal,
            security_log,
            accounts,
            sessions,
            health,
        })
    }

    /// Build storage from configuration, wire the components on the system
    /// clock and rehydrate month-to-date usage.
    pub async fn from_config(config: GuardianConfig) -> Result<Arc<Self>> {
        let storage = build_storage(&config.storage).await?;
        let state = Self::new(config, storage, Arc::new(SystemClock))?;
        let rows = state.quota.rehydrate().await?;
        info!(rows, "month-to-date usage rehydrated");
        Ok(Arc::new(state))
    }

    /// Accrue one billable call and run the quota and cost-tier reactions.
    ///
    /// Crossing a tenant threshold raises quota alerts. The global daily
    /// tiers raise health alerts, and the shutdown tier switches the service
    /// into degraded mode. Monthly tiers only alert.
    pub async fn record_usage(
        &self,
        tenant_id: &TenantId,
        service: &str,
        cost: f64,
        tokens_in: u64,
        tokens_out: u64,
    ) -> UsageReceipt {
        let usage = self
            .quota
            .record_usage(tenant_id, service, cost, tokens_in, tokens_out);
        self.metrics.record_cost(tenant_id.as_str(), service, cost);

        let quota = self.quota.check_quota(tenant_id);
        let alerts = self.alerts.check_and_alert(&quota);

        let daily = self.quota.daily_costs();
        self.react_to_cost_tier("daily", &daily, true).await;
        let monthly = self.quota.monthly_costs();
        self.react_to_cost_tier("monthly", &monthly, false).await;

        UsageReceipt {
            usage,
            quota,
            alerts,
            daily_status: daily.status,
            monthly_status: monthly.status,
            degraded: self.auto_heal.is_degraded(),
        }
    }

    async fn react_to_cost_tier(&self, period: &str, report: &CostReport, may_degrade: bool) {
        let data = json!({
            "period": report.period,
            "total": report.total,
            "status": report.status,
            "thresholds": report.thresholds,
        });
        match report.status {
            CostStatus::Ok => {}
            CostStatus::Warning => {
                self.health_alerts
                    .send(HealthLevel::Warning, &format!("{period} cost warning"), data)
                    .await;
            }
            CostStatus::Critical => {
                self.health_alerts
                    .send(HealthLevel::Critical, &format!("{period} cost critical"), data)
                    .await;
            }
            CostStatus::Shutdown => {
                self.health_alerts
                    .send(
                        HealthLevel::Critical,
                        &format!("{period} cost shutdown threshold reached"),
                        data,
                    )
                    .await;
                if may_degrade && !self.auto_heal.is_degraded() {
                    warn!(
                        total = report.total,
                        threshold = report.thresholds.shutdown,
                        "{period} cost crossed the shutdown tier"
                    );
                    self.auto_heal
                        .attempt(
                            "costs",
                            json!({
                                "reason": format!(
                                    "{period} cost {:.2} reached shutdown tier {:.2}",
                                    report.total, report.thresholds.shutdown
                                ),
                            }),
                        )
                        .await;
                }
            }
        }
    }

    /// The tenant's quota status, or [`GuardianError::QuotaExceeded`] once
    /// month-to-date cost has reached the plan limit.
    pub fn ensure_within_quota(&self, tenant_id: &TenantId) -> Result<QuotaStatus> {
        let status = self.quota.check_quota(tenant_id);
        if status.within_limits {
            Ok(status)
        } else {
            Err(GuardianError::QuotaExceeded {
                tenant_id: tenant_id.clone(),
                percentage: status.percentage,
            })
        }
    }

    /// Flush every write-behind buffer once. Used on shutdown.
    pub async fn flush_all(&self) -> FlushReport {
        let mut total = FlushReport::default();
        for report in [
            self.quota.flush().await,
            self.alerts.flush().await,
            self.security_log.flush().await,
        ] {
            total.written += report.written;
            total.failed += report.failed;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use guardian_core::{AlertLevel, ManualClock, StorageConfig};
    use guardian_storage::StorageProfile;

    async fn state() -> AppState {
        let storage = StorageProfile::from_config(&StorageConfig::default())
            .unwrap()
            .build()
            .await
            .unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).unwrap(),
        ));
        AppState::new(GuardianConfig::default(), storage, clock).unwrap()
    }

    #[tokio::test]
    async fn test_record_usage_within_budget() {
        let state = state().await;
        let tenant = TenantId::new("acme");
        let receipt = state.record_usage(&tenant, "text_generation", 1.5, 100, 50).await;

        assert_eq!(receipt.quota.percentage, 10);
        assert!(receipt.quota.within_limits);
        assert!(receipt.alerts.is_empty());
        assert_eq!(receipt.daily_status, CostStatus::Ok);
        assert!(!receipt.degraded);
        assert!(state.ensure_within_quota(&tenant).is_ok());
    }

    #[tokio::test]
    async fn test_quota_thresholds_raise_alerts_and_block() {
        let state = state().await;
        let tenant = TenantId::new("acme");
        let receipt = state.record_usage(&tenant, "sms", 12.5, 0, 0).await;
        assert_eq!(receipt.alerts.len(), 1);
        assert_eq!(receipt.alerts[0].level, AlertLevel::Warning);

        let receipt = state.record_usage(&tenant, "sms", 3.0, 0, 0).await;
        assert_eq!(receipt.alerts.len(), 1);
        assert_eq!(receipt.alerts[0].level, AlertLevel::Critical);

        match state.ensure_within_quota(&tenant) {
            Err(GuardianError::QuotaExceeded { percentage, .. }) => assert_eq!(percentage, 103),
            other => panic!("expected quota exceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_daily_shutdown_tier_enters_degraded_mode() {
        let state = state().await;
        let receipt = state
            .record_usage(&TenantId::new("big"), "voice", 120.0, 0, 0)
            .await;
        assert_eq!(receipt.daily_status, CostStatus::Shutdown);
        assert_eq!(receipt.monthly_status, CostStatus::Ok);
        assert!(receipt.degraded);
        assert!(state.auto_heal.is_degraded());

        let alerts = state.health_alerts.history(10);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, HealthLevel::Critical);
        assert_eq!(alerts[0].title, "daily cost shutdown threshold reached");

        let actions = state.auto_heal.actions(10);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].metric, "costs");

        // Already degraded: no second remediation.
        state.record_usage(&TenantId::new("big"), "voice", 1.0, 0, 0).await;
        assert_eq!(state.auto_heal.actions(10).len(), 1);
    }

    #[tokio::test]
    async fn test_daily_warning_tier_alerts_without_degrading() {
        let state = state().await;
        let receipt = state
            .record_usage(&TenantId::new("mid"), "maps", 35.0, 0, 0)
            .await;
        assert_eq!(receipt.daily_status, CostStatus::Warning);
        assert!(!receipt.degraded);
        let alerts = state.health_alerts.history(10);
        assert_eq!(alerts[0].level, HealthLevel::Warning);
        assert_eq!(alerts[0].title, "daily cost warning");
    }

    #[tokio::test]
    async fn test_flush_all_persists_usage_and_alerts() {
        let state = state().await;
        let tenant = TenantId::new("acme");
        state.record_usage(&tenant, "sms", 14.0, 0, 0).await;
        let report = state.flush_all().await;
        assert_eq!(report.failed, 0);
        // One day row and one warning alert.
        assert_eq!(report.written, 2);
        assert_eq!(state.quota.pending_rows(), 0);
    }
}

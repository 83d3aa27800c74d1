//! Per-tenant cost accrual and plan quota evaluation.
//!
//! Usage is accumulated in memory, per tenant per day and per tenant per
//! month, plus global daily and monthly aggregates that drive the cost tiers.
//! Every increment goes through a `DashMap` entry so concurrent calls for the
//! same tenant never lose an update. Day rows reach storage write-behind:
//! `record_usage` only marks `(tenant, date)` dirty and [`QuotaGovernor::flush`]
//! upserts the latest absolute aggregate for each dirty key.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use dashmap::DashMap;
use guardian_core::{
    CostStatus, CostTierConfig, CostTiers, DailyUsageRow, GuardianError, QuotaConfig, QuotaPlan,
    QuotaStatus, Result, SharedClock, TenantId, UsageRepository, UsageTotals,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::FlushReport;

/// `(year, month)` of a timestamp.
type MonthKey = (i32, u32);

fn month_of(date: NaiveDate) -> MonthKey {
    (date.year(), date.month())
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Month-to-date aggregate for one tenant, reset lazily on rollover.
#[derive(Debug, Clone, Default)]
struct MonthBucket {
    month: MonthKey,
    totals: UsageTotals,
}

/// Cost and call count for one service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceCost {
    pub total: f64,
    pub calls: u64,
}

#[derive(Debug, Default)]
struct GlobalCosts {
    day: Option<NaiveDate>,
    month: Option<MonthKey>,
    daily: UsageTotals,
    monthly: UsageTotals,
    daily_services: BTreeMap<String, ServiceCost>,
    monthly_services: BTreeMap<String, ServiceCost>,
}

impl GlobalCosts {
    fn roll(&mut self, today: NaiveDate) {
        if self.day != Some(today) {
            self.day = Some(today);
            self.daily = UsageTotals::default();
            self.daily_services.clear();
        }
        let month = month_of(today);
        if self.month != Some(month) {
            self.month = Some(month);
            self.monthly = UsageTotals::default();
            self.monthly_services.clear();
        }
    }
}

/// State of a tenant right after one usage event was accrued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub tenant_id: TenantId,
    pub service: String,
    /// Cost of this event.
    pub cost: f64,
    pub day: UsageTotals,
    pub month: UsageTotals,
    /// All tenants, today.
    pub global_daily_cost: f64,
    /// All tenants, month to date.
    pub global_monthly_cost: f64,
}

/// Aggregate cost for one period with its tier status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostReport {
    /// `YYYY-MM-DD` for daily reports, `YYYY-MM` for monthly ones.
    pub period: String,
    pub total: f64,
    pub calls: u64,
    pub breakdown: BTreeMap<String, ServiceCost>,
    pub status: CostStatus,
    pub thresholds: CostTiers,
}

/// Tracks usage per tenant and evaluates it against plan budgets.
pub struct QuotaGovernor {
    config: QuotaConfig,
    default_plan: QuotaPlan,
    tiers: CostTierConfig,
    clock: SharedClock,
    repo: Arc<dyn UsageRepository>,
    days: DashMap<(TenantId, NaiveDate), UsageTotals>,
    months: DashMap<TenantId, MonthBucket>,
    global: Mutex<GlobalCosts>,
    dirty: Mutex<HashSet<(TenantId, NaiveDate)>>,
}

impl QuotaGovernor {
    /// # Errors
    ///
    /// Fails if `config.default_plan` names no configured plan.
    pub fn new(
        config: &QuotaConfig,
        tiers: &CostTierConfig,
        repo: Arc<dyn UsageRepository>,
        clock: SharedClock,
    ) -> Result<Self> {
        let default_plan = config.plan(&config.default_plan).cloned().ok_or_else(|| {
            GuardianError::Config(format!(
                "quota.default_plan '{}' is not a defined plan",
                config.default_plan
            ))
        })?;
        Ok(Self {
            config: config.clone(),
            default_plan,
            tiers: tiers.clone(),
            clock,
            repo,
            days: DashMap::new(),
            months: DashMap::new(),
            global: Mutex::new(GlobalCosts::default()),
            dirty: Mutex::new(HashSet::new()),
        })
    }

    fn today(&self) -> (DateTime<Utc>, NaiveDate) {
        let now = self.clock.now();
        (now, now.date_naive())
    }

    /// Plan for a tenant; unknown tenants and unknown plan keys fall back to
    /// the default plan.
    pub fn plan_for(&self, tenant_id: &TenantId) -> &QuotaPlan {
        self.config
            .tenant(tenant_id)
            .and_then(|t| self.config.plan(&t.plan))
            .unwrap_or(&self.default_plan)
    }

    /// Accrue one billable call into the tenant's day and month buckets and
    /// the global aggregates.
    pub fn record_usage(
        &self,
        tenant_id: &TenantId,
        service: &str,
        cost: f64,
        tokens_in: u64,
        tokens_out: u64,
    ) -> UsageSnapshot {
        let (_, today) = self.today();
        let month = month_of(today);

        // Marked dirty under the bucket guard; flush checks the dirty set
        // under the same shard lock before dropping a bucket.
        let day = {
            let key = (tenant_id.clone(), today);
            let mut entry = self.days.entry(key.clone()).or_default();
            entry.accrue(cost, tokens_in, tokens_out);
            self.dirty.lock().insert(key);
            entry.clone()
        };
        let month_totals = {
            let mut bucket = self.months.entry(tenant_id.clone()).or_default();
            if bucket.month != month {
                bucket.month = month;
                bucket.totals = UsageTotals::default();
            }
            bucket.totals.accrue(cost, tokens_in, tokens_out);
            bucket.totals.clone()
        };

        let (global_daily_cost, global_monthly_cost) = {
            let mut guard = self.global.lock();
            let global = &mut *guard;
            global.roll(today);
            global.daily.accrue(cost, tokens_in, tokens_out);
            global.monthly.accrue(cost, tokens_in, tokens_out);
            let accrued = if cost.is_finite() && cost > 0.0 { cost } else { 0.0 };
            for services in [&mut global.daily_services, &mut global.monthly_services] {
                let entry = services.entry(service.to_string()).or_default();
                entry.total += accrued;
                entry.calls += 1;
            }
            (global.daily.cost, global.monthly.cost)
        };

        debug!(tenant_id = %tenant_id, service, cost, "usage recorded");

        UsageSnapshot {
            tenant_id: tenant_id.clone(),
            service: service.to_string(),
            cost,
            day,
            month: month_totals,
            global_daily_cost,
            global_monthly_cost,
        }
    }

    /// Month-to-date totals for a tenant; zero after a month rollover.
    pub fn month_usage(&self, tenant_id: &TenantId) -> UsageTotals {
        let (_, today) = self.today();
        self.months
            .get(tenant_id)
            .filter(|b| b.month == month_of(today))
            .map(|b| b.totals.clone())
            .unwrap_or_default()
    }

    /// Today's totals for a tenant.
    pub fn day_usage(&self, tenant_id: &TenantId) -> UsageTotals {
        let (_, today) = self.today();
        self.days
            .get(&(tenant_id.clone(), today))
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    /// Compare month-to-date cost against the tenant's plan limit.
    ///
    /// The percentage is rounded half away from zero; the tenant is within
    /// limits while cost is strictly below the limit.
    pub fn check_quota(&self, tenant_id: &TenantId) -> QuotaStatus {
        let plan = self.plan_for(tenant_id);
        let usage = self.month_usage(tenant_id);
        let limit = plan.cost_per_month_limit;
        let percentage = (usage.cost / limit * 100.0).round().max(0.0) as u32;
        QuotaStatus {
            tenant_id: tenant_id.clone(),
            plan_id: plan.id.clone(),
            plan_name: plan.name.clone(),
            within_limits: usage.cost < limit,
            percentage,
            cost: round_to(usage.cost, 4),
            calls: usage.calls,
            limit,
        }
    }

    /// Global cost for today against the daily tiers.
    pub fn daily_costs(&self) -> CostReport {
        let (_, today) = self.today();
        let mut global = self.global.lock();
        global.roll(today);
        Self::report(
            today.format("%Y-%m-%d").to_string(),
            &global.daily,
            &global.daily_services,
            self.tiers.daily,
        )
    }

    /// Global month-to-date cost against the monthly tiers.
    pub fn monthly_costs(&self) -> CostReport {
        let (_, today) = self.today();
        let mut global = self.global.lock();
        global.roll(today);
        Self::report(
            today.format("%Y-%m").to_string(),
            &global.monthly,
            &global.monthly_services,
            self.tiers.monthly,
        )
    }

    fn report(
        period: String,
        totals: &UsageTotals,
        services: &BTreeMap<String, ServiceCost>,
        tiers: CostTiers,
    ) -> CostReport {
        CostReport {
            period,
            total: round_to(totals.cost, 2),
            calls: totals.calls,
            breakdown: services
                .iter()
                .map(|(name, cost)| {
                    (
                        name.clone(),
                        ServiceCost {
                            total: round_to(cost.total, 2),
                            calls: cost.calls,
                        },
                    )
                })
                .collect(),
            status: tiers.classify(totals.cost),
            thresholds: tiers,
        }
    }

    pub fn daily_status(&self) -> CostStatus {
        self.daily_costs().status
    }

    pub fn pending_rows(&self) -> usize {
        self.dirty.lock().len()
    }

    /// Upsert the latest aggregate of every dirty `(tenant, date)` row.
    ///
    /// A failed upsert re-marks its key dirty for the next flush. Day buckets
    /// older than yesterday that are fully persisted are dropped from memory.
    pub async fn flush(&self) -> FlushReport {
        let keys: Vec<(TenantId, NaiveDate)> = self.dirty.lock().drain().collect();
        let (now, today) = self.today();
        let mut report = FlushReport::default();

        for key in keys {
            let Some(totals) = self.days.get(&key).map(|t| t.clone()) else {
                continue;
            };
            let row = DailyUsageRow {
                tenant_id: key.0.clone(),
                date: key.1,
                totals,
                updated_at: now,
            };
            match self.repo.upsert_daily(&row).await {
                Ok(()) => report.written += 1,
                Err(e) => {
                    warn!(tenant_id = %key.0, date = %key.1, error = %e, "usage upsert failed, will retry");
                    report.failed += 1;
                    self.dirty.lock().insert(key);
                }
            }
        }

        let keep_from = today.pred_opt().unwrap_or(today);
        self.days
            .retain(|key, _| key.1 >= keep_from || self.dirty.lock().contains(key));

        if report.written > 0 || report.failed > 0 {
            debug!(written = report.written, failed = report.failed, "usage flush complete");
        }
        report
    }

    /// Rebuild today's and month-to-date totals from persisted day rows.
    ///
    /// Run once at startup, before traffic is admitted.
    pub async fn rehydrate(&self) -> Result<usize> {
        let (_, today) = self.today();
        let month = month_of(today);
        let rows = self.repo.load_all_since(first_of_month(today)).await?;

        let mut global = self.global.lock();
        global.roll(today);
        for row in &rows {
            if month_of(row.date) != month {
                continue;
            }
            if row.date == today {
                self.days
                    .insert((row.tenant_id.clone(), row.date), row.totals.clone());
                global.daily.merge(&row.totals);
            }
            let mut bucket = self.months.entry(row.tenant_id.clone()).or_default();
            if bucket.month != month {
                bucket.month = month;
                bucket.totals = UsageTotals::default();
            }
            bucket.totals.merge(&row.totals);
            global.monthly.merge(&row.totals);
        }
        drop(global);

        info!(rows = rows.len(), tenants = self.months.len(), "usage rehydrated from storage");
        Ok(rows.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use guardian_core::{ManualClock, Tenant};
    use guardian_storage::InMemoryUsageRepository;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap()
    }

    fn quota_config() -> QuotaConfig {
        QuotaConfig {
            tenants: vec![
                Tenant {
                    id: TenantId::new("salon-pro"),
                    name: "Salon Pro".into(),
                    plan: "pro".into(),
                    features: vec![],
                },
                Tenant {
                    id: TenantId::new("salon-odd"),
                    name: String::new(),
                    plan: "platinum".into(),
                    features: vec![],
                },
            ],
            ..QuotaConfig::default()
        }
    }

    fn governor_with(repo: Arc<dyn UsageRepository>) -> (QuotaGovernor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let gov = QuotaGovernor::new(
            &quota_config(),
            &CostTierConfig::default(),
            repo,
            clock.clone(),
        )
        .unwrap();
        (gov, clock)
    }

    fn governor() -> (QuotaGovernor, Arc<ManualClock>) {
        governor_with(Arc::new(InMemoryUsageRepository::new()))
    }

    #[test]
    fn test_plan_fallback() {
        let (gov, _) = governor();
        assert_eq!(gov.plan_for(&TenantId::new("salon-pro")).id, "pro");
        assert_eq!(gov.plan_for(&TenantId::new("salon-odd")).id, "starter");
        assert_eq!(gov.plan_for(&TenantId::new("stranger")).id, "starter");
    }

    #[test]
    fn test_record_then_check_percentage() {
        let (gov, _) = governor();
        let tenant = TenantId::new("stranger");
        gov.record_usage(&tenant, "text_generation", 1.23, 100, 50);

        let status = gov.check_quota(&tenant);
        // 1.23 / 15 * 100 = 8.2
        assert_eq!(status.percentage, 8);
        assert!(status.within_limits);
        assert_eq!(status.calls, 1);
        assert!((status.cost - 1.23).abs() < 1e-9);
        assert_eq!(status.plan_name, "Starter");
    }

    #[test]
    fn test_percentage_rounds_half_away_from_zero() {
        let (gov, _) = governor();
        let tenant = TenantId::new("salon-pro");
        // 0.2 / 40 = 0.5 %
        gov.record_usage(&tenant, "maps", 0.2, 0, 0);
        assert_eq!(gov.check_quota(&tenant).percentage, 1);
    }

    #[test]
    fn test_at_limit_is_not_within_limits() {
        let (gov, _) = governor();
        let tenant = TenantId::new("stranger");
        gov.record_usage(&tenant, "sms_outbound", 15.0, 0, 0);
        let status = gov.check_quota(&tenant);
        assert!(!status.within_limits);
        assert_eq!(status.percentage, 100);
    }

    #[test]
    fn test_month_rollover_resets_lazily() {
        let (gov, clock) = governor();
        let tenant = TenantId::new("stranger");
        gov.record_usage(&tenant, "maps", 5.0, 0, 0);
        clock.set(Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 1).unwrap());
        assert_eq!(gov.month_usage(&tenant).cost, 0.0);
        assert_eq!(gov.day_usage(&tenant).calls, 0);

        gov.record_usage(&tenant, "maps", 1.0, 0, 0);
        assert_eq!(gov.month_usage(&tenant).calls, 1);
        assert_eq!(gov.monthly_costs().calls, 1);
    }

    #[test]
    fn test_daily_costs_breakdown_and_tiers() {
        let (gov, clock) = governor();
        gov.record_usage(&TenantId::new("a"), "text_generation", 20.0, 0, 0);
        gov.record_usage(&TenantId::new("b"), "sms_outbound", 12.5, 0, 0);

        let daily = gov.daily_costs();
        assert_eq!(daily.period, "2026-03-10");
        assert_eq!(daily.total, 32.5);
        assert_eq!(daily.status, CostStatus::Warning);
        assert_eq!(daily.breakdown["sms_outbound"].calls, 1);

        clock.advance(Duration::days(1));
        let next = gov.daily_costs();
        assert_eq!(next.total, 0.0);
        assert_eq!(next.status, CostStatus::Ok);
        assert_eq!(gov.monthly_costs().total, 32.5);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let (gov, _) = governor();
        let gov = Arc::new(gov);
        let tenant = TenantId::new("busy");
        let mut handles = Vec::new();
        for _ in 0..8 {
            let gov = Arc::clone(&gov);
            let tenant = tenant.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..250 {
                    gov.record_usage(&tenant, "maps", 0.001, 1, 1);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let month = gov.month_usage(&tenant);
        assert_eq!(month.calls, 2000);
        assert_eq!(month.tokens_in, 2000);
        assert_eq!(gov.day_usage(&tenant).calls, 2000);
    }

    #[tokio::test]
    async fn test_flush_persists_and_rehydrates() {
        let repo: Arc<dyn UsageRepository> = Arc::new(InMemoryUsageRepository::new());
        let (gov, _) = governor_with(Arc::clone(&repo));
        let tenant = TenantId::new("salon-pro");
        gov.record_usage(&tenant, "text_generation", 2.5, 10, 20);
        gov.record_usage(&tenant, "maps", 0.5, 0, 0);
        assert_eq!(gov.pending_rows(), 1);

        let report = gov.flush().await;
        assert_eq!(report, FlushReport { written: 1, failed: 0 });
        assert_eq!(gov.pending_rows(), 0);

        let (restarted, _) = governor_with(repo);
        assert_eq!(restarted.rehydrate().await.unwrap(), 1);
        let month = restarted.month_usage(&tenant);
        assert_eq!(month.calls, 2);
        assert!((month.cost - 3.0).abs() < 1e-9);
        assert_eq!(restarted.check_quota(&tenant).percentage, 8);
        assert_eq!(restarted.daily_costs().total, 3.0);
    }

    #[tokio::test]
    async fn test_rehydrate_sums_month_to_date_only() {
        let repo = Arc::new(InMemoryUsageRepository::new());
        let tenant = TenantId::new("t");
        for (date, cost) in [
            (NaiveDate::from_ymd_opt(2026, 2, 28).unwrap(), 9.0),
            (NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(), 1.0),
            (NaiveDate::from_ymd_opt(2026, 3, 9).unwrap(), 2.0),
        ] {
            repo.upsert_daily(&DailyUsageRow {
                tenant_id: tenant.clone(),
                date,
                totals: UsageTotals {
                    calls: 1,
                    tokens_in: 0,
                    tokens_out: 0,
                    cost,
                },
                updated_at: t0(),
            })
            .await
            .unwrap();
        }
        let (gov, _) = governor_with(repo);
        gov.rehydrate().await.unwrap();
        assert!((gov.month_usage(&tenant).cost - 3.0).abs() < 1e-9);
        assert_eq!(gov.day_usage(&tenant).calls, 0);
    }

    struct FlakyRepo {
        inner: InMemoryUsageRepository,
        fail: AtomicBool,
    }

    #[async_trait]
    impl UsageRepository for FlakyRepo {
        async fn upsert_daily(&self, row: &DailyUsageRow) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(GuardianError::Storage("disk full".into()));
            }
            self.inner.upsert_daily(row).await
        }
        async fn load_since(
            &self,
            tenant_id: &TenantId,
            since: NaiveDate,
        ) -> Result<Vec<DailyUsageRow>> {
            self.inner.load_since(tenant_id, since).await
        }
        async fn load_all_since(&self, since: NaiveDate) -> Result<Vec<DailyUsageRow>> {
            self.inner.load_all_since(since).await
        }
        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_flush_remarks_dirty() {
        let repo = Arc::new(FlakyRepo {
            inner: InMemoryUsageRepository::new(),
            fail: AtomicBool::new(true),
        });
        let (gov, _) = governor_with(repo.clone());
        let tenant = TenantId::new("t");
        gov.record_usage(&tenant, "maps", 1.0, 0, 0);

        let report = gov.flush().await;
        assert_eq!(report.failed, 1);
        assert_eq!(gov.pending_rows(), 1);

        repo.fail.store(false, Ordering::SeqCst);
        gov.record_usage(&tenant, "maps", 1.0, 0, 0);
        assert_eq!(gov.flush().await.written, 1);
        let rows = repo
            .inner
            .load_since(&tenant, NaiveDate::from_ymd_opt(2026, 3, 1).unwrap())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].totals.calls, 2);
    }

    #[tokio::test]
    async fn test_usage_across_midnight_is_persisted_before_drop() {
        let repo = Arc::new(InMemoryUsageRepository::new());
        let (gov, clock) = governor_with(repo.clone());
        let tenant = TenantId::new("t");
        let day_one = t0().date_naive();

        clock.advance(Duration::hours(14) + Duration::minutes(59));
        gov.record_usage(&tenant, "maps", 1.0, 0, 0);
        clock.advance(Duration::minutes(2));
        gov.record_usage(&tenant, "maps", 1.0, 0, 0);

        assert_eq!(gov.flush().await.written, 2);
        // Yesterday's bucket stays resident for late writers.
        assert!(gov.days.contains_key(&(tenant.clone(), day_one)));

        clock.advance(Duration::days(1));
        gov.flush().await;
        assert!(!gov.days.contains_key(&(tenant.clone(), day_one)));

        let rows = repo.load_since(&tenant, day_one).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.totals.calls == 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_flush_racing_midnight_loses_no_calls() {
        let repo = Arc::new(InMemoryUsageRepository::new());
        let (gov, clock) = governor_with(repo.clone());
        let gov = Arc::new(gov);
        let tenant = TenantId::new("busy");
        clock.advance(Duration::hours(14) + Duration::minutes(59));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let gov = Arc::clone(&gov);
            let tenant = tenant.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..500 {
                    gov.record_usage(&tenant, "maps", 0.001, 1, 0);
                    tokio::task::yield_now().await;
                }
            }));
        }
        let flusher = {
            let gov = Arc::clone(&gov);
            tokio::spawn(async move {
                for i in 0..50 {
                    if i == 10 {
                        clock.advance(Duration::minutes(2));
                    }
                    gov.flush().await;
                    tokio::task::yield_now().await;
                }
            })
        };
        for h in handles {
            h.await.unwrap();
        }
        flusher.await.unwrap();
        gov.flush().await;

        let rows = repo.load_since(&tenant, t0().date_naive()).await.unwrap();
        let persisted: u64 = rows.iter().map(|row| row.totals.calls).sum();
        assert_eq!(persisted, 2000);
    }
}

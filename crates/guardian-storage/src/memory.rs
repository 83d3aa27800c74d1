//! In-memory repositories.
//!
//! Used by the `memory` storage profile and throughout the test suites.
//! Everything is lost on drop.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use guardian_core::{
    AdminCredential, AlertRecord, AlertRepository, CredentialRepository, DailyUsageRow,
    GuardianError, Record, RecordFilter, RecordStore, Result, SecurityLogEntry, SecurityLogQuery,
    SecurityLogRepository, TenantId, UsageRepository, TENANT_COLUMN,
};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

// ===========================================================================
// InMemoryUsageRepository
// ===========================================================================

/// Day-level usage rows keyed by `(tenant_id, date)`.
#[derive(Default)]
pub struct InMemoryUsageRepository {
    rows: RwLock<HashMap<(TenantId, NaiveDate), DailyUsageRow>>,
}

impl InMemoryUsageRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageRepository for InMemoryUsageRepository {
    async fn upsert_daily(&self, row: &DailyUsageRow) -> Result<()> {
        let mut rows = self.rows.write().await;
        rows.insert((row.tenant_id.clone(), row.date), row.clone());
        Ok(())
    }

    async fn load_since(
        &self,
        tenant_id: &TenantId,
        since: NaiveDate,
    ) -> Result<Vec<DailyUsageRow>> {
        let rows = self.rows.read().await;
        let mut out: Vec<DailyUsageRow> = rows
            .values()
            .filter(|r| &r.tenant_id == tenant_id && r.date >= since)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.date);
        Ok(out)
    }

    async fn load_all_since(&self, since: NaiveDate) -> Result<Vec<DailyUsageRow>> {
        let rows = self.rows.read().await;
        let mut out: Vec<DailyUsageRow> =
            rows.values().filter(|r| r.date >= since).cloned().collect();
        out.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id).then(a.date.cmp(&b.date)));
        Ok(out)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

// ===========================================================================
// InMemoryAlertRepository
// ===========================================================================

/// Append-only alert list.
#[derive(Default)]
pub struct InMemoryAlertRepository {
    alerts: RwLock<Vec<AlertRecord>>,
}

impl InMemoryAlertRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AlertRepository for InMemoryAlertRepository {
    async fn save_alert(&self, alert: &AlertRecord) -> Result<()> {
        self.alerts.write().await.push(alert.clone());
        Ok(())
    }

    async fn recent_alerts(&self, limit: usize) -> Result<Vec<AlertRecord>> {
        let alerts = self.alerts.read().await;
        let mut out: Vec<AlertRecord> = alerts.iter().cloned().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn tenant_alerts(&self, tenant_id: &TenantId, limit: usize) -> Result<Vec<AlertRecord>> {
        let alerts = self.alerts.read().await;
        let mut out: Vec<AlertRecord> = alerts
            .iter()
            .filter(|a| &a.tenant_id == tenant_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit);
        Ok(out)
    }
}

// ===========================================================================
// InMemorySecurityLogRepository
// ===========================================================================

/// Append-only security log list.
#[derive(Default)]
pub struct InMemorySecurityLogRepository {
    entries: RwLock<Vec<SecurityLogEntry>>,
}

impl InMemorySecurityLogRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl SecurityLogRepository for InMemorySecurityLogRepository {
    async fn insert_batch(&self, entries: &[SecurityLogEntry]) -> Result<()> {
        self.entries.write().await.extend_from_slice(entries);
        Ok(())
    }

    async fn query(&self, query: &SecurityLogQuery) -> Result<Vec<SecurityLogEntry>> {
        let entries = self.entries.read().await;
        let mut out: Vec<SecurityLogEntry> =
            entries.iter().filter(|e| query.matches(e)).cloned().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(query.limit);
        Ok(out)
    }
}

// ===========================================================================
// InMemoryCredentialRepository
// ===========================================================================

/// Credentials keyed by id. Every mutation happens under the write lock,
/// which makes `register_failure` atomic.
#[derive(Default)]
pub struct InMemoryCredentialRepository {
    credentials: RwLock<HashMap<Uuid, AdminCredential>>,
}

impl InMemoryCredentialRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialRepository for InMemoryCredentialRepository {
    async fn insert(&self, credential: &AdminCredential) -> Result<()> {
        let mut credentials = self.credentials.write().await;
        let email = credential.email.to_lowercase();
        if credentials
            .values()
            .any(|c| c.email.to_lowercase() == email)
        {
            return Err(GuardianError::Storage(format!(
                "credential for {} already exists",
                credential.email
            )));
        }
        credentials.insert(credential.id, credential.clone());
        Ok(())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<AdminCredential>> {
        let email = email.to_lowercase();
        let credentials = self.credentials.read().await;
        Ok(credentials
            .values()
            .find(|c| c.email.to_lowercase() == email)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<AdminCredential>> {
        Ok(self.credentials.read().await.get(&id).cloned())
    }

    async fn update(&self, credential: &AdminCredential) -> Result<()> {
        let mut credentials = self.credentials.write().await;
        match credentials.get_mut(&credential.id) {
            Some(existing) => {
                *existing = credential.clone();
                Ok(())
            }
            None => Err(GuardianError::NotFound(format!(
                "credential {}",
                credential.id
            ))),
        }
    }

    async fn register_failure(
        &self,
        id: Uuid,
        max_attempts: u32,
        lock_until: DateTime<Utc>,
    ) -> Result<AdminCredential> {
        let mut credentials = self.credentials.write().await;
        let credential = credentials
            .get_mut(&id)
            .ok_or_else(|| GuardianError::NotFound(format!("credential {id}")))?;
        credential.failed_attempts += 1;
        if credential.failed_attempts >= max_attempts {
            credential.locked_until = Some(lock_until);
        }
        Ok(credential.clone())
    }

    async fn reset_failures(&self, id: Uuid) -> Result<()> {
        let mut credentials = self.credentials.write().await;
        let credential = credentials
            .get_mut(&id)
            .ok_or_else(|| GuardianError::NotFound(format!("credential {id}")))?;
        credential.failed_attempts = 0;
        credential.locked_until = None;
        Ok(())
    }
}

// ===========================================================================
// InMemoryRecordStore
// ===========================================================================

/// Schemaless rows grouped by entity name.
#[derive(Default)]
pub struct InMemoryRecordStore {
    entities: RwLock<HashMap<String, Vec<Record>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Give a row a generated `id` if it has none.
pub(crate) fn ensure_id(row: &mut Record) -> String {
    match row.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(other) => other.to_string(),
        None => {
            let id = Uuid::new_v4().to_string();
            row.insert("id".to_string(), Value::String(id.clone()));
            id
        }
    }
}

/// Tenant half of a row's storage key; empty for unscoped rows.
pub(crate) fn tenant_key(row: &Record) -> String {
    match row.get(TENANT_COLUMN) {
        Some(Value::String(tenant)) => tenant.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Rows are keyed by `(tenant, id)`, so equal ids under different tenants
/// never collide.
fn same_key(a: &Record, b: &Record) -> bool {
    a.get("id") == b.get("id") && tenant_key(a) == tenant_key(b)
}

/// Conflict keys for an upsert; `id` when none are given.
pub(crate) fn conflict_filter(row: &Record, conflict_keys: &[String]) -> RecordFilter {
    let keys: Vec<String> = if conflict_keys.is_empty() {
        vec!["id".to_string()]
    } else {
        conflict_keys.to_vec()
    };
    keys.into_iter().fold(RecordFilter::new(), |filter, key| {
        let value = row.get(&key).cloned().unwrap_or(Value::Null);
        filter.eq(key, value)
    })
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn select(&self, entity: &str, filter: &RecordFilter) -> Result<Vec<Record>> {
        let entities = self.entities.read().await;
        let rows = entities.get(entity).map(Vec::as_slice).unwrap_or_default();
        let matching = rows.iter().filter(|r| filter.matches(r)).cloned();
        Ok(match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    async fn insert(&self, entity: &str, rows: Vec<Record>) -> Result<Vec<Record>> {
        let mut entities = self.entities.write().await;
        let table = entities.entry(entity.to_string()).or_default();
        let mut stored = Vec::with_capacity(rows.len());
        for mut row in rows {
            ensure_id(&mut row);
            match table.iter_mut().find(|existing| same_key(existing, &row)) {
                Some(existing) => *existing = row.clone(),
                None => table.push(row.clone()),
            }
            stored.push(row);
        }
        Ok(stored)
    }

    async fn upsert(
        &self,
        entity: &str,
        rows: Vec<Record>,
        conflict_keys: &[String],
    ) -> Result<Vec<Record>> {
        let mut entities = self.entities.write().await;
        let table = entities.entry(entity.to_string()).or_default();
        let mut stored = Vec::with_capacity(rows.len());
        for mut row in rows {
            let filter = conflict_filter(&row, conflict_keys);
            match table.iter_mut().find(|existing| filter.matches(existing)) {
                Some(existing) => {
                    if let Some(id) = existing.get("id").cloned() {
                        row.insert("id".to_string(), id);
                    }
                    *existing = row.clone();
                }
                None => {
                    ensure_id(&mut row);
                    table.push(row.clone());
                }
            }
            stored.push(row);
        }
        Ok(stored)
    }

    async fn update(&self, entity: &str, filter: &RecordFilter, patch: Record) -> Result<u64> {
        let mut entities = self.entities.write().await;
        let Some(table) = entities.get_mut(entity) else {
            return Ok(0);
        };
        let mut updated = 0;
        for row in table.iter_mut().filter(|r| filter.matches(r)) {
            for (key, value) in &patch {
                row.insert(key.clone(), value.clone());
            }
            updated += 1;
        }
        Ok(updated)
    }

    async fn delete(&self, entity: &str, filter: &RecordFilter) -> Result<u64> {
        let mut entities = self.entities.write().await;
        let Some(table) = entities.get_mut(entity) else {
            return Ok(0);
        };
        let before = table.len();
        table.retain(|r| !filter.matches(r));
        Ok((before - table.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use guardian_core::{AlertLevel, SecurityEventType, SecuritySeverity, UsageTotals};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap()
    }

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn usage_row(tenant: &str, day: u32, cost: f64) -> DailyUsageRow {
        DailyUsageRow {
            tenant_id: TenantId::new(tenant),
            date: NaiveDate::from_ymd_opt(2026, 3, day).unwrap(),
            totals: UsageTotals {
                calls: 1,
                tokens_in: 0,
                tokens_out: 0,
                cost,
            },
            updated_at: t0(),
        }
    }

    fn credential(email: &str) -> AdminCredential {
        AdminCredential {
            id: Uuid::new_v4(),
            email: email.to_string(),
            tenant_id: None,
            role: "admin".to_string(),
            password_hash: "hash".to_string(),
            password_history: vec!["hash".to_string()],
            is_provisional: false,
            provisional_expiry: None,
            must_change_password: false,
            failed_attempts: 0,
            locked_until: None,
            password_changed_at: Some(t0()),
            created_at: t0(),
        }
    }

    #[tokio::test]
    async fn test_usage_upsert_replaces_same_day() {
        let repo = InMemoryUsageRepository::new();
        repo.upsert_daily(&usage_row("a", 3, 1.0)).await.unwrap();
        repo.upsert_daily(&usage_row("a", 3, 2.5)).await.unwrap();
        repo.upsert_daily(&usage_row("a", 1, 4.0)).await.unwrap();
        repo.upsert_daily(&usage_row("b", 3, 9.0)).await.unwrap();

        let since = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let rows = repo.load_since(&TenantId::new("a"), since).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].totals.cost - 2.5).abs() < f64::EPSILON);

        let all = repo
            .load_all_since(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap())
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_alerts_newest_first_and_per_tenant() {
        let repo = InMemoryAlertRepository::new();
        for (i, tenant) in ["a", "b", "a"].iter().enumerate() {
            repo.save_alert(&AlertRecord {
                id: Uuid::new_v4(),
                tenant_id: TenantId::new(*tenant),
                level: AlertLevel::Warning,
                percentage: 80,
                message: format!("alert {i}"),
                created_at: t0() + Duration::minutes(i as i64),
            })
            .await
            .unwrap();
        }
        let recent = repo.recent_alerts(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "alert 2");
        let tenant_a = repo.tenant_alerts(&TenantId::new("a"), 10).await.unwrap();
        assert_eq!(tenant_a.len(), 2);
    }

    #[tokio::test]
    async fn test_security_log_query_filters() {
        let repo = InMemorySecurityLogRepository::new();
        let entry = |event_type, severity| SecurityLogEntry {
            id: Uuid::new_v4(),
            event_type,
            severity,
            identity: "10.0.0.1".into(),
            tenant_id: None,
            path: None,
            method: None,
            details: Value::Null,
            created_at: t0(),
        };
        repo.insert_batch(&[
            entry(SecurityEventType::XssAttempt, SecuritySeverity::High),
            entry(SecurityEventType::CsrfFailure, SecuritySeverity::Medium),
        ])
        .await
        .unwrap();
        assert_eq!(repo.len().await, 2);

        let query = SecurityLogQuery {
            severity: Some(SecuritySeverity::High),
            ..Default::default()
        };
        let found = repo.query(&query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].event_type, SecurityEventType::XssAttempt);
    }

    #[tokio::test]
    async fn test_credentials_unique_email_case_insensitive() {
        let repo = InMemoryCredentialRepository::new();
        repo.insert(&credential("Owner@Example.com")).await.unwrap();
        assert!(repo.insert(&credential("owner@example.com")).await.is_err());
        assert!(repo
            .find_by_email("OWNER@example.com")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_register_failure_locks_at_threshold() {
        let repo = InMemoryCredentialRepository::new();
        let cred = credential("a@example.com");
        repo.insert(&cred).await.unwrap();
        let lock_until = t0() + Duration::minutes(30);
        for attempt in 1..=4 {
            let updated = repo.register_failure(cred.id, 5, lock_until).await.unwrap();
            assert_eq!(updated.failed_attempts, attempt);
            assert!(updated.locked_until.is_none());
        }
        let locked = repo.register_failure(cred.id, 5, lock_until).await.unwrap();
        assert_eq!(locked.locked_until, Some(lock_until));

        repo.reset_failures(cred.id).await.unwrap();
        let reset = repo.find_by_id(cred.id).await.unwrap().unwrap();
        assert_eq!(reset.failed_attempts, 0);
        assert!(reset.locked_until.is_none());
    }

    #[tokio::test]
    async fn test_record_store_crud() {
        let store = InMemoryRecordStore::new();
        let inserted = store
            .insert(
                "bookings",
                vec![
                    record(json!({"tenant_id": "t1", "client": "Ana"})),
                    record(json!({"tenant_id": "t2", "client": "Bea"})),
                ],
            )
            .await
            .unwrap();
        assert!(inserted.iter().all(|r| r.contains_key("id")));

        let filter = RecordFilter::new().eq("tenant_id", "t1");
        assert_eq!(store.select("bookings", &filter).await.unwrap().len(), 1);

        let patch = record(json!({"status": "confirmed"}));
        assert_eq!(store.update("bookings", &filter, patch).await.unwrap(), 1);
        let rows = store.select("bookings", &filter).await.unwrap();
        assert_eq!(rows[0]["status"], json!("confirmed"));

        assert_eq!(store.delete("bookings", &filter).await.unwrap(), 1);
        assert_eq!(
            store
                .select("bookings", &RecordFilter::new())
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_record_store_upsert_on_conflict_keys() {
        let store = InMemoryRecordStore::new();
        let keys = vec!["tenant_id".to_string(), "date".to_string()];
        store
            .upsert(
                "daily",
                vec![record(json!({"tenant_id": "t1", "date": "2026-03-10", "calls": 1}))],
                &keys,
            )
            .await
            .unwrap();
        store
            .upsert(
                "daily",
                vec![record(json!({"tenant_id": "t1", "date": "2026-03-10", "calls": 2}))],
                &keys,
            )
            .await
            .unwrap();
        let rows = store.select("daily", &RecordFilter::new()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["calls"], json!(2));
    }
}

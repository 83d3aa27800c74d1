//! Tenant isolation over a [`RecordStore`].
//!
//! Business code never talks to the raw store. It asks a [`ScopedStore`] for a
//! [`ScopedRepository`] bound either to a tenant or to an audited system scope,
//! and every row filter, insert and patch passes through [`ScopedRepository`]
//! where the tenant rule is applied.

use guardian_core::{GuardianError, Record, RecordFilter, RecordStore, Result, TenantId, TENANT_COLUMN};
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

tokio::task_local! {
    static CURRENT_TENANT: TenantId;
}

/// Run `fut` with `tenant` bound as the task's tenant context.
pub async fn with_tenant<F>(tenant: TenantId, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_TENANT.scope(tenant, fut).await
}

/// Tenant bound to the current task, if any.
pub fn current_tenant() -> Option<TenantId> {
    CURRENT_TENANT.try_with(Clone::clone).ok()
}

/// Scope a repository operates in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantScope {
    Tenant(TenantId),
    /// Unscoped access. The reason is written to the audit log.
    System { reason: String },
}

/// Factory for scoped repositories over one shared record store.
#[derive(Clone)]
pub struct ScopedStore {
    inner: Arc<dyn RecordStore>,
    shared: Arc<HashSet<String>>,
}

impl ScopedStore {
    pub fn new(inner: Arc<dyn RecordStore>, shared_entities: &[String]) -> Self {
        Self {
            inner,
            shared: Arc::new(shared_entities.iter().cloned().collect()),
        }
    }

    /// Repository restricted to `tenant`.
    pub fn for_tenant(&self, tenant: TenantId) -> ScopedRepository {
        ScopedRepository {
            inner: Arc::clone(&self.inner),
            shared: Arc::clone(&self.shared),
            scope: TenantScope::Tenant(tenant),
        }
    }

    /// Unscoped repository. Every acquisition is audited.
    pub fn system(&self, reason: impl Into<String>) -> ScopedRepository {
        let reason = reason.into();
        info!(target: "guardian::audit", reason = %reason, "unscoped record access granted");
        ScopedRepository {
            inner: Arc::clone(&self.inner),
            shared: Arc::clone(&self.shared),
            scope: TenantScope::System { reason },
        }
    }

    /// Repository for the tenant bound to the current task, or the audited
    /// system scope when none is bound.
    pub fn current(&self) -> ScopedRepository {
        match current_tenant() {
            Some(tenant) => self.for_tenant(tenant),
            None => self.system("no tenant bound to task"),
        }
    }

    /// Repository for a caller outside the Guardian. A tenant must be bound
    /// to the task, and shared entities are reachable only from the system
    /// scope.
    pub fn for_request(&self, entity: &str) -> Result<ScopedRepository> {
        if self.is_shared(entity) {
            return Err(GuardianError::TenantScope(format!(
                "{entity} is reachable only from the system scope"
            )));
        }
        current_tenant()
            .map(|tenant| self.for_tenant(tenant))
            .ok_or_else(|| GuardianError::TenantScope("no tenant bound to request".to_string()))
    }

    pub fn is_shared(&self, entity: &str) -> bool {
        self.shared.contains(entity)
    }
}

/// Record access with the tenant rule applied.
#[derive(Clone)]
pub struct ScopedRepository {
    inner: Arc<dyn RecordStore>,
    shared: Arc<HashSet<String>>,
    scope: TenantScope,
}

impl ScopedRepository {
    pub fn scope(&self) -> &TenantScope {
        &self.scope
    }

    /// Tenant to enforce for `entity`, or `None` when unscoped.
    fn tenant_for(&self, entity: &str) -> Option<&TenantId> {
        if self.shared.contains(entity) {
            return None;
        }
        match &self.scope {
            TenantScope::Tenant(tenant) => Some(tenant),
            TenantScope::System { .. } => None,
        }
    }

    fn scoped_filter(&self, entity: &str, filter: &RecordFilter) -> Result<RecordFilter> {
        let Some(tenant) = self.tenant_for(entity) else {
            return Ok(filter.clone());
        };
        // A caller-written tenant condition naming another tenant can only
        // match nothing once ours is appended, so reject it outright.
        if let Some((_, value)) = filter
            .conditions
            .iter()
            .find(|(field, value)| field == TENANT_COLUMN && value.as_str() != Some(tenant.as_str()))
        {
            return Err(GuardianError::TenantScope(format!(
                "filter on {entity} names tenant {value} while scoped to {tenant}"
            )));
        }
        Ok(filter.clone().eq(TENANT_COLUMN, tenant.as_str()))
    }

    fn stamp_row(&self, entity: &str, tenant: &TenantId, row: &mut Record) {
        let ours = Value::String(tenant.0.clone());
        if let Some(existing) = row.get(TENANT_COLUMN) {
            if *existing != ours {
                warn!(
                    entity,
                    tenant_id = %tenant,
                    supplied = %existing,
                    "overwriting foreign tenant_id on write"
                );
            }
        }
        row.insert(TENANT_COLUMN.to_string(), ours);
    }

    pub async fn select(&self, entity: &str, filter: &RecordFilter) -> Result<Vec<Record>> {
        let filter = self.scoped_filter(entity, filter)?;
        self.inner.select(entity, &filter).await
    }

    pub async fn insert(&self, entity: &str, mut rows: Vec<Record>) -> Result<Vec<Record>> {
        if let Some(tenant) = self.tenant_for(entity) {
            for row in &mut rows {
                self.stamp_row(entity, tenant, row);
            }
        }
        self.inner.insert(entity, rows).await
    }

    pub async fn upsert(
        &self,
        entity: &str,
        mut rows: Vec<Record>,
        conflict_keys: &[String],
    ) -> Result<Vec<Record>> {
        let mut keys = conflict_keys.to_vec();
        if let Some(tenant) = self.tenant_for(entity) {
            for row in &mut rows {
                self.stamp_row(entity, tenant, row);
            }
            if keys.is_empty() {
                keys.push("id".to_string());
            }
            if !keys.iter().any(|k| k == TENANT_COLUMN) {
                keys.push(TENANT_COLUMN.to_string());
            }
        }
        self.inner.upsert(entity, rows, &keys).await
    }

    pub async fn update(
        &self,
        entity: &str,
        filter: &RecordFilter,
        mut patch: Record,
    ) -> Result<u64> {
        let scoped = self.scoped_filter(entity, filter)?;
        if let Some(tenant) = self.tenant_for(entity) {
            self.stamp_row(entity, tenant, &mut patch);
        }
        self.inner.update(entity, &scoped, patch).await
    }

    pub async fn delete(&self, entity: &str, filter: &RecordFilter) -> Result<u64> {
        let filter = self.scoped_filter(entity, filter)?;
        self.inner.delete(entity, &filter).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryRecordStore;
    use crate::sqlite::{connect, SqliteRecordStore};
    use guardian_core::IsolationConfig;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn store() -> ScopedStore {
        ScopedStore::new(
            Arc::new(InMemoryRecordStore::new()),
            &IsolationConfig::default().shared_entities,
        )
    }

    async fn seed(store: &ScopedStore) {
        store
            .for_tenant(TenantId::new("t1"))
            .insert("bookings", vec![record(json!({"client": "Ana"}))])
            .await
            .unwrap();
        store
            .for_tenant(TenantId::new("t2"))
            .insert("bookings", vec![record(json!({"client": "Bea"}))])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_select_never_crosses_tenants() {
        let store = store();
        seed(&store).await;

        let rows = store
            .for_tenant(TenantId::new("t1"))
            .select("bookings", &RecordFilter::new())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["tenant_id"], json!("t1"));
        assert_eq!(rows[0]["client"], json!("Ana"));
    }

    #[tokio::test]
    async fn test_foreign_tenant_filter_is_rejected() {
        let store = store();
        seed(&store).await;
        let filter = RecordFilter::new().eq("tenant_id", "t2");
        let err = store
            .for_tenant(TenantId::new("t1"))
            .select("bookings", &filter)
            .await
            .unwrap_err();
        assert!(matches!(err, GuardianError::TenantScope(_)));
    }

    #[tokio::test]
    async fn test_insert_overwrites_foreign_tenant() {
        let store = store();
        let inserted = store
            .for_tenant(TenantId::new("t1"))
            .insert(
                "bookings",
                vec![record(json!({"client": "Eve", "tenant_id": "t2"}))],
            )
            .await
            .unwrap();
        assert_eq!(inserted[0]["tenant_id"], json!("t1"));

        let t2_rows = store
            .for_tenant(TenantId::new("t2"))
            .select("bookings", &RecordFilter::new())
            .await
            .unwrap();
        assert!(t2_rows.is_empty());
    }

    #[tokio::test]
    async fn test_update_and_delete_are_scoped() {
        let store = store();
        seed(&store).await;
        let t1 = store.for_tenant(TenantId::new("t1"));

        let patch = record(json!({"status": "cancelled", "tenant_id": "t2"}));
        assert_eq!(t1.update("bookings", &RecordFilter::new(), patch).await.unwrap(), 1);
        assert_eq!(t1.delete("bookings", &RecordFilter::new()).await.unwrap(), 1);

        let everything = store
            .system("test inspection")
            .select("bookings", &RecordFilter::new())
            .await
            .unwrap();
        assert_eq!(everything.len(), 1);
        assert_eq!(everything[0]["tenant_id"], json!("t2"));
        assert!(everything[0].get("status").is_none());
    }

    #[tokio::test]
    async fn test_upsert_conflicts_within_tenant_only() {
        let store = store();
        let keys = vec!["slug".to_string()];
        store
            .for_tenant(TenantId::new("t1"))
            .upsert("services", vec![record(json!({"slug": "cut", "price": 20}))], &keys)
            .await
            .unwrap();
        store
            .for_tenant(TenantId::new("t2"))
            .upsert("services", vec![record(json!({"slug": "cut", "price": 35}))], &keys)
            .await
            .unwrap();
        store
            .for_tenant(TenantId::new("t1"))
            .upsert("services", vec![record(json!({"slug": "cut", "price": 25}))], &keys)
            .await
            .unwrap();

        let all = store
            .system("test inspection")
            .select("services", &RecordFilter::new())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        let t1 = store
            .for_tenant(TenantId::new("t1"))
            .select("services", &RecordFilter::new())
            .await
            .unwrap();
        assert_eq!(t1[0]["price"], json!(25));
    }

    #[tokio::test]
    async fn test_shared_entities_bypass_scoping() {
        let store = store();
        assert!(store.is_shared("tenants"));
        store
            .system("seed registry")
            .insert(
                "tenants",
                vec![
                    record(json!({"id": "t1", "name": "Salon One"})),
                    record(json!({"id": "t2", "name": "Salon Two"})),
                ],
            )
            .await
            .unwrap();

        let seen = store
            .for_tenant(TenantId::new("t1"))
            .select("tenants", &RecordFilter::new())
            .await
            .unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|r| r.get("tenant_id").is_none()));
    }

    #[tokio::test]
    async fn test_current_reads_task_local_tenant() {
        let store = store();
        seed(&store).await;

        let rows = with_tenant(TenantId::new("t2"), async {
            assert_eq!(current_tenant(), Some(TenantId::new("t2")));
            store
                .current()
                .select("bookings", &RecordFilter::new())
                .await
                .unwrap()
        })
        .await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["client"], json!("Bea"));

        assert_eq!(current_tenant(), None);
        let unscoped = store.current();
        assert!(matches!(unscoped.scope(), TenantScope::System { .. }));
        assert_eq!(
            unscoped
                .select("bookings", &RecordFilter::new())
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_for_request_requires_bound_tenant() {
        let store = store();
        seed(&store).await;

        let err = store.for_request("bookings").err().unwrap();
        assert!(matches!(err, GuardianError::TenantScope(_)));

        let rows = with_tenant(TenantId::new("t1"), async {
            store
                .for_request("bookings")
                .unwrap()
                .select("bookings", &RecordFilter::new())
                .await
                .unwrap()
        })
        .await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["client"], json!("Ana"));
    }

    #[tokio::test]
    async fn test_for_request_refuses_shared_entities() {
        let store = store();
        let result = with_tenant(TenantId::new("t1"), async {
            store.for_request("tenants").map(|_| ())
        })
        .await;
        assert!(matches!(result, Err(GuardianError::TenantScope(_))));
    }

    async fn same_id_across_tenants(store: ScopedStore) {
        let t1 = store.for_tenant(TenantId::new("t1"));
        let t2 = store.for_tenant(TenantId::new("t2"));
        t2.insert("bookings", vec![record(json!({"id": "b1", "client": "Bea"}))])
            .await
            .unwrap();
        t1.insert("bookings", vec![record(json!({"id": "b1", "client": "Ana"}))])
            .await
            .unwrap();
        t1.upsert(
            "bookings",
            vec![record(json!({"id": "b1", "client": "Ana", "paid": true}))],
            &[],
        )
        .await
        .unwrap();

        let t2_rows = t2.select("bookings", &RecordFilter::new()).await.unwrap();
        assert_eq!(t2_rows.len(), 1);
        assert_eq!(t2_rows[0]["client"], json!("Bea"));
        assert!(t2_rows[0].get("paid").is_none());

        let t1_rows = t1.select("bookings", &RecordFilter::new()).await.unwrap();
        assert_eq!(t1_rows.len(), 1);
        assert_eq!(t1_rows[0]["paid"], json!(true));

        // A second insert of the same id replaces the tenant's own row.
        t1.insert("bookings", vec![record(json!({"id": "b1", "client": "Ana B."}))])
            .await
            .unwrap();
        let t1_rows = t1.select("bookings", &RecordFilter::new()).await.unwrap();
        assert_eq!(t1_rows.len(), 1);
        assert_eq!(t1_rows[0]["client"], json!("Ana B."));
        assert_eq!(t2.select("bookings", &RecordFilter::new()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_same_id_across_tenants_in_memory() {
        same_id_across_tenants(store()).await;
    }

    #[tokio::test]
    async fn test_same_id_across_tenants_in_sqlite() {
        let pool = connect("sqlite::memory:").await.unwrap();
        let store = ScopedStore::new(
            Arc::new(SqliteRecordStore::from_pool(pool)),
            &IsolationConfig::default().shared_entities,
        );
        same_id_across_tenants(store).await;
    }
}

//! SQLite repositories.
//!
//! Timestamps are stored as RFC 3339 text with a fixed `Z` suffix and
//! microsecond precision so lexical order matches chronological order.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use guardian_core::{
    AdminCredential, AlertLevel, AlertRecord, AlertRepository, CredentialRepository,
    DailyUsageRow, GuardianError, Record, RecordFilter, RecordStore, Result, SecurityLogEntry,
    SecurityLogQuery, SecurityLogRepository, TenantId, UsageRepository, UsageTotals,
};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

use crate::memory::{conflict_filter, ensure_id, tenant_key};

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const GUARDIAN_MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS guardian_usage (
        tenant_id TEXT NOT NULL,
        date TEXT NOT NULL,
        calls INTEGER NOT NULL DEFAULT 0,
        tokens_in INTEGER NOT NULL DEFAULT 0,
        tokens_out INTEGER NOT NULL DEFAULT 0,
        cost REAL NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, date)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS guardian_alerts (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        level TEXT NOT NULL,
        percentage INTEGER NOT NULL,
        message TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_guardian_alerts_tenant ON guardian_alerts(tenant_id, level, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS guardian_security_logs (
        id TEXT PRIMARY KEY,
        event_type TEXT NOT NULL,
        severity TEXT NOT NULL,
        identity TEXT NOT NULL,
        tenant_id TEXT,
        path TEXT,
        method TEXT,
        details TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_guardian_security_logs_created ON guardian_security_logs(created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS guardian_credentials (
        id TEXT PRIMARY KEY,
        email TEXT NOT NULL UNIQUE COLLATE NOCASE,
        tenant_id TEXT,
        role TEXT NOT NULL,
        password_hash TEXT NOT NULL,
        password_history TEXT NOT NULL,
        is_provisional INTEGER NOT NULL,
        provisional_expiry TEXT,
        must_change_password INTEGER NOT NULL,
        failed_attempts INTEGER NOT NULL DEFAULT 0,
        locked_until TEXT,
        password_changed_at TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS guardian_records (
        entity TEXT NOT NULL,
        tenant TEXT NOT NULL DEFAULT '',
        id TEXT NOT NULL,
        data TEXT NOT NULL,
        PRIMARY KEY (entity, tenant, id)
    )
    "#,
];

// ---------------------------------------------------------------------------
// Pool helpers
// ---------------------------------------------------------------------------

/// Open a SQLite pool, creating the database file if needed.
pub(crate) async fn open_pool(database_url: &str) -> Result<SqlitePool> {
    let connect_opts = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| GuardianError::Storage(format!("Invalid database URL: {e}")))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    // Every in-memory connection is its own database.
    let max_conns: u32 = if database_url.contains(":memory:") {
        1
    } else {
        10
    };

    sqlx::pool::PoolOptions::<Sqlite>::new()
        .max_connections(max_conns)
        .connect_with(connect_opts)
        .await
        .map_err(|e| GuardianError::Storage(format!("Failed to connect to SQLite: {e}")))
}

/// Apply the Guardian schema. Every statement is idempotent.
pub(crate) async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for statement in GUARDIAN_MIGRATIONS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| GuardianError::Storage(format!("Migration failed: {e}")))?;
    }
    Ok(())
}

/// Open a pool and apply migrations.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let pool = open_pool(database_url).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| GuardianError::Storage(format!("Invalid timestamp '{value}': {e}")))
}

fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}

fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| GuardianError::Storage(format!("Invalid date '{value}': {e}")))
}

fn storage_err(context: &str) -> impl Fn(sqlx::Error) -> GuardianError + '_ {
    move |e| GuardianError::Storage(format!("{context}: {e}"))
}

// ===========================================================================
// SqliteUsageRepository
// ===========================================================================

/// Day-level usage rows in `guardian_usage`.
pub struct SqliteUsageRepository {
    pool: SqlitePool,
}

impl SqliteUsageRepository {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_usage(row: &SqliteRow) -> Result<DailyUsageRow> {
        let date: String = row.get("date");
        let updated_at: String = row.get("updated_at");
        Ok(DailyUsageRow {
            tenant_id: TenantId(row.get("tenant_id")),
            date: parse_date(&date)?,
            totals: UsageTotals {
                calls: row.get::<i64, _>("calls").max(0) as u64,
                tokens_in: row.get::<i64, _>("tokens_in").max(0) as u64,
                tokens_out: row.get::<i64, _>("tokens_out").max(0) as u64,
                cost: row.get("cost"),
            },
            updated_at: parse_ts(&updated_at)?,
        })
    }
}

/// SQLite integers are signed; saturated counters are stored as `i64::MAX`.
fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl UsageRepository for SqliteUsageRepository {
    async fn upsert_daily(&self, row: &DailyUsageRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO guardian_usage (tenant_id, date, calls, tokens_in, tokens_out, cost, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (tenant_id, date) DO UPDATE SET
                calls = excluded.calls,
                tokens_in = excluded.tokens_in,
                tokens_out = excluded.tokens_out,
                cost = excluded.cost,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(row.tenant_id.as_str())
        .bind(row.date.format("%Y-%m-%d").to_string())
        .bind(clamp_i64(row.totals.calls))
        .bind(clamp_i64(row.totals.tokens_in))
        .bind(clamp_i64(row.totals.tokens_out))
        .bind(row.totals.cost)
        .bind(ts(row.updated_at))
        .execute(&self.pool)
        .await
        .map_err(storage_err("Failed to upsert usage"))?;
        Ok(())
    }

    async fn load_since(
        &self,
        tenant_id: &TenantId,
        since: NaiveDate,
    ) -> Result<Vec<DailyUsageRow>> {
        let rows = sqlx::query(
            "SELECT * FROM guardian_usage WHERE tenant_id = ?1 AND date >= ?2 ORDER BY date",
        )
        .bind(tenant_id.as_str())
        .bind(since.format("%Y-%m-%d").to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err("Failed to load usage"))?;
        rows.iter().map(Self::row_to_usage).collect()
    }

    async fn load_all_since(&self, since: NaiveDate) -> Result<Vec<DailyUsageRow>> {
        let rows = sqlx::query(
            "SELECT * FROM guardian_usage WHERE date >= ?1 ORDER BY tenant_id, date",
        )
        .bind(since.format("%Y-%m-%d").to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err("Failed to load usage"))?;
        rows.iter().map(Self::row_to_usage).collect()
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err("Health check failed"))?;
        Ok(())
    }
}

// ===========================================================================
// SqliteAlertRepository
// ===========================================================================

/// Quota alerts in `guardian_alerts`.
pub struct SqliteAlertRepository {
    pool: SqlitePool,
}

impl SqliteAlertRepository {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_alert(row: &SqliteRow) -> Result<AlertRecord> {
        let id: String = row.get("id");
        let level: String = row.get("level");
        let created_at: String = row.get("created_at");
        Ok(AlertRecord {
            id: Uuid::parse_str(&id)
                .map_err(|e| GuardianError::Storage(format!("Invalid alert id: {e}")))?,
            tenant_id: TenantId(row.get("tenant_id")),
            level: match level.as_str() {
                "critical" => AlertLevel::Critical,
                _ => AlertLevel::Warning,
            },
            percentage: row.get::<i64, _>("percentage").max(0) as u32,
            message: row.get("message"),
            created_at: parse_ts(&created_at)?,
        })
    }
}

#[async_trait]
impl AlertRepository for SqliteAlertRepository {
    async fn save_alert(&self, alert: &AlertRecord) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO guardian_alerts (id, tenant_id, level, percentage, message, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(alert.id.to_string())
        .bind(alert.tenant_id.as_str())
        .bind(alert.level.as_str())
        .bind(alert.percentage as i64)
        .bind(&alert.message)
        .bind(ts(alert.created_at))
        .execute(&self.pool)
        .await
        .map_err(storage_err("Failed to insert alert"))?;
        Ok(())
    }

    async fn recent_alerts(&self, limit: usize) -> Result<Vec<AlertRecord>> {
        let rows = sqlx::query("SELECT * FROM guardian_alerts ORDER BY created_at DESC LIMIT ?1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err("Failed to query alerts"))?;
        rows.iter().map(Self::row_to_alert).collect()
    }

    async fn tenant_alerts(&self, tenant_id: &TenantId, limit: usize) -> Result<Vec<AlertRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM guardian_alerts WHERE tenant_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )
        .bind(tenant_id.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err("Failed to query alerts"))?;
        rows.iter().map(Self::row_to_alert).collect()
    }
}

// ===========================================================================
// SqliteSecurityLogRepository
// ===========================================================================

/// Security log rows in `guardian_security_logs`.
pub struct SqliteSecurityLogRepository {
    pool: SqlitePool,
}

impl SqliteSecurityLogRepository {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: &SqliteRow) -> Result<SecurityLogEntry> {
        let id: String = row.get("id");
        let event_type: String = row.get("event_type");
        let severity: String = row.get("severity");
        let details: String = row.get("details");
        let created_at: String = row.get("created_at");
        Ok(SecurityLogEntry {
            id: Uuid::parse_str(&id)
                .map_err(|e| GuardianError::Storage(format!("Invalid log id: {e}")))?,
            event_type: event_type.parse()?,
            severity: severity.parse()?,
            identity: row.get("identity"),
            tenant_id: row.get::<Option<String>, _>("tenant_id").map(TenantId),
            path: row.get("path"),
            method: row.get("method"),
            details: serde_json::from_str(&details)?,
            created_at: parse_ts(&created_at)?,
        })
    }
}

#[async_trait]
impl SecurityLogRepository for SqliteSecurityLogRepository {
    async fn insert_batch(&self, entries: &[SecurityLogEntry]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(storage_err("Failed to begin transaction"))?;
        for entry in entries {
            sqlx::query(
                "INSERT OR IGNORE INTO guardian_security_logs \
                 (id, event_type, severity, identity, tenant_id, path, method, details, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )
            .bind(entry.id.to_string())
            .bind(entry.event_type.as_str())
            .bind(entry.severity.as_str())
            .bind(&entry.identity)
            .bind(entry.tenant_id.as_ref().map(|t| t.0.clone()))
            .bind(&entry.path)
            .bind(&entry.method)
            .bind(serde_json::to_string(&entry.details)?)
            .bind(ts(entry.created_at))
            .execute(&mut *tx)
            .await
            .map_err(storage_err("Failed to insert security log"))?;
        }
        tx.commit()
            .await
            .map_err(storage_err("Failed to commit security logs"))?;
        Ok(())
    }

    async fn query(&self, query: &SecurityLogQuery) -> Result<Vec<SecurityLogEntry>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM guardian_security_logs WHERE 1 = 1");
        if let Some(event_type) = query.event_type {
            builder.push(" AND event_type = ").push_bind(event_type.as_str());
        }
        if let Some(severity) = query.severity {
            builder.push(" AND severity = ").push_bind(severity.as_str());
        }
        if let Some(identity) = &query.identity {
            builder.push(" AND identity = ").push_bind(identity.clone());
        }
        if let Some(since) = query.since {
            builder.push(" AND created_at >= ").push_bind(ts(since));
        }
        builder
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(query.limit as i64);

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err("Failed to query security logs"))?;
        rows.iter().map(Self::row_to_entry).collect()
    }
}

// ===========================================================================
// SqliteCredentialRepository
// ===========================================================================

/// Administrator credentials in `guardian_credentials`.
pub struct SqliteCredentialRepository {
    pool: SqlitePool,
}

impl SqliteCredentialRepository {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_credential(row: &SqliteRow) -> Result<AdminCredential> {
        let id: String = row.get("id");
        let history: String = row.get("password_history");
        let created_at: String = row.get("created_at");
        Ok(AdminCredential {
            id: Uuid::parse_str(&id)
                .map_err(|e| GuardianError::Storage(format!("Invalid credential id: {e}")))?,
            email: row.get("email"),
            tenant_id: row.get::<Option<String>, _>("tenant_id").map(TenantId),
            role: row.get("role"),
            password_hash: row.get("password_hash"),
            password_history: serde_json::from_str(&history)?,
            is_provisional: row.get::<i64, _>("is_provisional") != 0,
            provisional_expiry: parse_opt_ts(row.get("provisional_expiry"))?,
            must_change_password: row.get::<i64, _>("must_change_password") != 0,
            failed_attempts: row.get::<i64, _>("failed_attempts").max(0) as u32,
            locked_until: parse_opt_ts(row.get("locked_until"))?,
            password_changed_at: parse_opt_ts(row.get("password_changed_at"))?,
            created_at: parse_ts(&created_at)?,
        })
    }
}

#[async_trait]
impl CredentialRepository for SqliteCredentialRepository {
    async fn insert(&self, credential: &AdminCredential) -> Result<()> {
        sqlx::query(
            "INSERT INTO guardian_credentials \
             (id, email, tenant_id, role, password_hash, password_history, is_provisional, \
              provisional_expiry, must_change_password, failed_attempts, locked_until, \
              password_changed_at, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(credential.id.to_string())
        .bind(&credential.email)
        .bind(credential.tenant_id.as_ref().map(|t| t.0.clone()))
        .bind(&credential.role)
        .bind(&credential.password_hash)
        .bind(serde_json::to_string(&credential.password_history)?)
        .bind(credential.is_provisional as i64)
        .bind(credential.provisional_expiry.map(ts))
        .bind(credential.must_change_password as i64)
        .bind(credential.failed_attempts as i64)
        .bind(credential.locked_until.map(ts))
        .bind(credential.password_changed_at.map(ts))
        .bind(ts(credential.created_at))
        .execute(&self.pool)
        .await
        .map_err(storage_err("Failed to insert credential"))?;
        Ok(())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<AdminCredential>> {
        let row = sqlx::query("SELECT * FROM guardian_credentials WHERE email = ?1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err("Failed to query credential"))?;
        row.as_ref().map(Self::row_to_credential).transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<AdminCredential>> {
        let row = sqlx::query("SELECT * FROM guardian_credentials WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err("Failed to query credential"))?;
        row.as_ref().map(Self::row_to_credential).transpose()
    }

    async fn update(&self, credential: &AdminCredential) -> Result<()> {
        let result = sqlx::query(
            "UPDATE guardian_credentials SET \
             email = ?2, tenant_id = ?3, role = ?4, password_hash = ?5, password_history = ?6, \
             is_provisional = ?7, provisional_expiry = ?8, must_change_password = ?9, \
             failed_attempts = ?10, locked_until = ?11, password_changed_at = ?12 \
             WHERE id = ?1",
        )
        .bind(credential.id.to_string())
        .bind(&credential.email)
        .bind(credential.tenant_id.as_ref().map(|t| t.0.clone()))
        .bind(&credential.role)
        .bind(&credential.password_hash)
        .bind(serde_json::to_string(&credential.password_history)?)
        .bind(credential.is_provisional as i64)
        .bind(credential.provisional_expiry.map(ts))
        .bind(credential.must_change_password as i64)
        .bind(credential.failed_attempts as i64)
        .bind(credential.locked_until.map(ts))
        .bind(credential.password_changed_at.map(ts))
        .execute(&self.pool)
        .await
        .map_err(storage_err("Failed to update credential"))?;
        if result.rows_affected() == 0 {
            return Err(GuardianError::NotFound(format!("credential {}", credential.id)));
        }
        Ok(())
    }

    async fn register_failure(
        &self,
        id: Uuid,
        max_attempts: u32,
        lock_until: DateTime<Utc>,
    ) -> Result<AdminCredential> {
        let row = sqlx::query(
            "UPDATE guardian_credentials SET \
             failed_attempts = failed_attempts + 1, \
             locked_until = CASE WHEN failed_attempts + 1 >= ?2 THEN ?3 ELSE locked_until END \
             WHERE id = ?1 RETURNING *",
        )
        .bind(id.to_string())
        .bind(max_attempts as i64)
        .bind(ts(lock_until))
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err("Failed to register login failure"))?;
        match row {
            Some(row) => Self::row_to_credential(&row),
            None => Err(GuardianError::NotFound(format!("credential {id}"))),
        }
    }

    async fn reset_failures(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE guardian_credentials SET failed_attempts = 0, locked_until = NULL WHERE id = ?1",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage_err("Failed to reset login failures"))?;
        Ok(())
    }
}

// ===========================================================================
// SqliteRecordStore
// ===========================================================================

/// Schemaless rows stored as JSON documents in `guardian_records`.
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append the filter conditions as `json_extract` comparisons.
    fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &RecordFilter) -> Result<()> {
        for (field, value) in &filter.conditions {
            if field.is_empty()
                || !field
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(GuardianError::Storage(format!(
                    "Invalid filter field '{field}'"
                )));
            }
            builder.push(format!(" AND json_extract(data, '$.{field}')"));
            match value {
                Value::Null => {
                    builder.push(" IS NULL");
                }
                Value::Bool(b) => {
                    builder.push(" = ").push_bind(i64::from(*b));
                }
                Value::Number(n) => {
                    builder.push(" = ");
                    match n.as_i64() {
                        Some(i) => builder.push_bind(i),
                        None => builder.push_bind(n.as_f64().unwrap_or_default()),
                    };
                }
                Value::String(s) => {
                    builder.push(" = ").push_bind(s.clone());
                }
                other => {
                    builder
                        .push(" = json(")
                        .push_bind(other.to_string())
                        .push(")");
                }
            }
        }
        Ok(())
    }

    async fn matching_rows(
        &self,
        entity: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<(i64, String, Record)>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT rowid, id, data FROM guardian_records WHERE entity = ");
        builder.push_bind(entity.to_string());
        Self::push_filter(&mut builder, filter)?;
        builder.push(" ORDER BY rowid");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err("Failed to select records"))?;
        rows.iter()
            .map(|row| {
                let rowid: i64 = row.get("rowid");
                let id: String = row.get("id");
                let data: String = row.get("data");
                let record: Record = serde_json::from_str(&data)?;
                Ok((rowid, id, record))
            })
            .collect()
    }

    /// Insert `row` under `(entity, tenant, id)`, replacing the row already
    /// stored under that key.
    async fn write_row(&self, entity: &str, id: &str, row: &Record) -> Result<()> {
        sqlx::query(
            "INSERT INTO guardian_records (entity, tenant, id, data) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (entity, tenant, id) DO UPDATE SET data = excluded.data",
        )
        .bind(entity)
        .bind(tenant_key(row))
        .bind(id)
        .bind(serde_json::to_string(row)?)
        .execute(&self.pool)
        .await
        .map_err(storage_err("Failed to write record"))?;
        Ok(())
    }

    /// Overwrite the stored row at `rowid` in place.
    async fn rewrite_row(&self, rowid: i64, id: &str, row: &Record) -> Result<()> {
        sqlx::query("UPDATE guardian_records SET tenant = ?1, id = ?2, data = ?3 WHERE rowid = ?4")
            .bind(tenant_key(row))
            .bind(id)
            .bind(serde_json::to_string(row)?)
            .bind(rowid)
            .execute(&self.pool)
            .await
            .map_err(storage_err("Failed to rewrite record"))?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn select(&self, entity: &str, filter: &RecordFilter) -> Result<Vec<Record>> {
        Ok(self
            .matching_rows(entity, filter)
            .await?
            .into_iter()
            .map(|(_, _, record)| record)
            .collect())
    }

    async fn insert(&self, entity: &str, rows: Vec<Record>) -> Result<Vec<Record>> {
        let mut stored = Vec::with_capacity(rows.len());
        for mut row in rows {
            let id = ensure_id(&mut row);
            self.write_row(entity, &id, &row).await?;
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
        let mut stored = Vec::with_capacity(rows.len());
        for mut row in rows {
            let filter = conflict_filter(&row, conflict_keys).with_limit(1);
            let existing = self.matching_rows(entity, &filter).await?;
            match existing.into_iter().next() {
                Some((rowid, id, _)) => {
                    row.insert("id".to_string(), Value::String(id.clone()));
                    self.rewrite_row(rowid, &id, &row).await?;
                }
                None => {
                    let id = ensure_id(&mut row);
                    self.write_row(entity, &id, &row).await?;
                }
            }
            stored.push(row);
        }
        Ok(stored)
    }

    async fn update(&self, entity: &str, filter: &RecordFilter, patch: Record) -> Result<u64> {
        let mut updated = 0;
        for (rowid, id, mut row) in self.matching_rows(entity, filter).await? {
            for (key, value) in &patch {
                row.insert(key.clone(), value.clone());
            }
            self.rewrite_row(rowid, &id, &row).await?;
            updated += 1;
        }
        Ok(updated)
    }

    async fn delete(&self, entity: &str, filter: &RecordFilter) -> Result<u64> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM guardian_records WHERE entity = ");
        builder.push_bind(entity.to_string());
        Self::push_filter(&mut builder, filter)?;
        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(storage_err("Failed to delete records"))?;
        Ok(result.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

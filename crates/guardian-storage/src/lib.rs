//! Storage backends for Guardian
//!
//! Provides in-memory and SQLite implementations of the repository traits in
//! `guardian-core`, the admission counter stores, and the tenant isolation
//! layer that wraps every business-data access.

use guardian_core::{GuardianError, Result, Storage, StorageConfig};
use std::sync::Arc;

pub mod admission;
pub mod memory;
#[cfg(feature = "redis_backend")]
pub mod redis_admission;
pub mod scoped;
pub mod sqlite;

pub use admission::InMemoryAdmissionStore;
pub use memory::{
    InMemoryAlertRepository, InMemoryCredentialRepository, InMemoryRecordStore,
    InMemorySecurityLogRepository, InMemoryUsageRepository,
};
#[cfg(feature = "redis_backend")]
pub use redis_admission::RedisAdmissionStore;
pub use scoped::{current_tenant, with_tenant, ScopedRepository, ScopedStore, TenantScope};
pub use sqlite::{
    SqliteAlertRepository, SqliteCredentialRepository, SqliteRecordStore,
    SqliteSecurityLogRepository, SqliteUsageRepository,
};

/// Which repository family backs a [`Storage`] bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageProfile {
    /// Everything in process memory.
    Memory,
    /// SQLite file (or `:memory:`) through `sqlx`.
    Sqlite { database_path: String },
}

impl StorageProfile {
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        match config.profile.to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageProfile::Memory),
            "sqlite" => Ok(StorageProfile::Sqlite {
                database_path: config.database_path.clone(),
            }),
            other => Err(GuardianError::Config(format!(
                "unknown storage profile '{other}' (expected memory or sqlite)"
            ))),
        }
    }

    /// Build the repositories for this profile with an in-memory admission
    /// store.
    pub async fn build(&self) -> Result<Storage> {
        let admission = Arc::new(InMemoryAdmissionStore::new());
        match self {
            StorageProfile::Memory => Ok(Storage {
                usage: Arc::new(InMemoryUsageRepository::new()),
                alerts: Arc::new(InMemoryAlertRepository::new()),
                security_logs: Arc::new(InMemorySecurityLogRepository::new()),
                credentials: Arc::new(InMemoryCredentialRepository::new()),
                records: Arc::new(InMemoryRecordStore::new()),
                admission,
            }),
            StorageProfile::Sqlite { database_path } => {
                let pool = sqlite::connect(&sqlite_url(database_path)).await?;
                Ok(Storage {
                    usage: Arc::new(SqliteUsageRepository::from_pool(pool.clone())),
                    alerts: Arc::new(SqliteAlertRepository::from_pool(pool.clone())),
                    security_logs: Arc::new(SqliteSecurityLogRepository::from_pool(pool.clone())),
                    credentials: Arc::new(SqliteCredentialRepository::from_pool(pool.clone())),
                    records: Arc::new(SqliteRecordStore::from_pool(pool)),
                    admission,
                })
            }
        }
    }
}

fn sqlite_url(database_path: &str) -> String {
    if database_path == ":memory:" {
        "sqlite::memory:".to_string()
    } else if database_path.starts_with("sqlite:") {
        database_path.to_string()
    } else {
        format!("sqlite://{database_path}")
    }
}

/// Build the storage bundle described by `config`.
///
/// A configured `redis_url` swaps in the shared Redis admission store, which
/// needs the `redis_backend` feature.
pub async fn build_storage(config: &StorageConfig) -> Result<Storage> {
    let storage = StorageProfile::from_config(config)?.build().await?;
    match config.redis_url.as_deref() {
        None => Ok(storage),
        #[cfg(feature = "redis_backend")]
        Some(url) => {
            let admission = RedisAdmissionStore::new(url).await?;
            tracing::info!("admission counters shared through Redis");
            Ok(Storage {
                admission: Arc::new(admission),
                ..storage
            })
        }
        #[cfg(not(feature = "redis_backend"))]
        Some(_) => Err(GuardianError::Config(
            "storage.redis_url is set but guardian-storage was built without the redis_backend feature"
                .to_string(),
        )),
    }
}

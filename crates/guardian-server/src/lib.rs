//! Guardian runtime protection server: library interface.
//!
//! Exposes the application state, the guard middleware and the router so
//! integration tests and embedding services can build a Guardian
//! programmatically.

pub mod accounts;
pub mod admission;
pub mod alerts;
pub mod api;
pub mod auto_heal;
pub mod config;
pub mod csrf;
pub mod health;
pub mod health_alerts;
pub mod metrics;
pub mod middleware;
pub mod pricing;
pub mod quota;
pub mod security_log;
pub mod sessions;
pub mod shutdown;
pub mod state;
pub mod tasks;

/// Outcome of a write-behind flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub failed: usize,
}

// Re-export key types for convenience
pub use admission::AdmissionController;
pub use alerts::AlertDispatcher;
pub use api::{api_routes, build_router, with_guards};
pub use auto_heal::{AutoHealController, DegradedPolicy, Purgeable};
pub use csrf::CsrfGuard;
pub use health::HealthMonitor;
pub use health_alerts::HealthAlerter;
pub use quota::QuotaGovernor;
pub use security_log::{SecurityEvent, SecurityLogger};
pub use sessions::{AdminSession, AdminSessions};
pub use shutdown::ShutdownCoordinator;
pub use state::AppState;

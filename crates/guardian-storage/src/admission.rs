//! In-memory admission state.
//!
//! Counters live in a sharded [`DashMap`]; each `hit` holds only the shard
//! lock of its own `(identity, route class)` key for the read-modify-write,
//! so concurrent requests for one identity are strictly ordered while
//! unrelated identities never contend on a global lock.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::{DashMap, DashSet};
use guardian_core::{
    AdmissionStats, AdmissionStore, ClientIdentity, CounterEntry, CounterHit, Result, RouteClass,
    RouteLimit, RouteLimits,
};

#[derive(Debug, Clone, Copy)]
struct DailyViolations {
    day: NaiveDate,
    count: u32,
}

/// Process-local admission store. Correct for single-instance deployments.
#[derive(Default)]
pub struct InMemoryAdmissionStore {
    counters: DashMap<(ClientIdentity, RouteClass), CounterEntry>,
    violations: DashMap<ClientIdentity, DailyViolations>,
    blacklist: DashSet<ClientIdentity>,
}

impl InMemoryAdmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of counter entries currently tracked.
    pub fn tracked(&self) -> usize {
        self.counters.len()
    }
}

#[async_trait]
impl AdmissionStore for InMemoryAdmissionStore {
    async fn hit(
        &self,
        identity: &ClientIdentity,
        route_class: RouteClass,
        limit: &RouteLimit,
        now: DateTime<Utc>,
    ) -> Result<CounterHit> {
        let mut entry = self
            .counters
            .entry((identity.clone(), route_class))
            .or_insert_with(|| CounterEntry::new(now));
        let outcome = entry.hit(limit, now);
        Ok(CounterHit {
            outcome,
            remaining: entry.remaining(limit),
            blocked_until: entry.blocked_until,
        })
    }

    async fn record_violation(
        &self,
        identity: &ClientIdentity,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let today = now.date_naive();
        let mut entry = self
            .violations
            .entry(identity.clone())
            .or_insert(DailyViolations {
                day: today,
                count: 0,
            });
        if entry.day != today {
            entry.day = today;
            entry.count = 0;
        }
        entry.count += 1;
        Ok(entry.count)
    }

    async fn is_blacklisted(&self, identity: &ClientIdentity) -> Result<bool> {
        Ok(self.blacklist.contains(identity))
    }

    async fn blacklist(&self, identity: &ClientIdentity) -> Result<()> {
        self.blacklist.insert(identity.clone());
        Ok(())
    }

    async fn unblacklist(&self, identity: &ClientIdentity) -> Result<bool> {
        Ok(self.blacklist.remove(identity).is_some())
    }

    async fn blacklisted(&self) -> Result<Vec<ClientIdentity>> {
        let mut out: Vec<ClientIdentity> = self.blacklist.iter().map(|i| i.clone()).collect();
        out.sort();
        Ok(out)
    }

    async fn reset_identity(&self, identity: &ClientIdentity) -> Result<usize> {
        let mut removed = 0;
        for class in RouteClass::ALL {
            if self.counters.remove(&(identity.clone(), class)).is_some() {
                removed += 1;
            }
        }
        self.violations.remove(identity);
        Ok(removed)
    }

    async fn sweep(&self, limits: &RouteLimits, now: DateTime<Utc>) -> Result<usize> {
        let before = self.counters.len();
        self.counters
            .retain(|(_, class), entry| !entry.is_stale(limits.for_class(*class), now));
        let today = now.date_naive();
        self.violations.retain(|_, v| v.day == today);
        Ok(before.saturating_sub(self.counters.len()))
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<AdmissionStats> {
        let mut stats = AdmissionStats {
            blacklisted: self.blacklist.len(),
            ..Default::default()
        };
        for item in self.counters.iter() {
            stats.total_tracked += 1;
            if item.value().is_blocked(now) {
                stats.blocked += 1;
            }
            *stats.by_route_class.entry(item.key().1).or_default() += 1;
        }
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

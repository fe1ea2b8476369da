//! Durable storage of lease rows.
//!
//! The only shared mutable state in the system. Every implementation must make
//! [`LeaseStore::upsert_lease`] atomic with respect to other callers, including
//! callers in other processes: two racing first acquisitions of the EXCLUSIVE
//! lease on one `(resource, scope)` must never both succeed.

pub mod memory;
pub mod sqlite;

use crate::{
    error::Error,
    lease::{Lease, LeaseScope, LeaseType, ScopeSelector},
    time::Timestamp,
    PrincipalId, ResourceId, Result,
};
use async_trait::async_trait;
use chrono::Duration;
use std::{path::Path, sync::Arc};

/// Live leases on one `(resource, scope)`, partitioned by type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveLeases {
    pub exclusive: Option<Lease>,
    pub shared: Vec<Lease>,
}

impl ActiveLeases {
    pub fn from_rows(rows: impl IntoIterator<Item = Lease>) -> Self {
        let mut active = Self::default();
        for lease in rows {
            match lease.lease_type {
                LeaseType::Exclusive => {
                    // Newest wins if a broken store ever returned two.
                    if active
                        .exclusive
                        .as_ref()
                        .map_or(true, |current| current.acquired_at < lease.acquired_at)
                    {
                        active.exclusive = Some(lease);
                    }
                }
                LeaseType::Shared => active.shared.push(lease),
            }
        }
        active
    }

    pub fn shared_held_by(&self, principal: &PrincipalId) -> Option<&Lease> {
        self.shared.iter().find(|lease| lease.is_held_by(principal))
    }

    pub fn is_empty(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct UpsertRequest {
    pub resource: ResourceId,
    pub scope: LeaseScope,
    pub lease_type: LeaseType,
    pub holder: PrincipalId,
    pub ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted {
    pub lease: Lease,
    /// True when an existing row of the same holder was extended.
    pub renewed: bool,
}

#[async_trait]
pub trait LeaseStore: Send + Sync + std::fmt::Debug {
    /// Sweeps `(resource, scope)` then returns its live leases.
    async fn find_active(
        &self,
        resource: &ResourceId,
        scope: LeaseScope,
        now: Timestamp,
    ) -> Result<ActiveLeases>;

    /// Atomically: sweep, fail with [`Error::LeaseConflict`] if another
    /// holder's EXCLUSIVE lease is live, else extend this holder's live row of
    /// the same type or insert a new one.
    async fn upsert_lease(&self, request: UpsertRequest, now: Timestamp) -> Result<Upserted>;

    /// Tombstones the newest live row matching `(resource, scope, type)`,
    /// restricted to `holder` when given. `Ok(None)` when nothing matched.
    async fn deactivate(
        &self,
        resource: &ResourceId,
        scope: LeaseScope,
        lease_type: LeaseType,
        holder: Option<&PrincipalId>,
        now: Timestamp,
    ) -> Result<Option<Lease>>;

    /// Tombstones every active row past its expiry, table-wide.
    async fn sweep_expired(&self, now: Timestamp) -> Result<usize>;

    /// Tombstones every active row on `resource` matching the selector,
    /// regardless of holder unless `holder` is given.
    async fn force_release(
        &self,
        resource: &ResourceId,
        selector: ScopeSelector,
        holder: Option<&PrincipalId>,
    ) -> Result<usize>;

    /// Every row ever written for `resource`, active first then newest first.
    async fn history(&self, resource: &ResourceId) -> Result<Vec<Lease>>;
}

/// Opens the configured backend: SQLite when a path is given, otherwise the
/// in-process store.
pub fn open(database: Option<&Path>) -> Result<Arc<dyn LeaseStore>> {
    match database {
        Some(path) if path.as_os_str() != ":memory:" => {
            Ok(Arc::new(sqlite::SqliteLeaseStore::open(path)?))
        }
        _ => Ok(Arc::new(memory::InMemoryLeaseStore::new())),
    }
}

pub(crate) fn conflict_from(lease: &Lease) -> Error {
    Error::LeaseConflict {
        resource: lease.resource_id.clone(),
        scope: lease.scope,
        holder: lease.holder.clone(),
        acquired_at: lease.acquired_at,
        expires_at: lease.expires_at,
    }
}

pub(crate) fn sort_history(rows: &mut [Lease]) {
    rows.sort_by(|a, b| {
        b.is_active
            .cmp(&a.is_active)
            .then_with(|| b.acquired_at.cmp(&a.acquired_at))
    });
}

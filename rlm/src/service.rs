//! Acquire / release / status protocol over a [`LeaseStore`].
//!
//! Callers are expected to have resolved and authorised the principal for the
//! resource already; this layer only arbitrates contention. It keeps no state
//! of its own, so any number of service instances may front the same store.

use crate::{
    lease::{default_ttl, Lease, LeaseScope, LeaseType, ScopeSelector},
    store::{LeaseStore, UpsertRequest},
    time::{Clock, SystemClock, Timestamp},
    PrincipalId, ResourceId, Result,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acquired {
    pub acquired: bool,
    pub renewed: bool,
    pub expires_at: Timestamp,
    pub lease: Lease,
}

/// Outcome of a release. Neither variant is an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released(Lease),
    AlreadyReleased,
}

impl ReleaseOutcome {
    pub fn was_released(&self) -> bool {
        matches!(self, Self::Released(_))
    }
}

/// Derived view of a `(resource, scope)` for one principal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseStatus {
    pub has_exclusive_lock: bool,
    pub can_edit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder: Option<PrincipalId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquired_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Timestamp>,
    pub is_owned_by_current_user: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub own_shared_lease: Option<Lease>,
    #[serde(default)]
    pub shared_holders: usize,
}

impl LeaseStatus {
    /// What a caller should assume when the lease manager cannot be reached.
    pub fn unknown() -> Self {
        Self {
            can_edit: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySummary {
    pub total_locks: usize,
    pub active_locks: usize,
    pub exclusive_locks: usize,
    pub shared_locks: usize,
    pub expired_locks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseHistory {
    pub resource_id: ResourceId,
    pub all_locks: Vec<Lease>,
    pub user_locks: Vec<Lease>,
    pub summary: HistorySummary,
}

#[derive(Debug, Clone)]
pub struct LeaseService {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl LeaseService {
    pub fn new(store: Arc<dyn LeaseStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            ttl: default_ttl(),
        }
    }

    pub fn with_system_clock(store: Arc<dyn LeaseStore>) -> Self {
        Self::new(store, Arc::new(SystemClock))
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub async fn acquire(
        &self,
        resource: &ResourceId,
        scope: LeaseScope,
        lease_type: LeaseType,
        principal: &PrincipalId,
    ) -> Result<Acquired> {
        let request = UpsertRequest {
            resource: resource.clone(),
            scope,
            lease_type,
            holder: principal.clone(),
            ttl: self.ttl,
        };

        match self.store.upsert_lease(request, self.clock.now()).await {
            Ok(upserted) => {
                if upserted.renewed {
                    debug!(
                        "Renewed {} lease on {}/{} for {}",
                        lease_type, resource, scope, principal
                    );
                } else {
                    info!(
                        "Acquired {} lease on {}/{} for {}",
                        lease_type, resource, scope, principal
                    );
                }
                Ok(Acquired {
                    acquired: true,
                    renewed: upserted.renewed,
                    expires_at: upserted.lease.expires_at,
                    lease: upserted.lease,
                })
            }
            Err(e) => {
                if e.is_conflict() {
                    info!("{} lease on {}/{} refused for {}: {}", lease_type, resource, scope, principal, e);
                }
                Err(e)
            }
        }
    }

    /// Creates or renews the caller's EXCLUSIVE lease. Existing SHARED leases
    /// stay active but lose edit rights.
    pub async fn acquire_exclusive(
        &self,
        resource: &ResourceId,
        scope: LeaseScope,
        principal: &PrincipalId,
    ) -> Result<Acquired> {
        self.acquire(resource, scope, LeaseType::Exclusive, principal).await
    }

    pub async fn acquire_shared(
        &self,
        resource: &ResourceId,
        scope: LeaseScope,
        principal: &PrincipalId,
    ) -> Result<Acquired> {
        self.acquire(resource, scope, LeaseType::Shared, principal).await
    }

    /// Releases the caller's own live lease of `lease_type`.
    pub async fn release(
        &self,
        resource: &ResourceId,
        scope: LeaseScope,
        lease_type: LeaseType,
        principal: &PrincipalId,
    ) -> Result<ReleaseOutcome> {
        let released = self
            .store
            .deactivate(resource, scope, lease_type, Some(principal), self.clock.now())
            .await?;

        Ok(match released {
            Some(lease) => {
                info!("Released {} lease {} on {}/{}", lease_type, lease.id, resource, scope);
                ReleaseOutcome::Released(lease)
            }
            None => {
                debug!(
                    "No active {} lease on {}/{} for {} to release",
                    lease_type, resource, scope, principal
                );
                ReleaseOutcome::AlreadyReleased
            }
        })
    }

    pub async fn status(
        &self,
        resource: &ResourceId,
        scope: LeaseScope,
        principal: &PrincipalId,
    ) -> Result<LeaseStatus> {
        let active = self
            .store
            .find_active(resource, scope, self.clock.now())
            .await?;
        let own_shared_lease = active.shared_held_by(principal).cloned();
        let shared_holders = active.shared.len();

        Ok(match active.exclusive {
            Some(exclusive) => {
                let owned = exclusive.is_held_by(principal);
                LeaseStatus {
                    has_exclusive_lock: true,
                    can_edit: owned,
                    holder: Some(exclusive.holder),
                    acquired_at: Some(exclusive.acquired_at),
                    expires_at: Some(exclusive.expires_at),
                    is_owned_by_current_user: owned,
                    own_shared_lease,
                    shared_holders,
                }
            }
            None => LeaseStatus {
                has_exclusive_lock: false,
                can_edit: true,
                holder: None,
                acquired_at: None,
                expires_at: None,
                is_owned_by_current_user: own_shared_lease.is_some(),
                own_shared_lease,
                shared_holders,
            },
        })
    }

    /// Administrative override: tombstones every live lease on the resource
    /// matching the selector, whoever holds it.
    pub async fn force_release(&self, resource: &ResourceId, selector: ScopeSelector) -> Result<usize> {
        let count = self.store.force_release(resource, selector, None).await?;
        warn!("Force released {} leases on {} ({:?})", count, resource, selector);
        Ok(count)
    }

    /// Drops every live lease the principal holds on the resource.
    pub async fn force_release_own(
        &self,
        resource: &ResourceId,
        selector: ScopeSelector,
        principal: &PrincipalId,
    ) -> Result<usize> {
        let count = self
            .store
            .force_release(resource, selector, Some(principal))
            .await?;
        info!("Force released {} leases of {} on {}", count, principal, resource);
        Ok(count)
    }

    pub async fn history(&self, resource: &ResourceId, principal: &PrincipalId) -> Result<LeaseHistory> {
        let now = self.clock.now();
        let all_locks = self.store.history(resource).await?;
        let user_locks: Vec<Lease> = all_locks
            .iter()
            .filter(|lease| lease.is_held_by(principal))
            .cloned()
            .collect();

        let live = |lease: &&Lease| lease.is_live(now);
        let summary = HistorySummary {
            total_locks: all_locks.len(),
            active_locks: all_locks.iter().filter(live).count(),
            exclusive_locks: all_locks
                .iter()
                .filter(live)
                .filter(|lease| lease.lease_type == LeaseType::Exclusive)
                .count(),
            shared_locks: all_locks
                .iter()
                .filter(live)
                .filter(|lease| lease.lease_type == LeaseType::Shared)
                .count(),
            expired_locks: all_locks.iter().filter(|lease| lease.is_expired(now)).count(),
        };

        Ok(LeaseHistory {
            resource_id: resource.clone(),
            all_locks,
            user_locks,
            summary,
        })
    }
}

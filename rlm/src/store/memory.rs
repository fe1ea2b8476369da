use super::{conflict_from, sort_history, ActiveLeases, LeaseStore, UpsertRequest, Upserted};
use crate::{
    lease::{Lease, LeaseScope, LeaseType, ScopeSelector},
    sweep::sweep_rows,
    time::Timestamp,
    PrincipalId, ResourceId, Result,
};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

type Partition = (ResourceId, LeaseScope);

/// Single-process lease table.
///
/// Rows are partitioned by `(resource, scope)`; every mutation runs under the
/// partition's entry guard, which is what makes check-then-insert atomic here.
/// Only correct when all handlers share this one instance.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    partitions: DashMap<Partition, Vec<Lease>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn find_active(
        &self,
        resource: &ResourceId,
        scope: LeaseScope,
        now: Timestamp,
    ) -> Result<ActiveLeases> {
        let Some(mut rows) = self.partitions.get_mut(&(resource.clone(), scope)) else {
            return Ok(ActiveLeases::default());
        };
        sweep_rows(rows.iter_mut(), now);
        Ok(ActiveLeases::from_rows(
            rows.iter().filter(|lease| lease.is_active).cloned(),
        ))
    }

    async fn upsert_lease(&self, request: UpsertRequest, now: Timestamp) -> Result<Upserted> {
        let mut rows = self
            .partitions
            .entry((request.resource.clone(), request.scope))
            .or_default();
        sweep_rows(rows.iter_mut(), now);

        if let Some(blocking) = rows.iter().find(|lease| {
            lease.is_active
                && lease.lease_type == LeaseType::Exclusive
                && !lease.is_held_by(&request.holder)
        }) {
            return Err(conflict_from(blocking));
        }

        if let Some(existing) = rows.iter_mut().find(|lease| {
            lease.is_active
                && lease.lease_type == request.lease_type
                && lease.is_held_by(&request.holder)
        }) {
            existing.renew(now, request.ttl);
            debug!("Renewed {} lease {}", existing.lease_type, existing.id);
            return Ok(Upserted {
                lease: existing.clone(),
                renewed: true,
            });
        }

        let lease = Lease::new(
            request.resource,
            request.scope,
            request.lease_type,
            request.holder,
            now,
            request.ttl,
        );
        rows.push(lease.clone());
        Ok(Upserted {
            lease,
            renewed: false,
        })
    }

    async fn deactivate(
        &self,
        resource: &ResourceId,
        scope: LeaseScope,
        lease_type: LeaseType,
        holder: Option<&PrincipalId>,
        now: Timestamp,
    ) -> Result<Option<Lease>> {
        let Some(mut rows) = self.partitions.get_mut(&(resource.clone(), scope)) else {
            return Ok(None);
        };
        sweep_rows(rows.iter_mut(), now);

        let newest = rows
            .iter_mut()
            .filter(|lease| {
                lease.is_active
                    && lease.lease_type == lease_type
                    && holder.map_or(true, |h| lease.is_held_by(h))
            })
            .max_by_key(|lease| lease.acquired_at);

        Ok(newest.map(|lease| {
            lease.is_active = false;
            lease.clone()
        }))
    }

    async fn sweep_expired(&self, now: Timestamp) -> Result<usize> {
        Ok(self
            .partitions
            .iter_mut()
            .map(|mut entry| sweep_rows(entry.value_mut().iter_mut(), now))
            .sum())
    }

    async fn force_release(
        &self,
        resource: &ResourceId,
        selector: ScopeSelector,
        holder: Option<&PrincipalId>,
    ) -> Result<usize> {
        let mut released = 0;
        for mut entry in self.partitions.iter_mut() {
            let (row_resource, row_scope) = entry.key().clone();
            if &row_resource != resource || !selector.matches(row_scope) {
                continue;
            }
            for lease in entry.value_mut().iter_mut() {
                if lease.is_active && holder.map_or(true, |h| lease.is_held_by(h)) {
                    lease.is_active = false;
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    async fn history(&self, resource: &ResourceId) -> Result<Vec<Lease>> {
        let mut rows: Vec<Lease> = self
            .partitions
            .iter()
            .filter(|entry| &entry.key().0 == resource)
            .flat_map(|entry| entry.value().clone())
            .collect();
        sort_history(&mut rows);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::Error, lease::default_ttl};
    use chrono::{Duration, Utc};

    fn request(lease_type: LeaseType, holder: &str) -> UpsertRequest {
        UpsertRequest {
            resource: ResourceId::from("u1"),
            scope: LeaseScope::Assess,
            lease_type,
            holder: PrincipalId::from(holder),
            ttl: default_ttl(),
        }
    }

    #[tokio::test]
    async fn test_upsert_renews_same_row() {
        let store = InMemoryLeaseStore::new();
        let t0 = Utc::now();

        let first = store
            .upsert_lease(request(LeaseType::Exclusive, "alice"), t0)
            .await
            .unwrap();
        assert!(!first.renewed);

        let second = store
            .upsert_lease(request(LeaseType::Exclusive, "alice"), t0 + Duration::minutes(5))
            .await
            .unwrap();
        assert!(second.renewed);
        assert_eq!(second.lease.id, first.lease.id);
        assert_eq!(second.lease.expires_at, t0 + Duration::minutes(35));
        assert_eq!(store.history(&ResourceId::from("u1")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_conflict_reports_stored_row() {
        let store = InMemoryLeaseStore::new();
        let t0 = Utc::now();
        let held = store
            .upsert_lease(request(LeaseType::Exclusive, "alice"), t0)
            .await
            .unwrap()
            .lease;

        let err = store
            .upsert_lease(request(LeaseType::Shared, "bob"), t0)
            .await
            .unwrap_err();
        match err {
            Error::LeaseConflict {
                holder, expires_at, ..
            } => {
                assert_eq!(holder, held.holder);
                assert_eq!(expires_at, held.expires_at);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deactivate_filters_by_holder() {
        let store = InMemoryLeaseStore::new();
        let t0 = Utc::now();
        let resource = ResourceId::from("u1");
        store
            .upsert_lease(request(LeaseType::Shared, "bob"), t0)
            .await
            .unwrap();

        let carol = PrincipalId::from("carol");
        let none = store
            .deactivate(&resource, LeaseScope::Assess, LeaseType::Shared, Some(&carol), t0)
            .await
            .unwrap();
        assert!(none.is_none());

        let any = store
            .deactivate(&resource, LeaseScope::Assess, LeaseType::Shared, None, t0)
            .await
            .unwrap();
        assert_eq!(any.unwrap().holder.as_str(), "bob");
    }

    #[tokio::test]
    async fn test_force_release_respects_selector() {
        let store = InMemoryLeaseStore::new();
        let t0 = Utc::now();
        let resource = ResourceId::from("u1");
        store
            .upsert_lease(request(LeaseType::Exclusive, "alice"), t0)
            .await
            .unwrap();
        let mut edit = request(LeaseType::Shared, "bob");
        edit.scope = LeaseScope::Edit;
        store.upsert_lease(edit, t0).await.unwrap();

        let edit_only = store
            .force_release(&resource, ScopeSelector::Scope(LeaseScope::Edit), None)
            .await
            .unwrap();
        assert_eq!(edit_only, 1);

        let rest = store
            .force_release(&resource, ScopeSelector::All, None)
            .await
            .unwrap();
        assert_eq!(rest, 1);
    }
}

//! SQLite-backed lease table.
//!
//! Several server processes may open the same database file. Mutual exclusion
//! of EXCLUSIVE leases is enforced by the partial unique index
//! `leases_one_live_exclusive`; writes additionally run in `BEGIN IMMEDIATE`
//! transactions so the conflict check and the insert see the same snapshot.
//! A unique-constraint violation on insert is reported as a conflict, never as
//! a storage failure.

use super::{conflict_from, ActiveLeases, LeaseStore, UpsertRequest, Upserted};
use crate::{
    error::Error,
    lease::{Lease, LeaseId, LeaseScope, LeaseType, ScopeSelector},
    time::{from_millis, to_millis, Timestamp},
    PrincipalId, ResourceId, Result,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{
    params, types::Type, Connection, ErrorCode, OptionalExtension, Row, Transaction,
    TransactionBehavior,
};
use std::{path::Path, sync::Arc, time::Duration};
use tracing::{debug, info};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS leases (
    id          TEXT PRIMARY KEY,
    resource_id TEXT NOT NULL,
    scope       TEXT NOT NULL,
    lease_type  TEXT NOT NULL CHECK (lease_type IN ('SHARED', 'EXCLUSIVE')),
    holder      TEXT NOT NULL,
    acquired_at INTEGER NOT NULL,
    expires_at  INTEGER NOT NULL,
    is_active   INTEGER NOT NULL DEFAULT 1
);
CREATE UNIQUE INDEX IF NOT EXISTS leases_one_live_exclusive
    ON leases (resource_id, scope)
    WHERE lease_type = 'EXCLUSIVE' AND is_active = 1;
CREATE UNIQUE INDEX IF NOT EXISTS leases_one_live_shared_per_holder
    ON leases (resource_id, scope, holder)
    WHERE lease_type = 'SHARED' AND is_active = 1;
CREATE INDEX IF NOT EXISTS leases_by_partition
    ON leases (resource_id, scope, is_active);
";

const COLUMNS: &str =
    "id, resource_id, scope, lease_type, holder, acquired_at, expires_at, is_active";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SqliteLeaseStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLeaseStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("SQLite journal mode {}", mode);
        conn.execute_batch(SCHEMA)?;
        info!("Opened lease database at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs blocking SQLite work off the async executor.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await?
    }
}

fn parse_column<T, E>(
    row: &Row<'_>,
    idx: usize,
    parse: impl FnOnce(&str) -> std::result::Result<T, E>,
) -> rusqlite::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    parse(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_lease(row: &Row<'_>) -> rusqlite::Result<Lease> {
    Ok(Lease {
        id: LeaseId(parse_column(row, 0, uuid::Uuid::parse_str)?),
        resource_id: ResourceId(row.get(1)?),
        scope: parse_column(row, 2, str::parse::<LeaseScope>)?,
        lease_type: parse_column(row, 3, str::parse::<LeaseType>)?,
        holder: PrincipalId(row.get(4)?),
        acquired_at: from_millis(row.get(5)?),
        expires_at: from_millis(row.get(6)?),
        is_active: row.get(7)?,
    })
}

fn sweep_partition(
    tx: &Transaction<'_>,
    resource: &ResourceId,
    scope: LeaseScope,
    now: i64,
) -> rusqlite::Result<usize> {
    tx.execute(
        "UPDATE leases SET is_active = 0
         WHERE resource_id = ?1 AND scope = ?2 AND is_active = 1 AND expires_at < ?3",
        params![resource.as_str(), scope.as_str(), now],
    )
}

fn live_rows(
    tx: &Transaction<'_>,
    resource: &ResourceId,
    scope: LeaseScope,
) -> rusqlite::Result<Vec<Lease>> {
    let mut stmt = tx.prepare(&format!(
        "SELECT {COLUMNS} FROM leases
         WHERE resource_id = ?1 AND scope = ?2 AND is_active = 1
         ORDER BY acquired_at DESC"
    ))?;
    let rows = stmt.query_map(params![resource.as_str(), scope.as_str()], row_to_lease)?;
    rows.collect()
}

fn live_exclusive(
    tx: &Transaction<'_>,
    resource: &ResourceId,
    scope: LeaseScope,
) -> rusqlite::Result<Option<Lease>> {
    tx.query_row(
        &format!(
            "SELECT {COLUMNS} FROM leases
             WHERE resource_id = ?1 AND scope = ?2 AND lease_type = 'EXCLUSIVE' AND is_active = 1"
        ),
        params![resource.as_str(), scope.as_str()],
        row_to_lease,
    )
    .optional()
}

/// Extends this holder's live row of the requested type, if there is one.
fn renew_own(
    tx: &Transaction<'_>,
    request: &UpsertRequest,
    expires_at: i64,
) -> rusqlite::Result<Option<Lease>> {
    tx.query_row(
        &format!(
            "UPDATE leases SET expires_at = ?1
             WHERE resource_id = ?2 AND scope = ?3 AND lease_type = ?4 AND holder = ?5 AND is_active = 1
             RETURNING {COLUMNS}"
        ),
        params![
            expires_at,
            request.resource.as_str(),
            request.scope.as_str(),
            request.lease_type.as_str(),
            request.holder.as_str()
        ],
        row_to_lease,
    )
    .optional()
}

fn insert(tx: &Transaction<'_>, lease: &Lease) -> rusqlite::Result<usize> {
    tx.execute(
        &format!("INSERT INTO leases ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
        params![
            lease.id.0.to_string(),
            lease.resource_id.as_str(),
            lease.scope.as_str(),
            lease.lease_type.as_str(),
            lease.holder.as_str(),
            to_millis(lease.acquired_at),
            to_millis(lease.expires_at),
            lease.is_active
        ],
    )
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

fn upsert(conn: &mut Connection, request: UpsertRequest, now: Timestamp) -> Result<Upserted> {
    // Stored precision is milliseconds; keep returned rows identical to stored ones.
    let now = from_millis(to_millis(now));
    let now_ms = to_millis(now);
    let expires_ms = to_millis(now + request.ttl);

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    sweep_partition(&tx, &request.resource, request.scope, now_ms)?;

    if let Some(blocking) = live_exclusive(&tx, &request.resource, request.scope)? {
        if !blocking.is_held_by(&request.holder) {
            tx.commit()?;
            return Err(conflict_from(&blocking));
        }
    }

    if let Some(lease) = renew_own(&tx, &request, expires_ms)? {
        tx.commit()?;
        return Ok(Upserted {
            lease,
            renewed: true,
        });
    }

    let lease = Lease::new(
        request.resource.clone(),
        request.scope,
        request.lease_type,
        request.holder.clone(),
        now,
        request.ttl,
    );
    insert_or_conflict(&tx, &request, &lease)?;
    tx.commit()?;
    Ok(Upserted {
        lease,
        renewed: false,
    })
}

/// Inserts `lease`. A unique-index rejection means another writer committed
/// a live row first; it is reported as a conflict naming that row.
fn insert_or_conflict(tx: &Transaction<'_>, request: &UpsertRequest, lease: &Lease) -> Result<()> {
    match insert(tx, lease) {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => {
            debug!("Unique constraint rejected insert for {}/{}", request.resource, request.scope);
            match live_exclusive(tx, &request.resource, request.scope)? {
                Some(winner) if !winner.is_held_by(&request.holder) => Err(conflict_from(&winner)),
                _ => Err(Error::StoreUnavailable(
                    "lease row changed concurrently, retry".to_string(),
                )),
            }
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn find_active(
        &self,
        resource: &ResourceId,
        scope: LeaseScope,
        now: Timestamp,
    ) -> Result<ActiveLeases> {
        let resource = resource.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            sweep_partition(&tx, &resource, scope, to_millis(now))?;
            let rows = live_rows(&tx, &resource, scope)?;
            tx.commit()?;
            Ok(ActiveLeases::from_rows(rows))
        })
        .await
    }

    async fn upsert_lease(&self, request: UpsertRequest, now: Timestamp) -> Result<Upserted> {
        self.with_conn(move |conn| upsert(conn, request, now)).await
    }

    async fn deactivate(
        &self,
        resource: &ResourceId,
        scope: LeaseScope,
        lease_type: LeaseType,
        holder: Option<&PrincipalId>,
        now: Timestamp,
    ) -> Result<Option<Lease>> {
        let resource = resource.clone();
        let holder = holder.cloned();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            sweep_partition(&tx, &resource, scope, to_millis(now))?;
            let released = tx
                .query_row(
                    &format!(
                        "UPDATE leases SET is_active = 0
                         WHERE id = (
                             SELECT id FROM leases
                             WHERE resource_id = ?1 AND scope = ?2 AND lease_type = ?3
                               AND is_active = 1 AND (?4 IS NULL OR holder = ?4)
                             ORDER BY acquired_at DESC LIMIT 1
                         )
                         RETURNING {COLUMNS}"
                    ),
                    params![
                        resource.as_str(),
                        scope.as_str(),
                        lease_type.as_str(),
                        holder.as_ref().map(PrincipalId::as_str)
                    ],
                    row_to_lease,
                )
                .optional()?;
            tx.commit()?;
            Ok(released)
        })
        .await
    }

    async fn sweep_expired(&self, now: Timestamp) -> Result<usize> {
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "UPDATE leases SET is_active = 0 WHERE is_active = 1 AND expires_at < ?1",
                params![to_millis(now)],
            )?)
        })
        .await
    }

    async fn force_release(
        &self,
        resource: &ResourceId,
        selector: ScopeSelector,
        holder: Option<&PrincipalId>,
    ) -> Result<usize> {
        let resource = resource.clone();
        let holder = holder.cloned();
        let scope = match selector {
            ScopeSelector::All => None,
            ScopeSelector::Scope(scope) => Some(scope.as_str()),
        };
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "UPDATE leases SET is_active = 0
                 WHERE resource_id = ?1 AND is_active = 1
                   AND (?2 IS NULL OR scope = ?2)
                   AND (?3 IS NULL OR holder = ?3)",
                params![resource.as_str(), scope, holder.as_ref().map(PrincipalId::as_str)],
            )?)
        })
        .await
    }

    async fn history(&self, resource: &ResourceId) -> Result<Vec<Lease>> {
        let resource = resource.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM leases WHERE resource_id = ?1
                 ORDER BY is_active DESC, acquired_at DESC"
            ))?;
            let rows = stmt.query_map(params![resource.as_str()], row_to_lease)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

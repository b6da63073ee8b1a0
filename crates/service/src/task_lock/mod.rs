// Scheduled-task locks.
//
// Each periodic job (dialer, synchronizer) runs on at most one replica at a
// time. The replica holding an unexpired lease for the task name runs it;
// everyone else skips the tick. Leases are persisted in Postgres so that
// replicas coordinate; the memory backend covers single-node runs and tests.

mod memory;

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::chrono_delta;

pub use memory::MemoryTaskLocks;

/// Default lease duration.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// A lease on one scheduled task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLease {
    pub task_name: String,
    /// Replica that holds the lease.
    pub holder_id: Uuid,
    /// Unique lease identifier (for renew).
    pub lease_id: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TaskLease {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Result of a lease acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireResult {
    /// Lease granted.
    Granted { lease_id: Uuid },
    /// Another replica holds an unexpired lease.
    Denied { current_holder: Uuid },
    /// Caller already held the lease; its expiry was extended.
    Renewed { lease_id: Uuid },
}

impl AcquireResult {
    pub fn lease_id(&self) -> Option<Uuid> {
        match self {
            Self::Granted { lease_id } | Self::Renewed { lease_id } => Some(*lease_id),
            Self::Denied { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewResult {
    Renewed,
    /// Lease not found or expired.
    NotFound,
    /// Lease belongs to someone else.
    WrongHolder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseResult {
    Released,
    NotFound,
    WrongHolder,
}

#[derive(Clone)]
pub enum TaskLockManager {
    Postgres { pool: PgPool, ttl: Duration },
    Memory { locks: MemoryTaskLocks, ttl: Duration },
}

impl TaskLockManager {
    pub fn postgres(pool: PgPool, ttl: Duration) -> Self {
        Self::Postgres { pool, ttl }
    }

    pub fn memory(ttl: Duration) -> Self {
        Self::Memory { locks: MemoryTaskLocks::default(), ttl }
    }

    pub fn ttl(&self) -> Duration {
        match self {
            Self::Postgres { ttl, .. } | Self::Memory { ttl, .. } => *ttl,
        }
    }

    /// Try to take the lease for `task_name`.
    ///
    /// - No active lease: grants a new one.
    /// - Caller already holds it: extends it.
    /// - Another holder has an active lease: denies.
    pub async fn acquire(
        &self,
        task_name: &str,
        holder_id: Uuid,
    ) -> Result<AcquireResult, sqlx::Error> {
        let now = Utc::now();
        match self {
            Self::Postgres { pool, ttl } => {
                acquire_pg(pool, task_name, holder_id, now, now + chrono_delta(*ttl)).await
            }
            Self::Memory { locks, ttl } => {
                Ok(locks.acquire_at(task_name, holder_id, now, now + chrono_delta(*ttl)))
            }
        }
    }

    /// Extend a lease the caller holds.
    pub async fn renew(
        &self,
        task_name: &str,
        holder_id: Uuid,
        lease_id: Uuid,
    ) -> Result<RenewResult, sqlx::Error> {
        let now = Utc::now();
        match self {
            Self::Postgres { pool, ttl } => {
                renew_pg(pool, task_name, holder_id, lease_id, now, now + chrono_delta(*ttl)).await
            }
            Self::Memory { locks, .. } if locks.take_renew_failure() => Err(sqlx::Error::PoolTimedOut),
            Self::Memory { locks, ttl } => Ok(locks.renew_at(
                task_name,
                holder_id,
                lease_id,
                now,
                now + chrono_delta(*ttl),
            )),
        }
    }

    /// Give up a lease (replica shutting down).
    pub async fn release(
        &self,
        task_name: &str,
        holder_id: Uuid,
    ) -> Result<ReleaseResult, sqlx::Error> {
        let now = Utc::now();
        match self {
            Self::Postgres { pool, .. } => release_pg(pool, task_name, holder_id, now).await,
            Self::Memory { locks, .. } => Ok(locks.release_at(task_name, holder_id, now)),
        }
    }

    /// The active lease for `task_name`, if any.
    pub async fn current(&self, task_name: &str) -> Result<Option<TaskLease>, sqlx::Error> {
        let now = Utc::now();
        match self {
            Self::Postgres { pool, .. } => current_pg(pool, task_name, now).await,
            Self::Memory { locks, .. } => Ok(locks.current_at(task_name, now)),
        }
    }
}

async fn acquire_pg(
    pool: &PgPool,
    task_name: &str,
    holder_id: Uuid,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<AcquireResult, sqlx::Error> {
    let proposed_lease_id = Uuid::new_v4();

    let (current_holder, lease_id) = sqlx::query_as::<_, (Uuid, Uuid)>(
        r#"
INSERT INTO task_locks (task_name, holder_id, lease_id, acquired_at, expires_at)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (task_name) DO UPDATE
SET holder_id = CASE
        WHEN task_locks.expires_at <= $4 THEN EXCLUDED.holder_id
        ELSE task_locks.holder_id
    END,
    lease_id = CASE
        WHEN task_locks.expires_at <= $4 THEN EXCLUDED.lease_id
        ELSE task_locks.lease_id
    END,
    acquired_at = CASE
        WHEN task_locks.expires_at <= $4 THEN EXCLUDED.acquired_at
        ELSE task_locks.acquired_at
    END,
    expires_at = CASE
        WHEN task_locks.expires_at <= $4
            OR task_locks.holder_id = EXCLUDED.holder_id
            THEN EXCLUDED.expires_at
        ELSE task_locks.expires_at
    END
RETURNING holder_id, lease_id
        "#,
    )
    .bind(task_name)
    .bind(holder_id)
    .bind(proposed_lease_id)
    .bind(now)
    .bind(expires_at)
    .fetch_one(pool)
    .await?;

    if current_holder != holder_id {
        return Ok(AcquireResult::Denied { current_holder });
    }

    if lease_id == proposed_lease_id {
        Ok(AcquireResult::Granted { lease_id })
    } else {
        Ok(AcquireResult::Renewed { lease_id })
    }
}

async fn active_holder_pg(
    pool: &PgPool,
    task_name: &str,
    now: DateTime<Utc>,
) -> Result<Option<Uuid>, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>(
        r#"
SELECT holder_id
FROM task_locks
WHERE task_name = $1
  AND expires_at > $2
        "#,
    )
    .bind(task_name)
    .bind(now)
    .fetch_optional(pool)
    .await
}

async fn renew_pg(
    pool: &PgPool,
    task_name: &str,
    holder_id: Uuid,
    lease_id: Uuid,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<RenewResult, sqlx::Error> {
    let updated = sqlx::query(
        r#"
UPDATE task_locks
SET expires_at = $4
WHERE task_name = $1
  AND holder_id = $2
  AND lease_id = $3
  AND expires_at > $5
        "#,
    )
    .bind(task_name)
    .bind(holder_id)
    .bind(lease_id)
    .bind(expires_at)
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();

    if updated == 1 {
        return Ok(RenewResult::Renewed);
    }

    Ok(match active_holder_pg(pool, task_name, now).await? {
        Some(_) => RenewResult::WrongHolder,
        None => RenewResult::NotFound,
    })
}

async fn release_pg(
    pool: &PgPool,
    task_name: &str,
    holder_id: Uuid,
    now: DateTime<Utc>,
) -> Result<ReleaseResult, sqlx::Error> {
    let deleted = sqlx::query(
        r#"
DELETE FROM task_locks
WHERE task_name = $1
  AND holder_id = $2
  AND expires_at > $3
        "#,
    )
    .bind(task_name)
    .bind(holder_id)
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();

    if deleted == 1 {
        return Ok(ReleaseResult::Released);
    }

    Ok(match active_holder_pg(pool, task_name, now).await? {
        Some(_) => ReleaseResult::WrongHolder,
        None => ReleaseResult::NotFound,
    })
}

async fn current_pg(
    pool: &PgPool,
    task_name: &str,
    now: DateTime<Utc>,
) -> Result<Option<TaskLease>, sqlx::Error> {
    let row = sqlx::query_as::<_, (String, Uuid, Uuid, DateTime<Utc>, DateTime<Utc>)>(
        r#"
SELECT task_name, holder_id, lease_id, acquired_at, expires_at
FROM task_locks
WHERE task_name = $1
  AND expires_at > $2
        "#,
    )
    .bind(task_name)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(task_name, holder_id, lease_id, acquired_at, expires_at)| TaskLease {
        task_name,
        holder_id,
        lease_id,
        acquired_at,
        expires_at,
    }))
}

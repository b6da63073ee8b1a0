// Call-state store: the persistent, transactional table of call membership.
//
// All access goes through a `CallStateTx` obtained from `CallStateStore::begin`.
// A transaction is applied atomically by `commit`; dropping it without
// committing discards every change. The store is pure data access: it does
// not enforce status overridability, callers do that before writing.

pub mod memory;
mod postgres;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use callsync_common::types::{CallKey, CallOwner, CallStateRecord, CallStatus, ChatId, UserId};

pub use memory::MemoryCallStateStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("call-state database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid call-state row: {0}")]
    InvalidRow(String),
    #[error("call-state store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Offset-based page over an ordered listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Page {
    pub const fn first(limit: usize) -> Self {
        Self { limit, offset: 0 }
    }

    /// The page after this one, given how many rows of this page are still
    /// part of the listing (rows deleted or moved out of it shift the offset).
    pub const fn advance(self, retained: usize) -> Self {
        Self { limit: self.limit, offset: self.offset + retained }
    }
}

#[derive(Clone)]
pub enum CallStateStore {
    Postgres(PgPool),
    Memory(MemoryCallStateStore),
}

impl CallStateStore {
    pub fn memory() -> Self {
        Self::Memory(MemoryCallStateStore::default())
    }

    pub async fn begin(&self) -> StoreResult<CallStateTx> {
        match self {
            Self::Postgres(pool) => Ok(CallStateTx::Postgres(pool.begin().await?)),
            Self::Memory(store) => Ok(CallStateTx::Memory(store.begin().await)),
        }
    }

    /// Single-row read in its own short transaction.
    pub async fn get(&self, key: CallKey) -> StoreResult<Option<CallStateRecord>> {
        let mut tx = self.begin().await?;
        let record = tx.get(key).await?;
        tx.commit().await?;
        Ok(record)
    }

    pub async fn status(&self, key: CallKey) -> StoreResult<CallStatus> {
        Ok(self.get(key).await?.map_or(CallStatus::NotFound, |record| record.status))
    }
}

pub enum CallStateTx {
    Postgres(Transaction<'static, Postgres>),
    Memory(memory::MemoryTx),
}

impl CallStateTx {
    /// Insert-or-replace by primary key.
    pub async fn upsert(&mut self, record: &CallStateRecord) -> StoreResult<()> {
        match self {
            Self::Postgres(tx) => postgres::upsert(&mut **tx, record).await,
            Self::Memory(tx) => {
                tx.upsert(record);
                Ok(())
            }
        }
    }

    /// Never errors on absence.
    pub async fn get(&mut self, key: CallKey) -> StoreResult<Option<CallStateRecord>> {
        match self {
            Self::Postgres(tx) => postgres::get(&mut **tx, key).await,
            Self::Memory(tx) => Ok(tx.get(key)),
        }
    }

    /// Status of `key`, or `NotFound` when there is no row.
    pub async fn status(&mut self, key: CallKey) -> StoreResult<CallStatus> {
        Ok(self.get(key).await?.map_or(CallStatus::NotFound, |record| record.status))
    }

    pub async fn list_by_user(&mut self, user_id: UserId) -> StoreResult<Vec<CallStateRecord>> {
        match self {
            Self::Postgres(tx) => postgres::list_by_user(&mut **tx, user_id).await,
            Self::Memory(tx) => Ok(tx.list_by_user(user_id)),
        }
    }

    pub async fn list_by_chat_and_status(
        &mut self,
        chat_id: ChatId,
        status: CallStatus,
    ) -> StoreResult<Vec<CallStateRecord>> {
        match self {
            Self::Postgres(tx) => postgres::list_by_chat_and_status(&mut **tx, chat_id, status).await,
            Self::Memory(tx) => Ok(tx.list_by_chat_and_status(chat_id, status)),
        }
    }

    pub async fn list_being_invited_by_owner(
        &mut self,
        owner: CallOwner,
    ) -> StoreResult<Vec<CallStateRecord>> {
        match self {
            Self::Postgres(tx) => postgres::list_being_invited_by_owner(&mut **tx, owner).await,
            Self::Memory(tx) => Ok(tx.list_being_invited_by_owner(owner)),
        }
    }

    /// Rows in `status`, ordered by `(chat_id, user_id, token_id)`.
    pub async fn list_by_status(
        &mut self,
        status: CallStatus,
        page: Page,
    ) -> StoreResult<Vec<CallStateRecord>> {
        match self {
            Self::Postgres(tx) => postgres::list_by_status(&mut **tx, status, page).await,
            Self::Memory(tx) => Ok(tx.list_by_status(status, page)),
        }
    }

    /// Every row, ordered by `(effective owner, chat_id, user_id, token_id)` so
    /// one owner's dial group in one chat is contiguous.
    pub async fn list_all(&mut self, page: Page) -> StoreResult<Vec<CallStateRecord>> {
        match self {
            Self::Postgres(tx) => postgres::list_all(&mut **tx, page).await,
            Self::Memory(tx) => Ok(tx.list_all(page)),
        }
    }

    /// Returns whether a row was updated.
    pub async fn set_status(&mut self, key: CallKey, status: CallStatus) -> StoreResult<bool> {
        match self {
            Self::Postgres(tx) => postgres::set_status(&mut **tx, key, status).await,
            Self::Memory(tx) => Ok(tx.update(key, |record| record.status = status)),
        }
    }

    pub async fn set_orphan_attempt(&mut self, key: CallKey, attempt: i32) -> StoreResult<bool> {
        match self {
            Self::Postgres(tx) => postgres::set_orphan_attempt(&mut **tx, key, attempt).await,
            Self::Memory(tx) => {
                Ok(tx.update(key, |record| record.marked_for_orphan_remove_attempt = attempt))
            }
        }
    }

    pub async fn set_marked_for_remove_at(
        &mut self,
        key: CallKey,
        at: Option<DateTime<Utc>>,
    ) -> StoreResult<bool> {
        match self {
            Self::Postgres(tx) => postgres::set_marked_for_remove_at(&mut **tx, key, at).await,
            Self::Memory(tx) => Ok(tx.update(key, |record| record.marked_for_remove_at = at)),
        }
    }

    /// Move a row into a temporary status and register it for deletion.
    pub async fn mark_temporary(
        &mut self,
        key: CallKey,
        status: CallStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        debug_assert!(status.is_temporary(), "{status} is not a temporary status");
        let updated = self.set_status(key, status).await?;
        if updated {
            self.set_marked_for_remove_at(key, Some(now)).await?;
        }
        Ok(updated)
    }

    pub async fn remove(&mut self, key: CallKey) -> StoreResult<bool> {
        match self {
            Self::Postgres(tx) => postgres::remove(&mut **tx, key).await,
            Self::Memory(tx) => Ok(tx.remove(key)),
        }
    }

    /// Delete every row `owner` dialed, then `owner`'s own row. Returns the
    /// number of rows deleted.
    pub async fn remove_owned_and_owner(&mut self, owner: CallOwner) -> StoreResult<u64> {
        match self {
            Self::Postgres(tx) => postgres::remove_owned_and_owner(&mut **tx, owner).await,
            Self::Memory(tx) => Ok(tx.remove_owned_and_owner(owner)),
        }
    }

    pub async fn remove_batch(&mut self, keys: &[CallKey]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        match self {
            Self::Postgres(tx) => postgres::remove_batch(&mut **tx, keys).await,
            Self::Memory(tx) => Ok(tx.remove_batch(keys)),
        }
    }

    pub async fn commit(self) -> StoreResult<()> {
        match self {
            Self::Postgres(tx) => Ok(tx.commit().await?),
            Self::Memory(tx) => tx.commit(),
        }
    }
}

// In-memory call-state backend with the same transactional semantics as
// Postgres: a transaction holds the table lock, mutates a working copy and
// publishes it on commit.

use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tokio::sync::{Mutex, OwnedMutexGuard};

use callsync_common::types::{CallKey, CallOwner, CallStateRecord, CallStatus, ChatId, UserId};

use super::{Page, StoreError, StoreResult};

type Rows = BTreeMap<CallKey, CallStateRecord>;

#[derive(Clone, Default)]
pub struct MemoryCallStateStore {
    rows: Arc<Mutex<Rows>>,
    failing_commits: Arc<AtomicUsize>,
}

impl MemoryCallStateStore {
    pub(super) async fn begin(&self) -> MemoryTx {
        let guard = Arc::clone(&self.rows).lock_owned().await;
        let working = guard.clone();
        MemoryTx { guard, working, failing_commits: Arc::clone(&self.failing_commits) }
    }

    /// Make the next `count` commits fail, leaving the table untouched.
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Copy of every row, in key order.
    pub async fn snapshot(&self) -> Vec<CallStateRecord> {
        self.rows.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<Rows>,
    working: Rows,
    failing_commits: Arc<AtomicUsize>,
}

impl MemoryTx {
    pub(super) fn upsert(&mut self, record: &CallStateRecord) {
        self.working.insert(record.key(), record.clone());
    }

    pub(super) fn get(&self, key: CallKey) -> Option<CallStateRecord> {
        self.working.get(&key).cloned()
    }

    pub(super) fn list_by_user(&self, user_id: UserId) -> Vec<CallStateRecord> {
        self.collect_sorted(|record| record.user_id == user_id)
    }

    pub(super) fn list_by_chat_and_status(
        &self,
        chat_id: ChatId,
        status: CallStatus,
    ) -> Vec<CallStateRecord> {
        self.collect_sorted(|record| record.chat_id == chat_id && record.status == status)
    }

    pub(super) fn list_being_invited_by_owner(&self, owner: CallOwner) -> Vec<CallStateRecord> {
        self.collect_sorted(|record| {
            record.status == CallStatus::BeingInvited && record.is_owned_by(owner)
        })
    }

    pub(super) fn list_by_status(&self, status: CallStatus, page: Page) -> Vec<CallStateRecord> {
        paginate(self.collect_sorted(|record| record.status == status), page)
    }

    pub(super) fn list_all(&self, page: Page) -> Vec<CallStateRecord> {
        let mut rows: Vec<CallStateRecord> = self.working.values().cloned().collect();
        rows.sort_by_key(|record| {
            (record.effective_owner(), record.chat_id, record.user_id, record.token_id)
        });
        paginate(rows, page)
    }

    pub(super) fn update(&mut self, key: CallKey, apply: impl FnOnce(&mut CallStateRecord)) -> bool {
        match self.working.get_mut(&key) {
            Some(record) => {
                apply(record);
                true
            }
            None => false,
        }
    }

    pub(super) fn remove(&mut self, key: CallKey) -> bool {
        self.working.remove(&key).is_some()
    }

    pub(super) fn remove_owned_and_owner(&mut self, owner: CallOwner) -> u64 {
        let before = self.working.len();
        self.working.retain(|_, record| !record.is_owned_by(owner));
        self.working.remove(&owner);
        (before - self.working.len()) as u64
    }

    pub(super) fn remove_batch(&mut self, keys: &[CallKey]) -> u64 {
        keys.iter().filter(|&&key| self.working.remove(&key).is_some()).count() as u64
    }

    pub(super) fn commit(mut self) -> StoreResult<()> {
        let injected = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected commit failure".into()));
        }
        *self.guard = std::mem::take(&mut self.working);
        Ok(())
    }

    /// Rows matching `predicate`, ordered by `(chat_id, user_id, token_id)`.
    fn collect_sorted(&self, predicate: impl Fn(&CallStateRecord) -> bool) -> Vec<CallStateRecord> {
        let mut rows: Vec<CallStateRecord> =
            self.working.values().filter(|record| predicate(record)).cloned().collect();
        rows.sort_by_key(|record| (record.chat_id, record.user_id, record.token_id));
        rows
    }
}

fn paginate(rows: Vec<CallStateRecord>, page: Page) -> Vec<CallStateRecord> {
    rows.into_iter().skip(page.offset).take(page.limit).collect()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use crate::store::{CallStateStore, Page};
    use callsync_common::types::{CallKey, CallStateRecord, CallStatus};

    fn key(user_id: i64) -> CallKey {
        CallKey::new(Uuid::new_v4(), user_id)
    }

    #[tokio::test]
    async fn uncommitted_changes_are_discarded() {
        let store = CallStateStore::memory();
        let record = CallStateRecord::presence(key(1), 1, None, false, Utc::now());

        let mut tx = store.begin().await.expect("begin");
        tx.upsert(&record).await.expect("upsert");
        drop(tx);

        assert_eq!(store.status(record.key()).await.expect("status"), CallStatus::NotFound);
    }

    #[tokio::test]
    async fn failed_commit_leaves_table_untouched() {
        let CallStateStore::Memory(memory) = CallStateStore::memory() else {
            unreachable!("memory constructor returns memory backend");
        };
        let store = CallStateStore::Memory(memory.clone());
        let record = CallStateRecord::presence(key(1), 1, None, false, Utc::now());

        memory.fail_next_commits(1);
        let mut tx = store.begin().await.expect("begin");
        tx.upsert(&record).await.expect("upsert");
        assert!(tx.commit().await.is_err());
        assert_eq!(memory.len().await, 0);

        let mut tx = store.begin().await.expect("begin");
        tx.upsert(&record).await.expect("upsert");
        tx.commit().await.expect("second commit should succeed");
        assert_eq!(memory.len().await, 1);
    }

    #[tokio::test]
    async fn remove_owned_and_owner_cascades() {
        let store = CallStateStore::memory();
        let now = Utc::now();
        let owner = key(1);
        let owner_row = CallStateRecord::presence(owner, 5, None, false, now);
        let callee_a = CallStateRecord::invitation(key(2), 5, owner, None, false, now);
        let callee_b = CallStateRecord::invitation(key(3), 5, owner, None, false, now);
        let bystander = CallStateRecord::presence(key(4), 5, None, false, now);

        let mut tx = store.begin().await.expect("begin");
        for record in [&owner_row, &callee_a, &callee_b, &bystander] {
            tx.upsert(record).await.expect("upsert");
        }
        assert_eq!(tx.remove_owned_and_owner(owner).await.expect("cascade"), 3);
        tx.commit().await.expect("commit");

        assert_eq!(store.status(bystander.key()).await.expect("status"), CallStatus::InCall);
        assert_eq!(store.status(owner).await.expect("status"), CallStatus::NotFound);
    }

    #[tokio::test]
    async fn list_all_groups_rows_by_effective_owner() {
        let store = CallStateStore::memory();
        let now = Utc::now();
        let owner = key(5);
        let rows = [
            CallStateRecord::invitation(key(9), 1, owner, None, false, now),
            CallStateRecord::presence(key(2), 1, None, false, now),
            CallStateRecord::presence(owner, 1, None, false, now),
            CallStateRecord::invitation(key(7), 1, owner, None, false, now),
        ];

        let mut tx = store.begin().await.expect("begin");
        for record in &rows {
            tx.upsert(record).await.expect("upsert");
        }
        let listed = tx.list_all(Page::first(10)).await.expect("list");
        let users: Vec<i64> = listed.iter().map(|record| record.user_id).collect();
        assert_eq!(users, vec![2, 5, 7, 9]);

        let second_page = tx.list_all(Page { limit: 2, offset: 2 }).await.expect("list");
        assert_eq!(second_page.len(), 2);
        assert_eq!(second_page[0].user_id, 7);
    }

    #[tokio::test]
    async fn setters_report_missing_rows() {
        let store = CallStateStore::memory();
        let mut tx = store.begin().await.expect("begin");
        assert!(!tx.set_status(key(1), CallStatus::Removing).await.expect("set"));
        assert!(!tx.set_orphan_attempt(key(1), 2).await.expect("set"));
        assert!(!tx.remove(key(1)).await.expect("remove"));
        assert_eq!(tx.remove_batch(&[]).await.expect("batch"), 0);
    }
}

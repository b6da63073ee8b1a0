// Synchronizer: converges the call-state table with the media server.
//
// Phase A walks every `inCall` row and checks it against the participants
// the SFU reports for its chat. Rows missing from the SFU accumulate a miss
// counter and are demoted to `removing` once the counter reaches the limit.
// Phase B walks every live SFU room and inserts `inCall` rows for human
// participants the table does not know about.
//
// SFU and chat-service calls are made before the transaction that applies
// their results is opened.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::Utc;

use callsync_common::events::CallEvent;
use callsync_common::sfu::{chat_id_from_room_name, room_name_for_chat, ParticipantMetadata};
use callsync_common::types::{CallKey, CallStateRecord, CallStatus, ChatId, UserId};

use crate::config::ReconcileConfig;
use crate::gateway::{emit, with_deadline, ChatAccessGateway, EventPublisher, SfuGateway};
use crate::store::{CallStateStore, Page, StoreResult};

/// Totals for one synchronizer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub corroborated: usize,
    pub missed: usize,
    pub orphaned: usize,
    /// Rows left alone because their chat's SFU query failed.
    pub skipped: usize,
    pub backfilled: usize,
    pub failed_batches: usize,
}

/// Outcome of applying one page of phase A.
#[derive(Debug, Default)]
struct OrphanBatch {
    /// Rows still `inCall` after the batch.
    retained: usize,
    orphaned_users: Vec<UserId>,
}

pub struct Synchronizer<S, C, P> {
    store: CallStateStore,
    sfu: S,
    chat: C,
    events: P,
    config: ReconcileConfig,
}

impl<S, C, P> Synchronizer<S, C, P>
where
    S: SfuGateway,
    C: ChatAccessGateway,
    P: EventPublisher,
{
    pub fn new(store: CallStateStore, sfu: S, chat: C, events: P, config: ReconcileConfig) -> Self {
        Self { store, sfu, chat, events, config }
    }

    pub async fn run_once(&self) -> SyncReport {
        let mut report = SyncReport::default();
        self.detect_orphans(&mut report).await;
        self.backfill(&mut report).await;
        tracing::debug!(
            corroborated = report.corroborated,
            missed = report.missed,
            orphaned = report.orphaned,
            skipped = report.skipped,
            backfilled = report.backfilled,
            failed_batches = report.failed_batches,
            "synchronizer run finished"
        );
        report
    }

    // ── Phase A: orphan detection ──

    async fn detect_orphans(&self, report: &mut SyncReport) {
        let mut page = Page::first(self.config.batch_size.max(1));
        loop {
            let rows = match self.fetch_in_call(page).await {
                Ok(rows) => rows,
                Err(error) => {
                    tracing::warn!(offset = page.offset, %error, "could not list in-call rows");
                    report.failed_batches += 1;
                    return;
                }
            };
            let fetched = rows.len();
            let live = self.live_participants(&rows).await;

            match self.apply_presence(&rows, &live, report).await {
                Ok(batch) => {
                    for user_id in batch.orphaned_users {
                        emit(&self.events, CallEvent::in_video(user_id, false)).await;
                    }
                    page = page.advance(batch.retained);
                }
                Err(error) => {
                    tracing::warn!(offset = page.offset, %error, "orphan batch failed");
                    report.failed_batches += 1;
                    page = page.advance(fetched);
                }
            }

            if fetched < page.limit {
                return;
            }
        }
    }

    async fn fetch_in_call(&self, page: Page) -> StoreResult<Vec<CallStateRecord>> {
        let mut tx = self.store.begin().await?;
        tx.list_by_status(CallStatus::InCall, page).await
    }

    /// Human participants per chat. Chats whose query failed are absent.
    async fn live_participants(
        &self,
        rows: &[CallStateRecord],
    ) -> HashMap<ChatId, HashSet<CallKey>> {
        let chats: BTreeSet<ChatId> = rows.iter().map(|record| record.chat_id).collect();
        let mut live = HashMap::with_capacity(chats.len());
        for chat_id in chats {
            let room = room_name_for_chat(chat_id);
            match with_deadline(self.config.external_call_timeout, self.sfu.list_participants(&room))
                .await
            {
                Ok(participants) => {
                    let keys = participants
                        .iter()
                        .filter_map(|participant| participant.human())
                        .map(|metadata| metadata.key())
                        .collect();
                    live.insert(chat_id, keys);
                }
                Err(error) => {
                    tracing::warn!(chat_id, %error, "sfu participants unavailable, skipping chat");
                }
            }
        }
        live
    }

    async fn apply_presence(
        &self,
        rows: &[CallStateRecord],
        live: &HashMap<ChatId, HashSet<CallKey>>,
        report: &mut SyncReport,
    ) -> StoreResult<OrphanBatch> {
        let now = Utc::now();
        let limit = self.config.orphan_user_iteration_limit;
        let mut tx = self.store.begin().await?;
        let mut batch = OrphanBatch::default();
        let mut tally = SyncReport::default();

        for listed in rows {
            let key = listed.key();
            let Some(present) = live.get(&listed.chat_id) else {
                tally.skipped += 1;
                batch.retained += 1;
                continue;
            };
            // Re-read under this transaction; the row may have moved on.
            let Some(record) = tx.get(key).await? else { continue };
            if record.status != CallStatus::InCall {
                continue;
            }

            if present.contains(&key) {
                tally.corroborated += 1;
                batch.retained += 1;
                if record.marked_for_orphan_remove_attempt != 0 {
                    tx.set_orphan_attempt(key, 0).await?;
                }
            } else if record.marked_for_orphan_remove_attempt >= limit {
                tx.mark_temporary(key, CallStatus::Removing, now).await?;
                for owned in tx.list_being_invited_by_owner(key).await? {
                    tx.mark_temporary(owned.key(), CallStatus::Removing, now).await?;
                }
                tracing::info!(
                    chat_id = record.chat_id,
                    user_id = key.user_id,
                    token_id = %key.token_id,
                    "in-call row orphaned"
                );
                tally.orphaned += 1;
                batch.orphaned_users.push(key.user_id);
            } else {
                tally.missed += 1;
                batch.retained += 1;
                tx.set_orphan_attempt(key, record.marked_for_orphan_remove_attempt + 1).await?;
            }
        }

        tx.commit().await?;
        report.corroborated += tally.corroborated;
        report.missed += tally.missed;
        report.orphaned += tally.orphaned;
        report.skipped += tally.skipped;
        Ok(batch)
    }

    // ── Phase B: backfill ──

    async fn backfill(&self, report: &mut SyncReport) {
        let rooms =
            match with_deadline(self.config.external_call_timeout, self.sfu.list_rooms()).await {
                Ok(rooms) => rooms,
                Err(error) => {
                    tracing::warn!(%error, "sfu rooms unavailable, skipping backfill");
                    return;
                }
            };

        for room in rooms {
            let Some(chat_id) = chat_id_from_room_name(&room) else { continue };
            match self.backfill_room(chat_id, &room).await {
                Ok(inserted) => {
                    report.backfilled += inserted.len();
                    for user_id in inserted {
                        emit(&self.events, CallEvent::in_video(user_id, true)).await;
                    }
                }
                Err(error) => {
                    tracing::warn!(chat_id, %error, "backfill failed for room");
                    report.failed_batches += 1;
                }
            }
        }
    }

    /// Returns the users whose rows were inserted.
    async fn backfill_room(&self, chat_id: ChatId, room: &str) -> anyhow::Result<Vec<UserId>> {
        let participants =
            with_deadline(self.config.external_call_timeout, self.sfu.list_participants(room))
                .await?;
        let humans: Vec<ParticipantMetadata> =
            participants.iter().filter_map(|participant| participant.human()).collect();
        if humans.is_empty() {
            return Ok(Vec::new());
        }

        let mut missing = Vec::new();
        {
            let mut tx = self.store.begin().await?;
            for metadata in humans {
                if tx.status(metadata.key()).await? == CallStatus::NotFound {
                    missing.push(metadata);
                }
            }
        }
        let Some(first) = missing.first() else {
            return Ok(Vec::new());
        };

        let info = with_deadline(
            self.config.external_call_timeout,
            self.chat.basic_chat_info(chat_id, first.user_id),
        )
        .await?;

        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let mut inserted = Vec::with_capacity(missing.len());
        for metadata in missing {
            let key = metadata.key();
            if tx.status(key).await? != CallStatus::NotFound {
                continue;
            }
            let record =
                CallStateRecord::presence(key, chat_id, metadata.avatar, info.tet_a_tet, now);
            tx.upsert(&record).await?;
            tracing::info!(
                chat_id,
                user_id = key.user_id,
                token_id = %key.token_id,
                "backfilled in-call row"
            );
            inserted.push(key.user_id);
        }
        tx.commit().await?;
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::gateway::fake::{FakeChat, FakeSfu, RecordingPublisher};

    type TestSynchronizer = Synchronizer<Arc<FakeSfu>, Arc<FakeChat>, Arc<RecordingPublisher>>;

    struct Harness {
        store: CallStateStore,
        sfu: Arc<FakeSfu>,
        chat: Arc<FakeChat>,
        events: Arc<RecordingPublisher>,
        synchronizer: TestSynchronizer,
    }

    fn harness(batch_size: usize) -> Harness {
        let store = CallStateStore::memory();
        let sfu = Arc::new(FakeSfu::default());
        let chat = Arc::new(FakeChat::default());
        let events = Arc::new(RecordingPublisher::default());
        let config = ReconcileConfig {
            batch_size,
            orphan_user_iteration_limit: 3,
            external_call_timeout: Duration::from_secs(1),
            ..ReconcileConfig::default()
        };
        let synchronizer = Synchronizer::new(
            store.clone(),
            Arc::clone(&sfu),
            Arc::clone(&chat),
            Arc::clone(&events),
            config,
        );
        Harness { store, sfu, chat, events, synchronizer }
    }

    fn key(user_id: UserId) -> CallKey {
        CallKey::new(Uuid::new_v4(), user_id)
    }

    async fn seed(store: &CallStateStore, rows: &[CallStateRecord]) {
        let mut tx = store.begin().await.expect("begin");
        for record in rows {
            tx.upsert(record).await.expect("upsert");
        }
        tx.commit().await.expect("commit");
    }

    async fn row(store: &CallStateStore, key: CallKey) -> CallStateRecord {
        store.get(key).await.expect("get").expect("row exists")
    }

    #[tokio::test]
    async fn absent_row_survives_grace_period_then_is_removed() {
        let h = harness(50);
        let device = key(3);
        seed(&h.store, &[CallStateRecord::presence(device, 1, None, false, Utc::now())]).await;

        for expected_attempt in 1..=3 {
            h.synchronizer.run_once().await;
            let current = row(&h.store, device).await;
            assert_eq!(current.status, CallStatus::InCall);
            assert_eq!(current.marked_for_orphan_remove_attempt, expected_attempt);
        }
        assert!(h.events.take().is_empty());

        let report = h.synchronizer.run_once().await;
        assert_eq!(report.orphaned, 1);
        let removed = row(&h.store, device).await;
        assert_eq!(removed.status, CallStatus::Removing);
        assert!(removed.marked_for_remove_at.is_some());
        assert_eq!(h.events.take(), vec![CallEvent::in_video(3, false)]);
    }

    #[tokio::test]
    async fn orphaned_owner_cascades_to_pending_invites() {
        let h = harness(50);
        let owner = key(1);
        let now = Utc::now();
        let mut owner_row = CallStateRecord::presence(owner, 1, None, false, now);
        owner_row.marked_for_orphan_remove_attempt = 3;
        let callee = CallStateRecord::invitation(key(2), 1, owner, None, false, now);
        seed(&h.store, &[owner_row, callee.clone()]).await;

        h.synchronizer.run_once().await;

        assert_eq!(row(&h.store, owner).await.status, CallStatus::Removing);
        let callee_row = row(&h.store, callee.key()).await;
        assert_eq!(callee_row.status, CallStatus::Removing);
        assert!(callee_row.marked_for_remove_at.is_some());
    }

    #[tokio::test]
    async fn reappearing_participant_resets_counter() {
        let h = harness(50);
        let device = key(3);
        let mut record = CallStateRecord::presence(device, 1, None, false, Utc::now());
        record.marked_for_orphan_remove_attempt = 2;
        seed(&h.store, &[record]).await;
        h.sfu.join(1, device);

        let report = h.synchronizer.run_once().await;

        assert_eq!(report.corroborated, 1);
        let current = row(&h.store, device).await;
        assert_eq!(current.status, CallStatus::InCall);
        assert_eq!(current.marked_for_orphan_remove_attempt, 0);
    }

    #[tokio::test]
    async fn failed_sfu_query_leaves_chat_untouched() {
        let h = harness(50);
        let device = key(3);
        let mut record = CallStateRecord::presence(device, 1, None, false, Utc::now());
        record.marked_for_orphan_remove_attempt = 3;
        seed(&h.store, &[record]).await;
        h.sfu.fail_room(1);

        let report = h.synchronizer.run_once().await;

        assert_eq!(report.skipped, 1);
        let current = row(&h.store, device).await;
        assert_eq!(current.status, CallStatus::InCall);
        assert_eq!(current.marked_for_orphan_remove_attempt, 3);

        h.sfu.heal_room(1);
        h.sfu.join(1, device);
        h.synchronizer.run_once().await;
        assert_eq!(row(&h.store, device).await.marked_for_orphan_remove_attempt, 0);
    }

    #[tokio::test]
    async fn backfill_inserts_unknown_participant_once() {
        let h = harness(50);
        h.chat.set_tet_a_tet(true);
        let token = Uuid::new_v4();
        let device = CallKey::new(token, 3);
        h.sfu.join(1, device);

        let first = h.synchronizer.run_once().await;
        assert_eq!(first.backfilled, 1);

        let backfilled = row(&h.store, device).await;
        assert_eq!(backfilled.status, CallStatus::InCall);
        assert_eq!(backfilled.chat_id, 1);
        assert_eq!(backfilled.owner, None);
        assert!(backfilled.chat_tet_a_tet);

        let second = h.synchronizer.run_once().await;
        assert_eq!(second.backfilled, 0);
        assert_eq!(second.corroborated, 1);
        let CallStateStore::Memory(memory) = &h.store else { unreachable!("memory store") };
        assert_eq!(memory.len().await, 1);
        assert_eq!(h.events.take(), vec![CallEvent::in_video(3, true)]);
    }

    #[tokio::test]
    async fn non_human_and_foreign_rooms_are_ignored() {
        let h = harness(50);
        h.sfu.join_raw("chat1", "egress-1", None);
        h.sfu.join_raw("chat1", "recorder", Some("{not json"));
        h.sfu.join_raw("lobby", "guest", Some(r#"{"tokenId":"00000000-0000-0000-0000-000000000001","userId":4}"#));

        let report = h.synchronizer.run_once().await;

        assert_eq!(report.backfilled, 0);
        assert_eq!(report.failed_batches, 0);
        let CallStateStore::Memory(memory) = &h.store else { unreachable!("memory store") };
        assert_eq!(memory.len().await, 0);
    }

    #[tokio::test]
    async fn paging_reaches_every_row_while_demoting() {
        let h = harness(1);
        let rows: Vec<CallStateRecord> = (1..=3)
            .map(|user| {
                let mut record = CallStateRecord::presence(key(user), 1, None, false, Utc::now());
                record.marked_for_orphan_remove_attempt = 3;
                record
            })
            .collect();
        seed(&h.store, &rows).await;

        let report = h.synchronizer.run_once().await;

        assert_eq!(report.orphaned, 3);
        for record in &rows {
            assert_eq!(row(&h.store, record.key()).await.status, CallStatus::Removing);
        }
    }
}

// Dialer: periodic sweep over every call-state row.
//
// Each page of `list_all` is split into dial groups, one per chat and
// effective owner. Stale temporary rows and invites that rang too long are
// deleted first, then the surviving rows of each group are announced as a
// `DialStatusChanged` event plus one `CallInvitation` per named callee.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use callsync_common::events::{CallEvent, DialStatus};
use callsync_common::types::{CallKey, CallStateRecord, CallStatus, ChatId, UserId};

use crate::config::{chrono_delta, ReconcileConfig};
use crate::gateway::{emit, with_deadline, ChatAccessGateway, EventPublisher};
use crate::store::{CallStateStore, Page, StoreResult};

/// Totals for one dialer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DialerReport {
    pub batches: usize,
    pub failed_batches: usize,
    pub groups: usize,
    pub removed: u64,
    pub invitations: usize,
}

/// Rows of one chat dialed by one owner, in listing order.
#[derive(Debug)]
struct DialGroup {
    chat_id: ChatId,
    owner_id: UserId,
    rows: Vec<CallStateRecord>,
}

impl DialGroup {
    fn owner_avatar(&self) -> Option<String> {
        self.rows.iter().find_map(|record| record.owner_avatar.clone())
    }

    fn tet_a_tet(&self) -> bool {
        self.rows.iter().any(|record| record.chat_tet_a_tet)
    }

    /// Collapse every row into one status per user; the most live status wins.
    fn dials(&self) -> Vec<DialStatus> {
        let mut by_user: BTreeMap<UserId, CallStatus> = BTreeMap::new();
        for record in &self.rows {
            by_user
                .entry(record.user_id)
                .and_modify(|status| {
                    if record.status.precedence() > status.precedence() {
                        *status = record.status;
                    }
                })
                .or_insert(record.status);
        }
        by_user.into_iter().map(|(user_id, status)| DialStatus { user_id, status }).collect()
    }

    /// Callees that should see (or stop seeing) a ringing invitation.
    fn pending_callees(&self) -> Vec<(UserId, CallStatus)> {
        self.dials()
            .into_iter()
            .filter(|dial| dial.user_id != self.owner_id)
            .filter(|dial| matches!(dial.status, CallStatus::BeingInvited | CallStatus::Cancelling))
            .map(|dial| (dial.user_id, dial.status))
            .collect()
    }
}

fn group_rows(rows: Vec<CallStateRecord>) -> Vec<DialGroup> {
    let mut groups: Vec<DialGroup> = Vec::new();
    for record in rows {
        let (chat_id, owner_id) = (record.chat_id, record.effective_owner());
        match groups.last_mut() {
            Some(group) if group.chat_id == chat_id && group.owner_id == owner_id => {
                group.rows.push(record);
            }
            _ => groups.push(DialGroup { chat_id, owner_id, rows: vec![record] }),
        }
    }
    groups
}

pub struct Dialer<C, P> {
    store: CallStateStore,
    chat: C,
    events: P,
    config: ReconcileConfig,
}

impl<C, P> Dialer<C, P>
where
    C: ChatAccessGateway,
    P: EventPublisher,
{
    pub fn new(store: CallStateStore, chat: C, events: P, config: ReconcileConfig) -> Self {
        Self { store, chat, events, config }
    }

    pub async fn run_once(&self) -> DialerReport {
        let mut report = DialerReport::default();
        let mut page = Page::first(self.config.batch_size.max(1));

        loop {
            let now = Utc::now();
            let rows = match self.fetch(page).await {
                Ok(rows) => rows,
                Err(error) => {
                    tracing::warn!(offset = page.offset, %error, "dialer could not list call states");
                    report.failed_batches += 1;
                    break;
                }
            };
            let fetched = rows.len();
            report.batches += 1;

            match self.process_batch(rows, now, &mut report).await {
                Ok(retained) => page = page.advance(retained),
                Err(error) => {
                    tracing::warn!(offset = page.offset, %error, "dialer batch failed");
                    report.failed_batches += 1;
                    page = page.advance(fetched);
                }
            }

            if fetched < page.limit {
                break;
            }
        }

        tracing::debug!(
            batches = report.batches,
            groups = report.groups,
            removed = report.removed,
            invitations = report.invitations,
            "dialer run finished"
        );
        report
    }

    async fn fetch(&self, page: Page) -> StoreResult<Vec<CallStateRecord>> {
        // Read-only: dropping the transaction releases it.
        let mut tx = self.store.begin().await?;
        tx.list_all(page).await
    }

    /// Returns how many rows of the batch survived cleanup.
    async fn process_batch(
        &self,
        rows: Vec<CallStateRecord>,
        now: DateTime<Utc>,
        report: &mut DialerReport,
    ) -> StoreResult<usize> {
        let (expired, surviving) = self.partition_expired(rows, now);
        let mut retained = surviving.len();

        if !expired.is_empty() {
            let mut tx = self.store.begin().await?;
            // The page was read earlier; a key may have been reused since.
            let mut confirmed = Vec::with_capacity(expired.len());
            for key in expired {
                match tx.get(key).await? {
                    Some(current) if self.is_expired(&current, now) => confirmed.push(key),
                    Some(_) => retained += 1,
                    None => {}
                }
            }
            let removed =
                if confirmed.is_empty() { 0 } else { tx.remove_batch(&confirmed).await? };
            tx.commit().await?;
            if removed > 0 {
                tracing::info!(removed, "dialer removed stale call states");
            }
            report.removed += removed;
        }

        for group in group_rows(surviving) {
            report.groups += 1;
            report.invitations += self.announce(&group).await;
        }
        Ok(retained)
    }

    fn is_expired(&self, record: &CallStateRecord, now: DateTime<Utc>) -> bool {
        record.temporary_expired(now, chrono_delta(self.config.remove_temporary_after))
            || record.dangling(now, chrono_delta(self.config.remove_dangling_being_invited_after))
    }

    fn partition_expired(
        &self,
        rows: Vec<CallStateRecord>,
        now: DateTime<Utc>,
    ) -> (Vec<CallKey>, Vec<CallStateRecord>) {
        let mut expired = Vec::new();
        let mut surviving = Vec::with_capacity(rows.len());
        for record in rows {
            if self.is_expired(&record, now) {
                expired.push(record.key());
            } else {
                surviving.push(record);
            }
        }
        (expired, surviving)
    }

    /// Emit the group snapshot and its invitations. Returns invitations sent.
    async fn announce(&self, group: &DialGroup) -> usize {
        let owner_avatar = group.owner_avatar();
        emit(
            &self.events,
            CallEvent::DialStatusChanged {
                chat_id: group.chat_id,
                owner_id: group.owner_id,
                owner_avatar: owner_avatar.clone(),
                tet_a_tet: group.tet_a_tet(),
                dials: group.dials(),
            },
        )
        .await;

        let callees = group.pending_callees();
        if callees.is_empty() {
            return 0;
        }
        let user_ids: Vec<UserId> = callees.iter().map(|(user_id, _)| *user_id).collect();
        let names = match with_deadline(
            self.config.external_call_timeout,
            self.chat.chat_names_for_invite(group.chat_id, group.owner_id, &user_ids),
        )
        .await
        {
            Ok(names) => names,
            Err(error) => {
                tracing::warn!(
                    chat_id = group.chat_id,
                    owner_id = group.owner_id,
                    %error,
                    "invite names unavailable, skipping invitations"
                );
                return 0;
            }
        };
        let names: HashMap<UserId, String> =
            names.into_iter().map(|name| (name.user_id, name.name)).collect();

        let mut sent = 0;
        for (user_id, status) in callees {
            let Some(chat_name) = names.get(&user_id) else { continue };
            emit(
                &self.events,
                CallEvent::CallInvitation {
                    chat_id: group.chat_id,
                    user_id,
                    owner_id: group.owner_id,
                    owner_avatar: owner_avatar.clone(),
                    chat_name: chat_name.clone(),
                    status,
                },
            )
            .await;
            sent += 1;
        }
        sent
    }
}

// Call membership transitions driven by the users themselves: entering and
// leaving a call, declining a ring and kicking a participant.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;

use callsync_common::events::CallEvent;
use callsync_common::sfu::room_name_for_chat;
use callsync_common::types::{CallKey, CallStateRecord, CallStatus, ChatId, UserId};

use crate::gateway::{
    emit, with_deadline, ChatAccessGateway, EventPublisher, GatewayError, SfuGateway,
};
use crate::store::{CallStateStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("user {user_id} has no access to chat {chat_id}")]
    Unauthorized { user_id: UserId, chat_id: ChatId },
    /// The device is live in another chat's call.
    #[error("device of user {user_id} is {status} in chat {chat_id}")]
    Conflict { user_id: UserId, chat_id: ChatId, status: CallStatus },
    #[error("upstream call failed: {0}")]
    Upstream(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What `enter` did with the caller's row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnterOutcome {
    /// A ringing invitation was answered.
    Answered,
    /// A fresh presence row was written.
    Joined,
    /// The row was already `inCall` in this chat.
    AlreadyInCall,
}

pub struct CallMembership<C, S, P> {
    store: CallStateStore,
    chat: C,
    sfu: S,
    events: P,
    call_timeout: Duration,
}

impl<C, S, P> CallMembership<C, S, P>
where
    C: ChatAccessGateway,
    S: SfuGateway,
    P: EventPublisher,
{
    pub fn new(store: CallStateStore, chat: C, sfu: S, events: P, call_timeout: Duration) -> Self {
        Self { store, chat, sfu, events, call_timeout }
    }

    async fn ensure_access(&self, user_id: UserId, chat_id: ChatId) -> Result<(), MembershipError> {
        let allowed =
            with_deadline(self.call_timeout, self.chat.check_access(user_id, chat_id)).await?;
        if allowed {
            Ok(())
        } else {
            Err(MembershipError::Unauthorized { user_id, chat_id })
        }
    }

    pub async fn enter(
        &self,
        key: CallKey,
        chat_id: ChatId,
        avatar: Option<String>,
    ) -> Result<EnterOutcome, MembershipError> {
        self.ensure_access(key.user_id, chat_id).await?;
        let tet_a_tet =
            match with_deadline(self.call_timeout, self.chat.basic_chat_info(chat_id, key.user_id))
                .await
            {
                Ok(info) => info.tet_a_tet,
                Err(error) => {
                    tracing::warn!(chat_id, %error, "basic chat info unavailable");
                    false
                }
            };

        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let outcome = match tx.get(key).await? {
            Some(mut record)
                if record.status == CallStatus::BeingInvited && record.chat_id == chat_id =>
            {
                record.status = CallStatus::InCall;
                record.token_taken = true;
                record.marked_for_remove_at = None;
                record.marked_for_orphan_remove_attempt = 0;
                tx.upsert(&record).await?;
                EnterOutcome::Answered
            }
            Some(record) if record.status == CallStatus::InCall && record.chat_id == chat_id => {
                EnterOutcome::AlreadyInCall
            }
            Some(record) if !record.status.is_overridable() => {
                return Err(MembershipError::Conflict {
                    user_id: key.user_id,
                    chat_id: record.chat_id,
                    status: record.status,
                });
            }
            _ => {
                // Rings carry a server-minted token; the answering device
                // claims them by user and chat.
                let mut ringing: Vec<CallStateRecord> = tx
                    .list_by_chat_and_status(chat_id, CallStatus::BeingInvited)
                    .await?
                    .into_iter()
                    .filter(|record| record.user_id == key.user_id)
                    .collect();
                if ringing.is_empty() {
                    tx.upsert(&CallStateRecord::presence(key, chat_id, avatar, tet_a_tet, now))
                        .await?;
                    EnterOutcome::Joined
                } else {
                    let answered = ringing.remove(0);
                    tx.remove(answered.key()).await?;
                    for other in &ringing {
                        tx.mark_temporary(other.key(), CallStatus::Cancelling, now).await?;
                    }
                    tx.upsert(&CallStateRecord {
                        token_id: key.token_id,
                        user_id: key.user_id,
                        token_taken: true,
                        status: CallStatus::InCall,
                        marked_for_remove_at: None,
                        marked_for_orphan_remove_attempt: 0,
                        ..answered
                    })
                    .await?;
                    EnterOutcome::Answered
                }
            }
        };
        tx.commit().await?;

        if outcome != EnterOutcome::AlreadyInCall {
            tracing::info!(
                chat_id,
                user_id = key.user_id,
                token_id = %key.token_id,
                ?outcome,
                "entered call"
            );
            emit(&self.events, CallEvent::in_video(key.user_id, true)).await;
        }
        Ok(outcome)
    }

    /// Returns `false` when the device had no live row.
    pub async fn leave(&self, key: CallKey) -> Result<bool, MembershipError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let Some(record) = tx.get(key).await? else {
            return Ok(false);
        };
        if record.status.is_temporary() {
            // Already on its way out; re-marking would postpone the reap.
            return Ok(false);
        }

        tx.mark_temporary(key, CallStatus::Cancelling, now).await?;
        let dialed = tx.list_being_invited_by_owner(key).await?;
        for callee in &dialed {
            tx.mark_temporary(callee.key(), CallStatus::Cancelling, now).await?;
        }
        tx.commit().await?;

        tracing::info!(
            chat_id = record.chat_id,
            user_id = key.user_id,
            token_id = %key.token_id,
            cancelled_invites = dialed.len(),
            "left call"
        );
        emit(&self.events, CallEvent::in_video(key.user_id, false)).await;
        Ok(true)
    }

    /// Stop every ring addressed to `user_id` in `chat_id`.
    pub async fn decline(&self, user_id: UserId, chat_id: ChatId) -> Result<usize, MembershipError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let ringing: Vec<CallKey> = tx
            .list_by_chat_and_status(chat_id, CallStatus::BeingInvited)
            .await?
            .into_iter()
            .filter(|record| record.user_id == user_id)
            .map(|record| record.key())
            .collect();
        for key in &ringing {
            tx.mark_temporary(*key, CallStatus::Cancelling, now).await?;
        }
        tx.commit().await?;

        tracing::info!(chat_id, user_id, declined = ringing.len(), "invitation declined");
        Ok(ringing.len())
    }

    /// Disconnect every device of `target_user_id` from the chat's room and
    /// mark their rows `removing`.
    pub async fn kick(
        &self,
        behalf_user_id: UserId,
        target_user_id: UserId,
        chat_id: ChatId,
    ) -> Result<usize, MembershipError> {
        self.ensure_access(behalf_user_id, chat_id).await?;

        let mut tx = self.store.begin().await?;
        let targets: HashSet<CallKey> = tx
            .list_by_chat_and_status(chat_id, CallStatus::InCall)
            .await?
            .into_iter()
            .filter(|record| record.user_id == target_user_id)
            .map(|record| record.key())
            .collect();
        tx.commit().await?;
        if targets.is_empty() {
            return Ok(0);
        }

        let room = room_name_for_chat(chat_id);
        let participants =
            with_deadline(self.call_timeout, self.sfu.list_participants(&room)).await?;
        for participant in participants {
            let Some(metadata) = participant.human() else { continue };
            if targets.contains(&metadata.key()) {
                with_deadline(
                    self.call_timeout,
                    self.sfu.remove_participant(&room, &participant.identity),
                )
                .await?;
            }
        }

        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        let mut removed = 0;
        for key in &targets {
            if tx.status(*key).await? == CallStatus::InCall {
                tx.mark_temporary(*key, CallStatus::Removing, now).await?;
                removed += 1;
            }
        }
        tx.commit().await?;

        tracing::info!(chat_id, behalf_user_id, target_user_id, removed, "participant kicked");
        if removed > 0 {
            emit(&self.events, CallEvent::in_video(target_user_id, false)).await;
        }
        Ok(removed)
    }
}

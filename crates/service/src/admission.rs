// Invitation admission: the only path that creates `beingInvited` rows.
//
// Access checks run against the chat service before any transaction is
// opened. The overridability check and the write share one transaction, so
// either the invite lands or nothing changes.

use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use callsync_common::types::{CallKey, CallStateRecord, CallStatus, ChatId, TokenId, UserId};

use crate::gateway::{with_deadline, ChatAccessGateway, GatewayError};
use crate::store::{CallStateStore, CallStateTx, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("user {user_id} has no access to chat {chat_id}")]
    Unauthorized { user_id: UserId, chat_id: ChatId },
    #[error("user {user_id} is already {status}")]
    Conflict { user_id: UserId, status: CallStatus },
    #[error("chat service unavailable: {0}")]
    Upstream(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One invite or cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteRequest {
    pub behalf_user_id: UserId,
    pub target_user_id: UserId,
    pub chat_id: ChatId,
    /// `true` to start ringing the target, `false` to stop.
    pub call: bool,
    /// The inviting device, when the caller knows it.
    pub behalf_token_id: Option<TokenId>,
    pub behalf_avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InviteOutcome {
    /// The target is now ringing under this key.
    Invited(CallKey),
    /// Number of ringing rows moved to `cancelling`.
    Cancelled(usize),
}

pub struct InvitationAdmission<C> {
    store: CallStateStore,
    chat: C,
    call_timeout: Duration,
}

impl<C: ChatAccessGateway> InvitationAdmission<C> {
    pub fn new(store: CallStateStore, chat: C, call_timeout: Duration) -> Self {
        Self { store, chat, call_timeout }
    }

    pub async fn invite(&self, request: InviteRequest) -> Result<InviteOutcome, AdmissionError> {
        self.ensure_access(request.behalf_user_id, request.chat_id).await?;
        self.ensure_access(request.target_user_id, request.chat_id).await?;

        if request.call {
            self.start_ringing(request).await.map(InviteOutcome::Invited)
        } else {
            self.stop_ringing(request).await.map(InviteOutcome::Cancelled)
        }
    }

    async fn ensure_access(&self, user_id: UserId, chat_id: ChatId) -> Result<(), AdmissionError> {
        let allowed =
            with_deadline(self.call_timeout, self.chat.check_access(user_id, chat_id)).await?;
        if allowed {
            Ok(())
        } else {
            Err(AdmissionError::Unauthorized { user_id, chat_id })
        }
    }

    async fn start_ringing(&self, request: InviteRequest) -> Result<CallKey, AdmissionError> {
        let tet_a_tet = match with_deadline(
            self.call_timeout,
            self.chat.basic_chat_info(request.chat_id, request.behalf_user_id),
        )
        .await
        {
            Ok(info) => info.tet_a_tet,
            Err(error) => {
                tracing::warn!(chat_id = request.chat_id, %error, "basic chat info unavailable");
                false
            }
        };

        let mut tx = self.store.begin().await?;

        let existing = tx.list_by_user(request.target_user_id).await?;
        if let Some(busy) = existing.iter().find(|record| !record.status.is_overridable()) {
            return Err(AdmissionError::Conflict {
                user_id: request.target_user_id,
                status: busy.status,
            });
        }

        let key = existing
            .iter()
            .find(|record| record.chat_id == request.chat_id)
            .map(CallStateRecord::key)
            .unwrap_or_else(|| CallKey::new(Uuid::new_v4(), request.target_user_id));

        let (owner, owner_avatar) = resolve_owner(&mut tx, &request).await?;
        let record =
            CallStateRecord::invitation(key, request.chat_id, owner, owner_avatar, tet_a_tet, Utc::now());
        tx.upsert(&record).await?;
        tx.commit().await?;

        tracing::info!(
            chat_id = request.chat_id,
            user_id = request.target_user_id,
            token_id = %key.token_id,
            owner_id = owner.user_id,
            "invitation created"
        );
        Ok(key)
    }

    async fn stop_ringing(&self, request: InviteRequest) -> Result<usize, AdmissionError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let ringing: Vec<CallKey> = tx
            .list_by_chat_and_status(request.chat_id, CallStatus::BeingInvited)
            .await?
            .into_iter()
            .filter(|record| record.user_id == request.target_user_id)
            .map(|record| record.key())
            .collect();

        for key in &ringing {
            tx.mark_temporary(*key, CallStatus::Cancelling, now).await?;
        }
        tx.commit().await?;

        tracing::info!(
            chat_id = request.chat_id,
            user_id = request.target_user_id,
            cancelled = ringing.len(),
            "invitation cancelled"
        );
        Ok(ringing.len())
    }
}

/// The inviting device: the explicit token, else the behalf user's live
/// presence in this chat, else a fresh token.
async fn resolve_owner(
    tx: &mut CallStateTx,
    request: &InviteRequest,
) -> Result<(CallKey, Option<String>), StoreError> {
    let presence = tx
        .list_by_chat_and_status(request.chat_id, CallStatus::InCall)
        .await?
        .into_iter()
        .find(|record| {
            record.user_id == request.behalf_user_id
                && request.behalf_token_id.map_or(true, |token| token == record.token_id)
        });

    let token_id = request
        .behalf_token_id
        .or_else(|| presence.as_ref().map(|record| record.token_id))
        .unwrap_or_else(Uuid::new_v4);
    let avatar = request
        .behalf_avatar
        .clone()
        .or_else(|| presence.and_then(|record| record.owner_avatar));

    Ok((CallKey::new(token_id, request.behalf_user_id), avatar))
}

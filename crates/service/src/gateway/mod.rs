// External collaborators: the media server, the chat service and the
// outbound event sink.
//
// Each is a trait so the reconciliation jobs can be driven by scripted
// fakes in tests. All methods return `Send` futures so jobs can run on a
// multi-threaded tokio runtime. Callers wrap every call in `with_deadline`;
// a timed-out call is a failure, never a success.

pub mod chat;
pub mod events;
#[cfg(test)]
pub(crate) mod fake;
pub mod sfu;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use callsync_common::events::CallEvent;
use callsync_common::sfu::SfuParticipant;
use callsync_common::types::{ChatId, UserId};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("failed to sign request: {0}")]
    Auth(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::Decode(error.to_string())
        } else {
            Self::Transport(error.to_string())
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("event transport error: {0}")]
    Transport(String),
    #[error("event sink rejected event with status {0}")]
    Rejected(u16),
    #[error("failed to encode event: {0}")]
    Encode(String),
}

/// Run `call` with a deadline; elapsing maps to [`GatewayError::Timeout`].
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    tokio::time::timeout(deadline, call).await.map_err(|_| GatewayError::Timeout(deadline))?
}

/// Chat facts needed to shape notifications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BasicChatInfo {
    pub tet_a_tet: bool,
    #[serde(default)]
    pub participant_ids: Vec<UserId>,
}

/// Human-readable name of `chat_id` as `user_id` should see it in an invite.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InviteName {
    pub user_id: UserId,
    pub name: String,
}

/// The real-time media server.
pub trait SfuGateway: Send + Sync + 'static {
    /// Names of every live room.
    fn list_rooms(&self) -> impl Future<Output = Result<Vec<String>, GatewayError>> + Send;

    /// Participants currently connected to `room`.
    fn list_participants(
        &self,
        room: &str,
    ) -> impl Future<Output = Result<Vec<SfuParticipant>, GatewayError>> + Send;

    /// Disconnect `identity` from `room`.
    fn remove_participant(
        &self,
        room: &str,
        identity: &str,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;
}

/// Access control and naming, owned by the chat service.
pub trait ChatAccessGateway: Send + Sync + 'static {
    fn check_access(
        &self,
        user_id: UserId,
        chat_id: ChatId,
    ) -> impl Future<Output = Result<bool, GatewayError>> + Send;

    fn basic_chat_info(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> impl Future<Output = Result<BasicChatInfo, GatewayError>> + Send;

    fn chat_names_for_invite(
        &self,
        chat_id: ChatId,
        owner_id: UserId,
        user_ids: &[UserId],
    ) -> impl Future<Output = Result<Vec<InviteName>, GatewayError>> + Send;
}

/// Fire-and-forget outbound event sink.
pub trait EventPublisher: Send + Sync + 'static {
    fn publish(&self, event: CallEvent) -> impl Future<Output = Result<(), PublishError>> + Send;
}

impl<T: SfuGateway> SfuGateway for Arc<T> {
    async fn list_rooms(&self) -> Result<Vec<String>, GatewayError> {
        (**self).list_rooms().await
    }

    async fn list_participants(&self, room: &str) -> Result<Vec<SfuParticipant>, GatewayError> {
        (**self).list_participants(room).await
    }

    async fn remove_participant(&self, room: &str, identity: &str) -> Result<(), GatewayError> {
        (**self).remove_participant(room, identity).await
    }
}

impl<T: ChatAccessGateway> ChatAccessGateway for Arc<T> {
    async fn check_access(&self, user_id: UserId, chat_id: ChatId) -> Result<bool, GatewayError> {
        (**self).check_access(user_id, chat_id).await
    }

    async fn basic_chat_info(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<BasicChatInfo, GatewayError> {
        (**self).basic_chat_info(chat_id, user_id).await
    }

    async fn chat_names_for_invite(
        &self,
        chat_id: ChatId,
        owner_id: UserId,
        user_ids: &[UserId],
    ) -> Result<Vec<InviteName>, GatewayError> {
        (**self).chat_names_for_invite(chat_id, owner_id, user_ids).await
    }
}

impl<T: EventPublisher> EventPublisher for Arc<T> {
    async fn publish(&self, event: CallEvent) -> Result<(), PublishError> {
        (**self).publish(event).await
    }
}

/// Publish without surfacing failure; the next cycle re-emits current state.
pub async fn emit<P: EventPublisher>(publisher: &P, event: CallEvent) {
    let kind = event.kind();
    if let Err(error) = publisher.publish(event).await {
        tracing::warn!(event = kind, %error, "failed to publish call event");
    }
}

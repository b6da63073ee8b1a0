// Outbound call events published to the notification sink.

use serde::{Deserialize, Serialize};

use crate::types::{CallStatus, ChatId, UserId};

/// Status of one dialed participant inside a [`CallEvent::DialStatusChanged`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DialStatus {
    pub user_id: UserId,
    pub status: CallStatus,
}

/// All event kinds emitted by call-state reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    /// Per chat and owner: who is being dialed and where each dial stands.
    #[serde(rename_all = "camelCase")]
    DialStatusChanged {
        chat_id: ChatId,
        owner_id: UserId,
        owner_avatar: Option<String>,
        tet_a_tet: bool,
        dials: Vec<DialStatus>,
    },

    /// Addressed to a single callee: "`owner_id` is calling you in `chat_name`".
    #[serde(rename_all = "camelCase")]
    CallInvitation {
        chat_id: ChatId,
        user_id: UserId,
        owner_id: UserId,
        owner_avatar: Option<String>,
        chat_name: String,
        status: CallStatus,
    },

    /// A user appeared in or disappeared from the media server.
    #[serde(rename_all = "camelCase")]
    UserCallStatusChanged { user_id: UserId, is_in_video: bool },
}

impl CallEvent {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::DialStatusChanged { .. } => "dial_status_changed",
            Self::CallInvitation { .. } => "call_invitation",
            Self::UserCallStatusChanged { .. } => "user_call_status_changed",
        }
    }

    pub fn in_video(user_id: UserId, is_in_video: bool) -> Self {
        Self::UserCallStatusChanged { user_id, is_in_video }
    }
}

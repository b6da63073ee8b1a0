// Call-state domain types shared across all callsync crates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ChatId = i64;
pub type UserId = i64;
pub type TokenId = Uuid;

/// Lifecycle status of a call-state record.
///
/// `NotFound` is never persisted; it is what a lookup reports when no row
/// exists for a key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum CallStatus {
    BeingInvited,
    InCall,
    Cancelling,
    Removing,
    NotFound,
}

impl CallStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BeingInvited => "beingInvited",
            Self::InCall => "inCall",
            Self::Cancelling => "cancelling",
            Self::Removing => "removing",
            Self::NotFound => "notFound",
        }
    }

    /// Whether a row in this status may be replaced by an invite or entry.
    pub const fn is_overridable(self) -> bool {
        matches!(self, Self::NotFound | Self::Cancelling | Self::Removing)
    }

    /// Temporary statuses are reaped by the dialer after `MarkedForRemoveAt`.
    pub const fn is_temporary(self) -> bool {
        matches!(self, Self::Cancelling | Self::Removing)
    }

    /// Ordering used when several tokens of one user collapse into a single
    /// status: the most "live" status wins.
    pub const fn precedence(self) -> u8 {
        match self {
            Self::InCall => 4,
            Self::BeingInvited => 3,
            Self::Cancelling => 2,
            Self::Removing => 1,
            Self::NotFound => 0,
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown call status '{0}'")]
pub struct UnknownCallStatus(pub String);

impl FromStr for CallStatus {
    type Err = UnknownCallStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "beingInvited" => Ok(Self::BeingInvited),
            "inCall" => Ok(Self::InCall),
            "cancelling" => Ok(Self::Cancelling),
            "removing" => Ok(Self::Removing),
            "notFound" => Ok(Self::NotFound),
            other => Err(UnknownCallStatus(other.to_owned())),
        }
    }
}

/// Primary key of a call-state record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct CallKey {
    pub token_id: TokenId,
    pub user_id: UserId,
}

impl CallKey {
    pub const fn new(token_id: TokenId, user_id: UserId) -> Self {
        Self { token_id, user_id }
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.token_id)
    }
}

/// The inviting side of an invitation row.
pub type CallOwner = CallKey;

/// One row of call membership: "this token of this user relates to this
/// chat's call in this way".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallStateRecord {
    pub token_id: TokenId,
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub token_taken: bool,
    /// Set iff the row is (or was) an invitation.
    pub owner: Option<CallOwner>,
    pub status: CallStatus,
    pub chat_tet_a_tet: bool,
    pub owner_avatar: Option<String>,
    pub marked_for_remove_at: Option<DateTime<Utc>>,
    /// Only meaningful while `status == InCall`.
    pub marked_for_orphan_remove_attempt: i32,
    pub create_date_time: DateTime<Utc>,
}

impl CallStateRecord {
    /// A fresh invitation of `key` into `chat_id`, dialed by `owner`.
    pub fn invitation(
        key: CallKey,
        chat_id: ChatId,
        owner: CallOwner,
        owner_avatar: Option<String>,
        chat_tet_a_tet: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            token_id: key.token_id,
            user_id: key.user_id,
            chat_id,
            token_taken: false,
            owner: Some(owner),
            status: CallStatus::BeingInvited,
            chat_tet_a_tet,
            owner_avatar,
            marked_for_remove_at: None,
            marked_for_orphan_remove_attempt: 0,
            create_date_time: now,
        }
    }

    /// A self-initiated presence row: the user is in the call on their own.
    pub fn presence(
        key: CallKey,
        chat_id: ChatId,
        avatar: Option<String>,
        chat_tet_a_tet: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            token_id: key.token_id,
            user_id: key.user_id,
            chat_id,
            token_taken: true,
            owner: None,
            status: CallStatus::InCall,
            chat_tet_a_tet,
            owner_avatar: avatar,
            marked_for_remove_at: None,
            marked_for_orphan_remove_attempt: 0,
            create_date_time: now,
        }
    }

    pub fn key(&self) -> CallKey {
        CallKey::new(self.token_id, self.user_id)
    }

    /// The user on whose behalf this row is dialed. Rows without an owner
    /// belong to their own user.
    pub fn effective_owner(&self) -> UserId {
        self.owner.map_or(self.user_id, |owner| owner.user_id)
    }

    pub fn is_owned_by(&self, key: CallKey) -> bool {
        self.owner == Some(key)
    }

    /// A `cancelling`/`removing` row older than `after` since it was marked.
    pub fn temporary_expired(&self, now: DateTime<Utc>, after: Duration) -> bool {
        if !self.status.is_temporary() {
            return false;
        }
        match self.marked_for_remove_at {
            Some(marked_at) => now - marked_at > after,
            // A temporary row that was never marked cannot be aged; treat the
            // creation time as the mark.
            None => now - self.create_date_time > after,
        }
    }

    /// A `beingInvited` row that has rung longer than `after`.
    pub fn dangling(&self, now: DateTime<Utc>, after: Duration) -> bool {
        self.status == CallStatus::BeingInvited && now - self.create_date_time > after
    }
}

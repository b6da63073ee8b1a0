// Media-server naming and participant metadata.
//
// Every chat maps to exactly one SFU room named `chat{chat_id}`. Human
// participants carry a JSON metadata blob identifying the call-state row
// they belong to; anything without decodable metadata (recorders, egress
// bots) is not a human and is ignored by reconciliation.

use serde::{Deserialize, Serialize};

use crate::types::{CallKey, ChatId, TokenId, UserId};

pub const ROOM_PREFIX: &str = "chat";

pub fn room_name_for_chat(chat_id: ChatId) -> String {
    format!("{ROOM_PREFIX}{chat_id}")
}

/// Inverse of [`room_name_for_chat`]. Rooms not created for a chat yield `None`.
pub fn chat_id_from_room_name(room_name: &str) -> Option<ChatId> {
    let digits = room_name.strip_prefix(ROOM_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Metadata attached to each human participant when their join token is minted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantMetadata {
    pub token_id: TokenId,
    pub user_id: UserId,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl ParticipantMetadata {
    pub fn decode(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn key(&self) -> CallKey {
        CallKey::new(self.token_id, self.user_id)
    }
}

/// A participant as listed by the media server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SfuParticipant {
    pub identity: String,
    #[serde(default)]
    pub metadata: Option<String>,
}

impl SfuParticipant {
    /// Decoded metadata, or `None` for non-human participants.
    pub fn human(&self) -> Option<ParticipantMetadata> {
        self.metadata.as_deref().and_then(ParticipantMetadata::decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn room_name_round_trips() {
        assert_eq!(room_name_for_chat(1), "chat1");
        assert_eq!(chat_id_from_room_name("chat1"), Some(1));
        assert_eq!(chat_id_from_room_name("chat4200"), Some(4200));
    }

    #[test]
    fn foreign_room_names_are_rejected() {
        assert_eq!(chat_id_from_room_name("chat"), None);
        assert_eq!(chat_id_from_room_name("lobby"), None);
        assert_eq!(chat_id_from_room_name("chat-1"), None);
        assert_eq!(chat_id_from_room_name("chat1a"), None);
    }

    #[test]
    fn metadata_decodes_human_participant() {
        let token_id = Uuid::new_v4();
        let participant = SfuParticipant {
            identity: "3_web".into(),
            metadata: Some(format!(
                r#"{{"tokenId":"{token_id}","userId":3,"login":"carol","avatar":null}}"#
            )),
        };

        let metadata = participant.human().expect("participant should be human");
        assert_eq!(metadata.key(), CallKey::new(token_id, 3));
        assert_eq!(metadata.login, "carol");
    }

    #[test]
    fn missing_or_malformed_metadata_is_not_human() {
        let bot = SfuParticipant { identity: "egress".into(), metadata: None };
        let blank = SfuParticipant { identity: "x".into(), metadata: Some("  ".into()) };
        let garbage = SfuParticipant { identity: "y".into(), metadata: Some("{not json".into()) };
        let partial = SfuParticipant { identity: "z".into(), metadata: Some(r#"{"userId":3}"#.into()) };

        assert!(bot.human().is_none());
        assert!(blank.human().is_none());
        assert!(garbage.human().is_none());
        assert!(partial.human().is_none());
    }
}

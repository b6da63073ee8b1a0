// Scripted in-process gateways for unit tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use callsync_common::events::CallEvent;
use callsync_common::sfu::{room_name_for_chat, ParticipantMetadata, SfuParticipant};
use callsync_common::types::{CallKey, ChatId, UserId};

use super::{
    BasicChatInfo, ChatAccessGateway, EventPublisher, GatewayError, InviteName, PublishError,
    SfuGateway,
};

#[derive(Default)]
pub struct FakeChat {
    denied: Mutex<HashSet<(UserId, ChatId)>>,
    tet_a_tet: AtomicBool,
    fail_names: AtomicBool,
    fail_access: AtomicBool,
    pub name_calls: AtomicUsize,
}

impl FakeChat {
    pub fn deny(&self, user_id: UserId, chat_id: ChatId) {
        self.denied.lock().unwrap().insert((user_id, chat_id));
    }

    pub fn set_tet_a_tet(&self, value: bool) {
        self.tet_a_tet.store(value, Ordering::SeqCst);
    }

    pub fn fail_names(&self, value: bool) {
        self.fail_names.store(value, Ordering::SeqCst);
    }

    pub fn fail_access(&self, value: bool) {
        self.fail_access.store(value, Ordering::SeqCst);
    }
}

impl ChatAccessGateway for FakeChat {
    async fn check_access(&self, user_id: UserId, chat_id: ChatId) -> Result<bool, GatewayError> {
        if self.fail_access.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("chat service down".into()));
        }
        Ok(!self.denied.lock().unwrap().contains(&(user_id, chat_id)))
    }

    async fn basic_chat_info(
        &self,
        _chat_id: ChatId,
        _user_id: UserId,
    ) -> Result<BasicChatInfo, GatewayError> {
        Ok(BasicChatInfo {
            tet_a_tet: self.tet_a_tet.load(Ordering::SeqCst),
            participant_ids: Vec::new(),
        })
    }

    async fn chat_names_for_invite(
        &self,
        chat_id: ChatId,
        _owner_id: UserId,
        user_ids: &[UserId],
    ) -> Result<Vec<InviteName>, GatewayError> {
        self.name_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_names.load(Ordering::SeqCst) {
            return Err(GatewayError::Status { status: 502, body: "bad gateway".into() });
        }
        Ok(user_ids
            .iter()
            .map(|&user_id| InviteName { user_id, name: format!("chat {chat_id}") })
            .collect())
    }
}

#[derive(Default)]
pub struct FakeSfu {
    rooms: Mutex<BTreeMap<String, Vec<SfuParticipant>>>,
    failing_rooms: Mutex<HashSet<String>>,
    pub removed: Mutex<Vec<(String, String)>>,
}

impl FakeSfu {
    /// Connect `key` to the room of `chat_id` as a human participant.
    pub fn join(&self, chat_id: ChatId, key: CallKey) {
        let metadata = ParticipantMetadata {
            token_id: key.token_id,
            user_id: key.user_id,
            login: format!("user{}", key.user_id),
            avatar: None,
        };
        self.rooms.lock().unwrap().entry(room_name_for_chat(chat_id)).or_default().push(
            SfuParticipant { identity: key.to_string(), metadata: metadata.encode().ok() },
        );
    }

    /// Add a participant with arbitrary (possibly malformed) metadata.
    pub fn join_raw(&self, room: &str, identity: &str, metadata: Option<&str>) {
        self.rooms.lock().unwrap().entry(room.to_owned()).or_default().push(SfuParticipant {
            identity: identity.to_owned(),
            metadata: metadata.map(ToOwned::to_owned),
        });
    }

    pub fn fail_room(&self, chat_id: ChatId) {
        self.failing_rooms.lock().unwrap().insert(room_name_for_chat(chat_id));
    }

    pub fn heal_room(&self, chat_id: ChatId) {
        self.failing_rooms.lock().unwrap().remove(&room_name_for_chat(chat_id));
    }
}

impl SfuGateway for FakeSfu {
    async fn list_rooms(&self) -> Result<Vec<String>, GatewayError> {
        Ok(self.rooms.lock().unwrap().keys().cloned().collect())
    }

    async fn list_participants(&self, room: &str) -> Result<Vec<SfuParticipant>, GatewayError> {
        if self.failing_rooms.lock().unwrap().contains(room) {
            return Err(GatewayError::Status { status: 503, body: "unavailable".into() });
        }
        Ok(self.rooms.lock().unwrap().get(room).cloned().unwrap_or_default())
    }

    async fn remove_participant(&self, room: &str, identity: &str) -> Result<(), GatewayError> {
        if let Some(participants) = self.rooms.lock().unwrap().get_mut(room) {
            participants.retain(|participant| participant.identity != identity);
        }
        self.removed.lock().unwrap().push((room.to_owned(), identity.to_owned()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<CallEvent>>,
}

impl RecordingPublisher {
    pub fn take(&self) -> Vec<CallEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: CallEvent) -> Result<(), PublishError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

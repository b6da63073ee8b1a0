// LiveKit-compatible media server client (Twirp over JSON).
//
// Requests are authenticated with a short-lived HS256 token carrying
// room-list and room-admin grants, signed with the server's API secret.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::Url;

use callsync_common::sfu::SfuParticipant;

use super::{GatewayError, SfuGateway};
use crate::config::SfuConfig;

const ROOM_SERVICE_PATH: &str = "twirp/livekit.RoomService";
const ADMIN_TOKEN_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct VideoGrant {
    room_list: bool,
    room_admin: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    room: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AdminClaims {
    iss: String,
    nbf: u64,
    exp: u64,
    video: VideoGrant,
}

#[derive(Serialize)]
struct ListRoomsRequest {}

#[derive(Deserialize)]
struct ListRoomsResponse {
    #[serde(default)]
    rooms: Vec<Room>,
}

#[derive(Deserialize)]
struct Room {
    name: String,
}

#[derive(Serialize)]
struct ListParticipantsRequest<'a> {
    room: &'a str,
}

#[derive(Deserialize)]
struct ListParticipantsResponse {
    #[serde(default)]
    participants: Vec<SfuParticipant>,
}

#[derive(Serialize)]
struct RemoveParticipantRequest<'a> {
    room: &'a str,
    identity: &'a str,
}

#[derive(Deserialize)]
struct Empty {}

#[derive(Clone)]
pub struct LiveKitGateway {
    http: reqwest::Client,
    service_url: Url,
    api_key: String,
    encoding_key: EncodingKey,
}

impl LiveKitGateway {
    pub fn new(config: &SfuConfig) -> anyhow::Result<Self> {
        let base = Url::parse(&config.url)
            .with_context(|| format!("invalid media server url '{}'", config.url))?;
        let service_url = with_trailing_slash(base)
            .join(&format!("{ROOM_SERVICE_PATH}/"))
            .context("failed to build media server room service url")?;

        Ok(Self {
            http: reqwest::Client::new(),
            service_url,
            api_key: config.api_key.clone(),
            encoding_key: EncodingKey::from_secret(config.api_secret.as_bytes()),
        })
    }

    fn admin_token(&self) -> Result<String, GatewayError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|error| GatewayError::Auth(format!("system clock is before unix epoch: {error}")))?
            .as_secs();
        let claims = AdminClaims {
            iss: self.api_key.clone(),
            nbf: now,
            exp: now + ADMIN_TOKEN_TTL.as_secs(),
            video: VideoGrant { room_list: true, room_admin: true, room: None },
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|error| GatewayError::Auth(error.to_string()))
    }

    async fn call<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp, GatewayError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = self
            .service_url
            .join(method)
            .map_err(|error| GatewayError::Transport(error.to_string()))?;

        let response = self
            .http
            .post(url)
            .bearer_auth(self.admin_token()?)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Status { status: status.as_u16(), body });
        }

        response.json::<Resp>().await.map_err(|error| GatewayError::Decode(error.to_string()))
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

impl SfuGateway for LiveKitGateway {
    async fn list_rooms(&self) -> Result<Vec<String>, GatewayError> {
        let response: ListRoomsResponse = self.call("ListRooms", &ListRoomsRequest {}).await?;
        Ok(response.rooms.into_iter().map(|room| room.name).collect())
    }

    async fn list_participants(&self, room: &str) -> Result<Vec<SfuParticipant>, GatewayError> {
        let response: ListParticipantsResponse =
            self.call("ListParticipants", &ListParticipantsRequest { room }).await?;
        Ok(response.participants)
    }

    async fn remove_participant(&self, room: &str, identity: &str) -> Result<(), GatewayError> {
        let _: Empty =
            self.call("RemoveParticipant", &RemoveParticipantRequest { room, identity }).await?;
        Ok(())
    }
}

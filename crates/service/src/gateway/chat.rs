// Chat service client: access checks, basic chat facts and invite naming.

use anyhow::Context;
use reqwest::StatusCode;
use url::Url;

use callsync_common::types::{ChatId, UserId};

use super::{BasicChatInfo, ChatAccessGateway, GatewayError, InviteName};

#[derive(Clone)]
pub struct HttpChatGateway {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpChatGateway {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let mut base_url =
            Url::parse(base_url).with_context(|| format!("invalid chat service url '{base_url}'"))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { http: reqwest::Client::new(), base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url, GatewayError> {
        self.base_url.join(path).map_err(|error| GatewayError::Transport(error.to_string()))
    }

    fn access_url(&self, user_id: UserId, chat_id: ChatId) -> Result<Url, GatewayError> {
        let mut url = self.endpoint("internal/access")?;
        url.query_pairs_mut()
            .append_pair("userId", &user_id.to_string())
            .append_pair("chatId", &chat_id.to_string());
        Ok(url)
    }

    fn invite_names_url(
        &self,
        chat_id: ChatId,
        owner_id: UserId,
        user_ids: &[UserId],
    ) -> Result<Url, GatewayError> {
        let mut url = self.endpoint("internal/name-for-invite")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("chatId", &chat_id.to_string());
            pairs.append_pair("ownerId", &owner_id.to_string());
            for user_id in user_ids {
                pairs.append_pair("userId", &user_id.to_string());
            }
        }
        Ok(url)
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(GatewayError::Status { status: status.as_u16(), body })
}

impl ChatAccessGateway for HttpChatGateway {
    async fn check_access(&self, user_id: UserId, chat_id: ChatId) -> Result<bool, GatewayError> {
        let response = self.http.get(self.access_url(user_id, chat_id)?).send().await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Ok(false),
            _ => ensure_success(response).await.map(|_| false),
        }
    }

    async fn basic_chat_info(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<BasicChatInfo, GatewayError> {
        let url = self.endpoint(&format!("internal/{chat_id}/basic/{user_id}"))?;
        let response = ensure_success(self.http.get(url).send().await?).await?;
        response.json().await.map_err(|error| GatewayError::Decode(error.to_string()))
    }

    async fn chat_names_for_invite(
        &self,
        chat_id: ChatId,
        owner_id: UserId,
        user_ids: &[UserId],
    ) -> Result<Vec<InviteName>, GatewayError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.invite_names_url(chat_id, owner_id, user_ids)?;
        let response = ensure_success(self.http.get(url).send().await?).await?;
        response.json().await.map_err(|error| GatewayError::Decode(error.to_string()))
    }
}

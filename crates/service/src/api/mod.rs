// HTTP surface for call membership.
//
// Every route under `/v1/chats/{chat_id}/call` runs behind `require_caller`,
// which takes the caller identity from headers set by the upstream auth
// proxy.

pub mod middleware;

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use callsync_common::types::{CallKey, ChatId, TokenId, UserId};

use crate::admission::{InvitationAdmission, InviteOutcome, InviteRequest};
use crate::error::{ErrorCode, ServiceError};
use crate::gateway::{ChatAccessGateway, EventPublisher, SfuGateway};
use crate::membership::{CallMembership, EnterOutcome};

pub use middleware::{apply_middleware, Caller};

/// Request-path services shared by every handler.
pub struct CallServices<C, S, P> {
    pub admission: InvitationAdmission<C>,
    pub membership: CallMembership<C, S, P>,
}

type ApiState<C, S, P> = Arc<CallServices<C, S, P>>;

pub fn router<C, S, P>(services: CallServices<C, S, P>) -> Router
where
    C: ChatAccessGateway,
    S: SfuGateway,
    P: EventPublisher,
{
    let calls = Router::new()
        .route("/v1/chats/{chat_id}/call/invite", put(invite::<C, S, P>))
        .route("/v1/chats/{chat_id}/call/enter", put(enter::<C, S, P>))
        .route("/v1/chats/{chat_id}/call/leave", put(leave::<C, S, P>))
        .route("/v1/chats/{chat_id}/call/decline", put(decline::<C, S, P>))
        .route("/v1/chats/{chat_id}/call/kick", put(kick::<C, S, P>))
        .with_state(Arc::new(services))
        .route_layer(axum::middleware::from_fn(middleware::require_caller));

    apply_middleware(Router::new().route("/healthz", get(healthz)).merge(calls))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InviteQuery {
    user_id: UserId,
    #[serde(default = "default_call")]
    call: bool,
}

const fn default_call() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KickQuery {
    user_id: UserId,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "result", rename_all = "camelCase")]
enum InviteResponse {
    #[serde(rename_all = "camelCase")]
    Invited { token_id: TokenId },
    Cancelled { count: usize },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnterResponse {
    result: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CountResponse {
    count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LeaveResponse {
    left: bool,
}

async fn invite<C, S, P>(
    State(state): State<ApiState<C, S, P>>,
    Extension(caller): Extension<Caller>,
    Path(chat_id): Path<ChatId>,
    Query(query): Query<InviteQuery>,
) -> Result<Json<InviteResponse>, ServiceError>
where
    C: ChatAccessGateway,
    S: SfuGateway,
    P: EventPublisher,
{
    let outcome = state
        .admission
        .invite(InviteRequest {
            behalf_user_id: caller.user_id,
            target_user_id: query.user_id,
            chat_id,
            call: query.call,
            behalf_token_id: caller.token_id,
            behalf_avatar: caller.avatar,
        })
        .await?;

    Ok(Json(match outcome {
        InviteOutcome::Invited(key) => InviteResponse::Invited { token_id: key.token_id },
        InviteOutcome::Cancelled(count) => InviteResponse::Cancelled { count },
    }))
}

fn device_key(caller: &Caller) -> Result<CallKey, ServiceError> {
    caller.token_id.map(|token_id| CallKey::new(token_id, caller.user_id)).ok_or_else(|| {
        ServiceError::new(ErrorCode::ValidationFailed, "x-auth-token-id header is required")
    })
}

async fn enter<C, S, P>(
    State(state): State<ApiState<C, S, P>>,
    Extension(caller): Extension<Caller>,
    Path(chat_id): Path<ChatId>,
) -> Result<Json<EnterResponse>, ServiceError>
where
    C: ChatAccessGateway,
    S: SfuGateway,
    P: EventPublisher,
{
    let key = device_key(&caller)?;
    let outcome = state.membership.enter(key, chat_id, caller.avatar).await?;
    let result = match outcome {
        EnterOutcome::Answered => "answered",
        EnterOutcome::Joined => "joined",
        EnterOutcome::AlreadyInCall => "alreadyInCall",
    };
    Ok(Json(EnterResponse { result }))
}

async fn leave<C, S, P>(
    State(state): State<ApiState<C, S, P>>,
    Extension(caller): Extension<Caller>,
    Path(_chat_id): Path<ChatId>,
) -> Result<Json<LeaveResponse>, ServiceError>
where
    C: ChatAccessGateway,
    S: SfuGateway,
    P: EventPublisher,
{
    let key = device_key(&caller)?;
    let left = state.membership.leave(key).await?;
    Ok(Json(LeaveResponse { left }))
}

async fn decline<C, S, P>(
    State(state): State<ApiState<C, S, P>>,
    Extension(caller): Extension<Caller>,
    Path(chat_id): Path<ChatId>,
) -> Result<Json<CountResponse>, ServiceError>
where
    C: ChatAccessGateway,
    S: SfuGateway,
    P: EventPublisher,
{
    let count = state.membership.decline(caller.user_id, chat_id).await?;
    Ok(Json(CountResponse { count }))
}

async fn kick<C, S, P>(
    State(state): State<ApiState<C, S, P>>,
    Extension(caller): Extension<Caller>,
    Path(chat_id): Path<ChatId>,
    Query(query): Query<KickQuery>,
) -> Result<Json<CountResponse>, ServiceError>
where
    C: ChatAccessGateway,
    S: SfuGateway,
    P: EventPublisher,
{
    let count = state.membership.kick(caller.user_id, query.user_id, chat_id).await?;
    Ok(Json(CountResponse { count }))
}

use std::time::Instant;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Request},
    http::HeaderMap,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use tracing::{error, info};
use uuid::Uuid;

use callsync_common::types::{TokenId, UserId};

use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
    ErrorCode, ServiceError,
};

pub const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

pub const USER_ID_HEADER: &str = "x-auth-userid";
pub const TOKEN_ID_HEADER: &str = "x-auth-token-id";
pub const AVATAR_HEADER: &str = "x-auth-avatar";

/// Caller identity as asserted by the upstream auth proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: UserId,
    pub token_id: Option<TokenId>,
    pub avatar: Option<String>,
}

impl Caller {
    fn from_headers(headers: &HeaderMap) -> Result<Self, &'static str> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };

        let user_id = header(USER_ID_HEADER)
            .ok_or("missing caller user id")?
            .parse::<UserId>()
            .map_err(|_| "caller user id is not a number")?;
        let token_id = header(TOKEN_ID_HEADER)
            .map(|raw| raw.parse::<Uuid>().map_err(|_| "caller token id is not a uuid"))
            .transpose()?;
        let avatar = header(AVATAR_HEADER).map(ToOwned::to_owned);

        Ok(Self { user_id, token_id, avatar })
    }
}

pub async fn require_caller(mut request: Request, next: Next) -> Response {
    match Caller::from_headers(request.headers()) {
        Ok(caller) => {
            request.extensions_mut().insert(caller);
            next.run(request).await
        }
        Err(message) => ServiceError::new(ErrorCode::Unauthorized, message).into_response(),
    }
}

pub fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            ServiceError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}

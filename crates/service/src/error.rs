use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::admission::AdmissionError;
use crate::membership::MembershipError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    InternalError,
    UpstreamUnavailable,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::InternalError => "INTERNAL_ERROR",
            Self::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, Self::InternalError | Self::UpstreamUnavailable)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "request validation failed",
            Self::Unauthorized => "caller identity is missing or invalid",
            Self::Forbidden => "caller or target has no access to this chat",
            Self::NotFound => "requested resource not found",
            Self::Conflict => "user is already in a call or being invited",
            Self::InternalError => "internal server error",
            Self::UpstreamUnavailable => "an upstream service is unavailable",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceError {
    code: ErrorCode,
    message: String,
    details: Value,
    request_id: Option<String>,
}

impl ServiceError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: json!({}), request_id: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn from_status(status: StatusCode, message: impl Into<String>) -> Self {
        Self::new(default_code_for_status(status), message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub const fn code(&self) -> ErrorCode {
        self.code
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let request_id = self.request_id.or_else(current_request_id);

        let mut response = (
            self.code.status(),
            Json(json!({
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                    "request_id": request_id.clone(),
                    "details": self.details,
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

impl From<AdmissionError> for ServiceError {
    fn from(error: AdmissionError) -> Self {
        match error {
            AdmissionError::Unauthorized { user_id, chat_id } => {
                Self::from_code(ErrorCode::Forbidden)
                    .with_details(json!({ "user_id": user_id, "chat_id": chat_id }))
            }
            AdmissionError::Conflict { user_id, status } => Self::from_code(ErrorCode::Conflict)
                .with_details(json!({ "user_id": user_id, "status": status.as_str() })),
            AdmissionError::Upstream(error) => {
                tracing::warn!(%error, "chat access check failed");
                Self::from_code(ErrorCode::UpstreamUnavailable)
            }
            AdmissionError::Store(error) => {
                tracing::error!(%error, "call-state store failed during admission");
                Self::from_code(ErrorCode::InternalError)
            }
        }
    }
}

impl From<MembershipError> for ServiceError {
    fn from(error: MembershipError) -> Self {
        match error {
            MembershipError::Unauthorized { user_id, chat_id } => {
                Self::from_code(ErrorCode::Forbidden)
                    .with_details(json!({ "user_id": user_id, "chat_id": chat_id }))
            }
            MembershipError::Conflict { user_id, chat_id, status } => {
                Self::from_code(ErrorCode::Conflict).with_details(
                    json!({ "user_id": user_id, "chat_id": chat_id, "status": status.as_str() }),
                )
            }
            MembershipError::Upstream(error) => {
                tracing::warn!(%error, "upstream call failed during membership change");
                Self::from_code(ErrorCode::UpstreamUnavailable)
            }
            MembershipError::Store(error) => {
                tracing::error!(%error, "call-state store failed during membership change");
                Self::from_code(ErrorCode::InternalError)
            }
        }
    }
}

pub fn default_code_for_status(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::BAD_REQUEST => ErrorCode::ValidationFailed,
        StatusCode::UNAUTHORIZED => ErrorCode::Unauthorized,
        StatusCode::FORBIDDEN => ErrorCode::Forbidden,
        StatusCode::NOT_FOUND => ErrorCode::NotFound,
        StatusCode::CONFLICT => ErrorCode::Conflict,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            ErrorCode::UpstreamUnavailable
        }
        _ => ErrorCode::InternalError,
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::to_bytes, http::StatusCode, response::IntoResponse};
    use serde_json::Value;

    use super::{default_code_for_status, with_request_id_scope, ErrorCode, ServiceError};
    use crate::admission::AdmissionError;
    use crate::membership::MembershipError;
    use callsync_common::types::CallStatus;

    async fn body_json(response: axum::response::Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("error response body should be readable");
        serde_json::from_slice(&body).expect("error response body should be valid json")
    }

    #[tokio::test]
    async fn service_error_uses_scoped_request_id() {
        let response = with_request_id_scope("req-scoped-123".to_owned(), async {
            ServiceError::from_code(ErrorCode::InternalError).into_response()
        })
        .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get(super::REQUEST_ID_HEADER).and_then(|v| v.to_str().ok()),
            Some("req-scoped-123")
        );
        let parsed = body_json(response).await;

        assert_eq!(parsed["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(parsed["error"]["retryable"], true);
        assert_eq!(parsed["error"]["request_id"], "req-scoped-123");
        assert_eq!(parsed["error"]["details"], serde_json::json!({}));
    }

    #[test]
    fn status_code_mapping_matches_registry_defaults() {
        assert_eq!(default_code_for_status(StatusCode::BAD_REQUEST), ErrorCode::ValidationFailed);
        assert_eq!(default_code_for_status(StatusCode::CONFLICT), ErrorCode::Conflict);
        assert_eq!(
            default_code_for_status(StatusCode::GATEWAY_TIMEOUT),
            ErrorCode::UpstreamUnavailable
        );
        assert_eq!(
            default_code_for_status(StatusCode::INTERNAL_SERVER_ERROR),
            ErrorCode::InternalError
        );
    }

    #[tokio::test]
    async fn conflict_is_not_retryable_and_carries_status() {
        let error: ServiceError =
            AdmissionError::Conflict { user_id: 2, status: CallStatus::BeingInvited }.into();
        assert_eq!(error.code(), ErrorCode::Conflict);

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["retryable"], false);
        assert_eq!(parsed["error"]["details"]["status"], "beingInvited");
        assert_eq!(parsed["error"]["details"]["user_id"], 2);
    }

    #[tokio::test]
    async fn membership_conflict_names_the_other_chat() {
        let error: ServiceError =
            MembershipError::Conflict { user_id: 2, chat_id: 99, status: CallStatus::InCall }
                .into();
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["details"]["chat_id"], 99);
        assert_eq!(parsed["error"]["details"]["status"], "inCall");
    }

    #[tokio::test]
    async fn unauthorized_admission_maps_to_forbidden() {
        let error: ServiceError = AdmissionError::Unauthorized { user_id: 9, chat_id: 4 }.into();
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["code"], "FORBIDDEN");
        assert_eq!(parsed["error"]["details"]["chat_id"], 4);
    }

    #[tokio::test]
    async fn explicit_request_id_overrides_scope() {
        let response = with_request_id_scope("req-scoped-123".to_owned(), async {
            ServiceError::from_code(ErrorCode::Forbidden)
                .with_request_id("req-explicit-456")
                .into_response()
        })
        .await;

        let parsed = body_json(response).await;
        assert_eq!(parsed["error"]["request_id"], "req-explicit-456");
    }
}

//! Request credentials and the HTTP face of engine errors.

use ad4m_core::CoreError;
use axum::{
    extract::{FromRequestParts, Query},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

/// Errors surfaced by route handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing authorization token")]
    MissingToken,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingToken => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Core(err) => match err {
                CoreError::InvalidToken(_) | CoreError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
                CoreError::Unauthorized { .. } => StatusCode::FORBIDDEN,
                CoreError::NotFound(_) | CoreError::AdapterNotFound(_) => StatusCode::NOT_FOUND,
                CoreError::CodeAlreadyUsed | CoreError::CodeExpired => StatusCode::GONE,
                CoreError::AdapterFailure { .. } => StatusCode::BAD_GATEWAY,
                CoreError::AdapterBusy(_)
                | CoreError::AlreadyShared(_)
                | CoreError::LinkLanguageInUse { .. }
                | CoreError::RequestNotPending(_)
                | CoreError::AgentAlreadyInitialized
                | CoreError::AgentNotInitialized
                | CoreError::AgentLocked => StatusCode::CONFLICT,
                CoreError::InvalidAddress(_) | CoreError::InvalidLink(_) | CoreError::Serialization(_) => {
                    StatusCode::BAD_REQUEST
                }
                CoreError::SubscriberOverflow | CoreError::Persistence(_) | CoreError::Crypto(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                CoreError::PairingCodesExhausted => StatusCode::SERVICE_UNAVAILABLE,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// The caller's credential: a capability JWT or the admin credential.
///
/// Read from `Authorization: Bearer`, or from a `token` query parameter
/// for WebSocket clients that cannot set headers.
#[derive(Debug, Clone)]
pub struct Credential(pub String);

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn extract_bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

impl<S> FromRequestParts<S> for Credential
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(token) = extract_bearer_token(parts) {
            return Ok(Credential(token.trim().to_string()));
        }
        Query::<TokenQuery>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(q)| q.token)
            .filter(|t| !t.is_empty())
            .map(Credential)
            .ok_or(ApiError::MissingToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn credential(request: Request<()>) -> Result<Credential, ApiError> {
        let (mut parts, _) = request.into_parts();
        Credential::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_bearer_header_then_query() {
        let header = Request::builder()
            .uri("/api/perspectives?token=ignored")
            .header("authorization", "Bearer abc")
            .body(())
            .unwrap();
        assert_eq!(credential(header).await.unwrap().0, "abc");

        let query = Request::builder().uri("/ws/subscribe/linkAdded?token=xyz").body(()).unwrap();
        assert_eq!(credential(query).await.unwrap().0, "xyz");

        let none = Request::builder().uri("/api/perspectives").body(()).unwrap();
        assert!(matches!(credential(none).await, Err(ApiError::MissingToken)));
    }

    #[test]
    fn test_status_mapping() {
        let status = |e: CoreError| ApiError::from(e).status();
        assert_eq!(status(CoreError::unauthorized("perspective", "p", "READ")), StatusCode::FORBIDDEN);
        assert_eq!(status(CoreError::InvalidToken("bad".into())), StatusCode::UNAUTHORIZED);
        assert_eq!(status(CoreError::AuthenticationFailed), StatusCode::UNAUTHORIZED);
        assert_eq!(status(CoreError::AdapterNotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status(CoreError::CodeAlreadyUsed), StatusCode::GONE);
        assert_eq!(status(CoreError::CodeExpired), StatusCode::GONE);
        assert_eq!(
            status(CoreError::adapter_for_language("notes", "unreachable")),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(ApiError::MissingToken.status(), StatusCode::UNAUTHORIZED);
    }
}

//! WebSocket handler for runner connections

use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use tracing::{info, warn};

use super::registry::{RunnerHandle, SessionChannels};
use super::session::RunnerSession;
use super::status::{DenyReason, DENY_REASON_HEADER};
use crate::state::AppState;

/// Query parameters for the WebSocket connection
#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub name: String,
}

/// WebSocket upgrade handler
pub async fn runner_ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let (handle, channels) = match admit(&state, &headers, &query.name).await {
        Ok(admitted) => admitted,
        Err(response) => return response,
    };

    let dispatcher = Arc::clone(state.dispatcher());
    let session = RunnerSession::new(
        Arc::clone(&handle),
        channels,
        Arc::clone(&dispatcher),
        state.session_config().clone(),
    );

    ws.on_failed_upgrade({
        let dispatcher = Arc::clone(&dispatcher);
        let name = handle.name().to_string();
        move |err| {
            warn!("WebSocket upgrade for runner {} failed: {}", name, err);
            tokio::spawn(async move { dispatcher.remove_runner(&name).await });
        }
    })
    .on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        session.run(sink, stream).await;
    })
    .into_response()
}

/// Check the credentials and claim the name for a connecting runner
async fn admit(
    state: &AppState,
    headers: &HeaderMap,
    name: &str,
) -> Result<(Arc<RunnerHandle>, SessionChannels), Response> {
    let token = extract_bearer_token(headers).unwrap_or_default();
    if !state.token_matches(token) {
        warn!("Rejected runner {}: invalid token", name);
        return Err(deny(DenyReason::TokenInvalid));
    }

    let name = name.trim();
    if name.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Runner name must not be empty").into_response());
    }

    let (handle, channels) = RunnerHandle::new(name);
    if !state.dispatcher().add_runner(Arc::clone(&handle)).await {
        return Err(deny(DenyReason::NameAlreadyUsed));
    }

    info!("Accepted runner {}", name);
    Ok((handle, channels))
}

fn deny(reason: DenyReason) -> Response {
    (
        reason.status_code(),
        [(DENY_REASON_HEADER, reason.header_value())],
        reason.header_value(),
    )
        .into_response()
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::build_test_state;
    use axum::http::HeaderValue;

    fn bearer(token: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static(token));
        headers
    }

    #[test]
    fn extracts_bearer_token() {
        let headers = bearer("Bearer secret-token");
        assert_eq!(extract_bearer_token(&headers), Some("secret-token"));
    }

    #[test]
    fn rejects_when_authorization_header_missing() {
        assert!(extract_bearer_token(&HeaderMap::new()).is_none());
    }

    #[test]
    fn rejects_when_scheme_is_not_bearer() {
        assert!(extract_bearer_token(&bearer("Basic secret-token")).is_none());
    }

    #[tokio::test]
    async fn test_admit_rejects_bad_token() {
        let (state, _temp_dir) = build_test_state().await;

        for headers in [bearer("Bearer wrong"), HeaderMap::new()] {
            let response = admit(&state, &headers, "runner-1").await.err().unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(
                response.headers().get(DENY_REASON_HEADER).unwrap(),
                "TOKEN_INVALID"
            );
        }
        assert!(state.dispatcher().list_runners().await.is_empty());
    }

    #[tokio::test]
    async fn test_admit_rejects_taken_name() {
        let (state, _temp_dir) = build_test_state().await;
        let headers = bearer("Bearer secret");

        let (handle, _channels) = admit(&state, &headers, "runner-1").await.unwrap();
        assert_eq!(handle.name(), "runner-1");

        let response = admit(&state, &headers, "runner-1").await.err().unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers().get(DENY_REASON_HEADER).unwrap(),
            "NAME_ALREADY_USED"
        );

        let runners = state.dispatcher().list_runners().await;
        assert_eq!(runners.len(), 1);
    }

    #[tokio::test]
    async fn test_admit_rejects_empty_name() {
        let (state, _temp_dir) = build_test_state().await;
        let response = admit(&state, &bearer("Bearer secret"), "  ").await.err().unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_admitted_name_is_trimmed_and_released_by_handle_name() {
        let (state, _temp_dir) = build_test_state().await;
        let headers = bearer("Bearer secret");

        let (handle, _channels) = admit(&state, &headers, " runner-1 ").await.unwrap();
        assert_eq!(handle.name(), "runner-1");

        // Removing by the raw query name would leave the runner registered
        state.dispatcher().remove_runner(" runner-1 ").await;
        assert_eq!(state.dispatcher().list_runners().await.len(), 1);

        state.dispatcher().remove_runner(handle.name()).await;
        assert!(state.dispatcher().list_runners().await.is_empty());
        assert!(admit(&state, &headers, "runner-1").await.is_ok());
    }
}

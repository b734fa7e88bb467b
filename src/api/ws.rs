// vigil: Subscription upgrade endpoint

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::header;
use axum::http::HeaderMap;
use axum::response::Response;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::alerts::engine::AlertCommands;
use crate::api::rest::{authorize, ApiError, AppState};
use crate::error::CoreError;
use crate::hub::protocol::{Envelope, MessageType};
use crate::hub::{session, SubscriberHandle};

/// Upgrade a duplex session after token authentication
///
/// The token arrives as a `token` query parameter (browser clients cannot
/// set headers on the upgrade request) or a bearer header.
pub async fn upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let token = params
        .get("token")
        .map(|t| t.as_str())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|h| h.strip_prefix("Bearer "))
        })
        .ok_or_else(|| ApiError(CoreError::Unauthorized("missing token".to_string())))?;

    let user = authorize(&state, token)?;
    let session_id = Uuid::new_v4();
    info!(session = %session_id, user = %user.username, "Subscription accepted");

    Ok(ws.on_upgrade(move |socket| async move {
        let handle = SubscriberHandle::new(session_id, user.username, user.role);
        let initial = initial_state(&state);
        session::run_session(socket, handle, state.hub.clone(), initial).await;
    }))
}

/// Snapshot sent as the first envelope of every session
fn initial_state(state: &AppState) -> Envelope {
    Envelope::new(
        MessageType::InitialState,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "active_alerts": state.engine.status(),
            "metrics": state.registry.overview(),
            "subscribers": state.hub.subscriber_count(),
        }),
    )
}

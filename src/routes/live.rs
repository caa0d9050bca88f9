use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::clock::new_id;
use crate::db::models::{SyncChange, SyncOperation};
use crate::error::{AppError, AppResult};
use crate::protocol::{Envelope, MessageAction, MessageKind};
use crate::services::auth::AuthService;
use crate::services::registry::{SessionHandle, SessionMessage, SESSION_BUFFER};
use crate::services::sync::{ChangeStatus, PresenceStatus, SyncPullRequest};
use crate::AppState;

/// Live transport handshake. The bearer token comes from the
/// `Authorization` header or the `token` query parameter; an unverifiable
/// token rejects the upgrade with an unauthorized status.
pub async fn live_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> AppResult<impl IntoResponse> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(AuthService::bearer_token)
        .map(str::to_string)
        .or_else(|| params.get("token").cloned())
        .ok_or(AppError::Unauthorized)?;

    let claims = AuthService::decode_jwt(&state.config.jwt.secret, &token)?;
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Ok(ws.on_upgrade(move |socket| handle_session(state, socket, claims.sub, user_agent, addr)))
}

async fn handle_session(
    state: Arc<AppState>,
    socket: WebSocket,
    user_id: String,
    user_agent: Option<String>,
    addr: SocketAddr,
) {
    let session_id = new_id();
    let (tx, mut rx) = mpsc::channel::<SessionMessage>(SESSION_BUFFER);

    if let Err(e) = state.registry.attach(SessionHandle {
        session_id: session_id.clone(),
        user_id: user_id.clone(),
        sender: tx,
        user_agent,
        remote_addr: Some(addr.to_string()),
    }) {
        tracing::info!("Refusing session for user {}: {:?}", user_id, e);
        let mut socket = socket;
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::AGAIN,
                reason: "server shutting down".into(),
            })))
            .await;
        return;
    }

    tracing::info!("Session {} opened for user {}", session_id, user_id);
    state
        .sync
        .broadcast_presence(&user_id, PresenceStatus::Online, None);

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: drains the registry-facing channel onto the socket. Ends on
    // transport error or an explicit close instruction.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message {
                SessionMessage::Envelope(envelope) => {
                    let Ok(text) = serde_json::to_string(&envelope) else {
                        continue;
                    };
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                SessionMessage::Close { reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::AWAY,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Reader: every inbound frame counts as activity.
    while let Some(frame) = ws_rx.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("Session {} transport error: {:?}", session_id, e);
                break;
            }
        };

        match frame {
            Message::Text(text) => {
                state.registry.touch(&session_id);
                handle_envelope(&state, &session_id, &user_id, &text).await;
            }
            Message::Ping(_) | Message::Pong(_) => state.registry.touch(&session_id),
            Message::Close(_) => break,
            Message::Binary(_) => {
                tracing::debug!("Session {} sent unsupported binary frame", session_id);
            }
        }
    }

    state.registry.begin_close(&session_id);
    if state.registry.detach(&session_id).is_some() {
        let status = if state.registry.active_device_count(&user_id) == 0 {
            PresenceStatus::Offline
        } else {
            PresenceStatus::Online
        };
        state.sync.broadcast_presence(&user_id, status, None);
    }
    writer.abort();
    tracing::info!("Session {} closed for user {}", session_id, user_id);
}

async fn handle_envelope(state: &Arc<AppState>, session_id: &str, user_id: &str, text: &str) {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::debug!("Session {} sent malformed envelope: {}", session_id, e);
            let reply = Envelope::server(
                MessageKind::System,
                MessageAction::Error,
                serde_json::json!({ "code": "BAD_REQUEST", "message": "malformed message" }),
            );
            state.registry.send_to_session(session_id, reply);
            return;
        }
    };

    match envelope.action {
        MessageAction::Ping => {
            state
                .registry
                .send_to_session(session_id, Envelope::pong(&envelope.id));
        }
        MessageAction::Pong => {
            // touch already happened for this frame
        }
        MessageAction::Subscribe => {
            let channel = envelope.payload["channel"].as_str().unwrap_or_default();
            match state.sync.subscribe(session_id, user_id, channel).await {
                Ok(room) => {
                    let ack = Envelope::ack(
                        &envelope.id,
                        serde_json::json!({ "channel": room, "subscribed": true }),
                    );
                    state.registry.send_to_session(session_id, ack);
                }
                Err(e) => send_error(state, session_id, &envelope.id, &e),
            }
        }
        MessageAction::Unsubscribe => {
            let channel = envelope.payload["channel"].as_str().unwrap_or_default();
            match state.sync.unsubscribe(session_id, channel) {
                Ok(room) => {
                    let ack = Envelope::ack(
                        &envelope.id,
                        serde_json::json!({ "channel": room, "subscribed": false }),
                    );
                    state.registry.send_to_session(session_id, ack);
                }
                Err(e) => send_error(state, session_id, &envelope.id, &e),
            }
        }
        MessageAction::Sync => {
            let request: SyncPullRequest = match serde_json::from_value(envelope.payload.clone()) {
                Ok(request) => request,
                Err(e) => {
                    let err = AppError::BadRequest(format!("invalid sync payload: {e}"));
                    send_error(state, session_id, &envelope.id, &err);
                    return;
                }
            };

            match state.sync.sync_pull(user_id, Some(session_id), request).await {
                Ok(response) => {
                    let reply = Envelope::server(
                        MessageKind::Sync,
                        MessageAction::Sync,
                        serde_json::to_value(&response).unwrap_or_default(),
                    )
                    .with_correlation(&envelope.id);
                    state.registry.send_to_session(session_id, reply);
                }
                Err(e) => send_error(state, session_id, &envelope.id, &e),
            }
        }
        MessageAction::Presence => {
            let status: PresenceStatus =
                serde_json::from_value(envelope.payload["status"].clone())
                    .unwrap_or(PresenceStatus::Online);
            let activity = envelope.payload["currentActivity"].as_str();
            state.sync.broadcast_presence(user_id, status, activity);
        }
        MessageAction::Create | MessageAction::Update | MessageAction::Delete => {
            handle_data_mutation(state, session_id, user_id, &envelope).await;
        }
        MessageAction::Ack | MessageAction::Error => {
            // Client-side acknowledgements need no reply.
        }
    }
}

/// A `data` create/update/delete intent. The envelope id doubles as the
/// change id, which keeps client retries idempotent.
async fn handle_data_mutation(
    state: &Arc<AppState>,
    session_id: &str,
    user_id: &str,
    envelope: &Envelope,
) {
    let Some(change) = change_from_envelope(envelope) else {
        let err = AppError::BadRequest("missing entityKind or entity id".to_string());
        send_error(state, session_id, &envelope.id, &err);
        return;
    };

    let device_id = envelope.payload["deviceId"]
        .as_str()
        .unwrap_or(session_id)
        .to_string();

    let result = state
        .sync
        .apply_and_broadcast(user_id, &device_id, Some(session_id), &change)
        .await;

    match result.status {
        ChangeStatus::Accepted => {
            let ack = Envelope::ack(
                &envelope.id,
                serde_json::json!({ "success": true, "changeId": result.change_id }),
            );
            state.registry.send_to_session(session_id, ack);
        }
        status => {
            let reply = Envelope::server(
                MessageKind::System,
                MessageAction::Error,
                serde_json::json!({
                    "changeId": result.change_id,
                    "status": status,
                    "message": result.error,
                }),
            )
            .with_correlation(&envelope.id);
            state.registry.send_to_session(session_id, reply);
        }
    }
}

fn change_from_envelope(envelope: &Envelope) -> Option<SyncChange> {
    let payload = envelope.payload.as_object()?;

    let operation = match envelope.action {
        MessageAction::Create => SyncOperation::Create,
        MessageAction::Update => SyncOperation::Update,
        MessageAction::Delete => SyncOperation::Delete,
        _ => return None,
    };

    let entity_kind = payload.get("entityKind")?.as_str()?.to_string();
    let entity_id = payload
        .get("entityId")
        .or_else(|| payload.get("id"))?
        .as_str()?
        .to_string();

    // The change body is either an explicit `payload` object or the
    // envelope payload minus the routing fields.
    let change_payload = match payload.get("payload") {
        Some(value) => value.clone(),
        None => {
            let mut map = payload.clone();
            for key in ["entityKind", "entityId", "id", "deviceId"] {
                map.remove(key);
            }
            serde_json::Value::Object(map)
        }
    };

    Some(SyncChange {
        change_id: envelope.id.clone(),
        entity_kind,
        entity_id,
        operation,
        payload: change_payload,
        client_timestamp_ms: envelope.timestamp.timestamp_millis(),
    })
}

fn send_error(state: &Arc<AppState>, session_id: &str, correlation_id: &str, error: &AppError) {
    let code = match error {
        AppError::Unauthorized => "UNAUTHORIZED",
        AppError::Forbidden => "FORBIDDEN",
        AppError::NotFound(_) => "NOT_FOUND",
        AppError::BadRequest(_) => "BAD_REQUEST",
        AppError::Conflict(_) => "CONFLICT",
        _ => "INTERNAL_ERROR",
    };
    let reply = Envelope::error(correlation_id, code, &error.to_string());
    state.registry.send_to_session(session_id, reply);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn data_envelope(action: MessageAction, payload: serde_json::Value) -> Envelope {
        Envelope {
            id: "m-1".to_string(),
            kind: MessageKind::Data,
            action,
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
            user_id: None,
        }
    }

    #[test]
    fn mutation_parses_with_explicit_payload() {
        let envelope = data_envelope(
            MessageAction::Update,
            serde_json::json!({
                "entityKind": "entry",
                "entityId": "E1",
                "payload": { "title": "x" },
                "deviceId": "dev-a"
            }),
        );

        let change = change_from_envelope(&envelope).unwrap();
        assert_eq!(change.change_id, "m-1");
        assert_eq!(change.entity_id, "E1");
        assert_eq!(change.operation, SyncOperation::Update);
        assert_eq!(change.payload["title"], "x");
    }

    #[test]
    fn mutation_parses_with_inline_fields() {
        let envelope = data_envelope(
            MessageAction::Update,
            serde_json::json!({
                "entityKind": "entry",
                "id": "E1",
                "title": "x"
            }),
        );

        let change = change_from_envelope(&envelope).unwrap();
        assert_eq!(change.entity_id, "E1");
        assert_eq!(change.payload, serde_json::json!({ "title": "x" }));
    }

    #[test]
    fn mutation_requires_entity_routing_fields() {
        let envelope = data_envelope(
            MessageAction::Create,
            serde_json::json!({ "title": "x" }),
        );
        assert!(change_from_envelope(&envelope).is_none());

        let ping = data_envelope(MessageAction::Ping, serde_json::json!({}));
        assert!(change_from_envelope(&ping).is_none());
    }
}

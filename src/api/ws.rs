use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::eventbus::ConnectionId;

use super::routes::{ApiError, ApiState};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Client frames:
/// `{"type": "subscribe"|"unsubscribe"|"ping", "room_id": "..."}`,
/// with rooms `execution:<id>`, `workflow:<id>`, `user:<id>`.
/// Server frames carry `{type, event, data, timestamp}`.
#[derive(Debug, Deserialize)]
struct ClientMessage {
    #[serde(rename = "type")]
    kind: String,
    room_id: Option<String>,
}

/// GET /ws?token=...
///
/// The bearer token rides the query string because browsers cannot set
/// headers on a socket upgrade. Authentication failures close the
/// request before the upgrade.
pub async fn ws_handler(
    State(state): State<ApiState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let token = query.token.ok_or_else(ApiError::unauthorized)?;
    let user_id = state
        .verifier
        .verify(&token)
        .await
        .ok_or_else(ApiError::unauthorized)?;

    Ok(ws.on_upgrade(move |socket| handle_socket(state, socket, user_id)))
}

async fn handle_socket(state: ApiState, mut socket: WebSocket, user_id: Uuid) {
    let (connection_id, mut outbound) = state.bus.connect(user_id);

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let Some(message) = queued else { break };
                if socket.send(Message::Text(message.to_string())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&state, connection_id, user_id, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        log::debug!("ws receive error on {connection_id}: {err}");
                        break;
                    }
                }
            }
        }
    }

    state.bus.disconnect(connection_id);
}

async fn handle_client_message(
    state: &ApiState,
    connection_id: ConnectionId,
    user_id: Uuid,
    text: &str,
) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(_) => {
            state.bus.send_personal(
                connection_id,
                json!({ "type": "error", "message": "invalid JSON format" }),
            );
            return;
        }
    };

    match message.kind.as_str() {
        "subscribe" => {
            let Some(room_id) = message.room_id else {
                state.bus.send_personal(
                    connection_id,
                    json!({ "type": "error", "message": "room_id is required" }),
                );
                return;
            };
            if validate_room_access(state, &room_id, user_id).await {
                state.bus.subscribe(connection_id, &room_id);
            } else {
                state.bus.send_personal(
                    connection_id,
                    json!({
                        "type": "error",
                        "message": "access denied to room",
                        "room_id": room_id,
                    }),
                );
            }
        }
        "unsubscribe" => {
            if let Some(room_id) = message.room_id {
                state.bus.unsubscribe(connection_id, &room_id);
            }
        }
        "ping" => state.bus.ping(connection_id),
        other => {
            state.bus.send_personal(
                connection_id,
                json!({
                    "type": "error",
                    "message": format!("unknown message type: {other}"),
                }),
            );
        }
    }
}

/// Room ACL: execution and workflow rooms require ownership of the
/// underlying record, user rooms must match the principal. Denials are
/// indistinguishable from missing records.
async fn validate_room_access(state: &ApiState, room: &str, user_id: Uuid) -> bool {
    let Some((namespace, raw_id)) = room.split_once(':') else {
        return false;
    };

    match namespace {
        "execution" => match raw_id.parse::<Uuid>() {
            Ok(execution_id) => state
                .store
                .get_execution(execution_id, user_id)
                .await
                .is_ok(),
            Err(_) => false,
        },
        "workflow" => match raw_id.parse::<Uuid>() {
            Ok(workflow_id) => state.provider.get(workflow_id, user_id).await.is_ok(),
            Err(_) => false,
        },
        "user" => raw_id.parse::<Uuid>() == Ok(user_id),
        _ => false,
    }
}

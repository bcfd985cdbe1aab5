//! Relay WebSocket handler: session establishment and the frame loop.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        Extension, Query, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use murmur_types::{ClientFrame, ConnectionInfo, MessageAdded, MessageRole, ServerFrame};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::registry::SESSION_BUFFER;
use crate::AppState;

/// Upper bound on one token verification. A slow identity provider must not
/// stall the accept path.
const TOKEN_VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Query parameters for the relay WebSocket connection.
#[derive(Debug, Deserialize)]
pub struct ChatConnectParams {
    pub token: Option<String>,
    pub config_id: Option<String>,
}

/// WebSocket handler: `GET /chat?token=<bearer>&config_id=<optional>`.
///
/// A missing token is `400`; a token that fails verification (or verifies to
/// an empty subject, or takes longer than [`TOKEN_VERIFY_TIMEOUT`]) is `403`.
/// On success a session row is persisted before the upgrade completes, so
/// the `chat_metadata` frame always names an existing session.
pub async fn chat_handler(
    Extension(state): Extension<Arc<AppState>>,
    ws: WebSocketUpgrade,
    Query(params): Query<ChatConnectParams>,
) -> impl IntoResponse {
    let Some(token) = params.token.filter(|t| !t.is_empty()) else {
        tracing::warn!("websocket connect missing token");
        return StatusCode::BAD_REQUEST.into_response();
    };

    let verified = tokio::time::timeout(TOKEN_VERIFY_TIMEOUT, state.identity.verify_token(&token))
        .await;
    let user_id = match verified {
        Ok(Ok(claims)) => claims.sub,
        Ok(Err(e)) => {
            tracing::warn!("websocket token verification failed: {}", e);
            return StatusCode::FORBIDDEN.into_response();
        }
        Err(_) => {
            tracing::warn!("websocket token verification timed out");
            return StatusCode::FORBIDDEN.into_response();
        }
    };

    // The session's correlation group defaults to the user id.
    let session_id = state.store.create_session(&user_id, Some(&user_id)).await;

    tracing::info!(user_id = %user_id, session_id = %session_id, "websocket auth success");

    let info = ConnectionInfo {
        user_id,
        session_id,
        config_id: params.config_id,
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, info))
}

/// Sends a JSON-serialized server frame over the session's sender channel.
fn send_frame(tx: &mpsc::Sender<String>, frame: &ServerFrame) {
    match serde_json::to_string(frame) {
        Ok(json) => {
            if let Err(e) = tx.try_send(json) {
                tracing::warn!("failed to queue frame for client: {}", e);
            }
        }
        Err(e) => {
            tracing::error!("failed to serialize server frame: {}", e);
        }
    }
}

/// Handles the WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, info: ConnectionInfo) {
    let conn_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();

    // Bounded channel per session; slow consumers get frames dropped rather
    // than backing up the relay.
    let (tx, mut rx) = mpsc::channel::<String>(SESSION_BUFFER);

    state.registry.admit(&info.user_id, conn_id, tx.clone()).await;

    // Forward queued frames to the socket.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(AxumMessage::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // First frame on every connection: the session coordinates.
    send_frame(
        &tx,
        &ServerFrame::ChatMetadata {
            chat_id: info.session_id.clone(),
            chat_group_id: info.user_id.clone(),
        },
    );

    while let Some(Ok(msg)) = receiver.next().await {
        if let AxumMessage::Text(text) = msg {
            let text = text.to_string();
            match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => {
                    handle_frame(&state, &info, &tx, frame).await;
                    // Every well-formed frame also reaches the user's other
                    // live connections, byte for byte.
                    state.registry.fan_out(&info.user_id, &text, conn_id).await;
                }
                Err(e) => {
                    tracing::warn!(
                        user_id = %info.user_id,
                        "failed to parse incoming frame: {}",
                        e
                    );
                    send_frame(
                        &tx,
                        &ServerFrame::Error {
                            message: "invalid message format".to_string(),
                        },
                    );
                }
            }
        } else if let AxumMessage::Close(_) = msg {
            break;
        }
    }

    state.registry.remove(&info.user_id, conn_id).await;
    send_task.abort();
    tracing::info!(
        user_id = %info.user_id,
        session_id = %info.session_id,
        "websocket session closed"
    );
}

/// Applies one inbound frame: text content is persisted and acknowledged,
/// audio and settings frames are relay-only.
async fn handle_frame(
    state: &AppState,
    info: &ConnectionInfo,
    tx: &mpsc::Sender<String>,
    frame: ClientFrame,
) {
    match frame {
        ClientFrame::ChatMessage { content, role } => {
            persist_and_ack(state, info, tx, content, role).await;
        }
        ClientFrame::UserInput { text } => {
            persist_and_ack(state, info, tx, text, MessageRole::User).await;
        }
        ClientFrame::SessionSettings { audio } => {
            tracing::debug!(
                session_id = %info.session_id,
                channels = audio.channels,
                sample_rate = audio.sample_rate,
                encoding = %audio.encoding,
                "session audio settings declared"
            );
        }
        ClientFrame::AudioInput { data, interim } => {
            tracing::trace!(
                session_id = %info.session_id,
                bytes = data.len(),
                interim,
                "audio block relayed"
            );
        }
    }
}

async fn persist_and_ack(
    state: &AppState,
    info: &ConnectionInfo,
    tx: &mpsc::Sender<String>,
    content: String,
    role: MessageRole,
) {
    let message_id = state
        .store
        .add_message(&info.session_id, &content, role)
        .await;
    send_frame(
        tx,
        &ServerFrame::MessageAdded {
            data: MessageAdded {
                message_id,
                session_id: info.session_id.clone(),
                content,
                role,
            },
        },
    );
}

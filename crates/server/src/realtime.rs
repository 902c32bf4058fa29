use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use shared::{
    domain::{ConversationId, UserId},
    error::{ApiError, ErrorCode},
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::{api::status_for, app_state::AppState};

#[derive(Debug, Deserialize)]
pub(crate) struct RealtimeQuery {
    user_id: i64,
    conversation_id: i64,
}

/// Subscribes a member to row changes of one conversation's calls.
pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<RealtimeQuery>,
) -> Response {
    let user_id = UserId(q.user_id);
    let conversation_id = ConversationId(q.conversation_id);
    let member = match state
        .engine
        .storage
        .is_conversation_member(conversation_id, user_id)
        .await
    {
        Ok(member) => member,
        Err(e) => {
            let err = ApiError::new(ErrorCode::StoreUnavailable, e.to_string());
            return (status_for(err.code), Json(err)).into_response();
        }
    };
    if !member {
        let err = ApiError::new(
            ErrorCode::Forbidden,
            "user is not a member of the conversation",
        );
        return (status_for(err.code), Json(err)).into_response();
    }

    ws.on_upgrade(move |socket| ws_connection(state, socket, user_id, conversation_id))
}

async fn ws_connection(
    state: Arc<AppState>,
    socket: WebSocket,
    user_id: UserId,
    conversation_id: ConversationId,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.events.subscribe();
    info!(
        user_id = user_id.0,
        conversation_id = conversation_id.0,
        "realtime: subscribed"
    );

    let send_task = tokio::spawn(async move {
        loop {
            let event = match events_rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    // Dropped changes cannot be replayed; make the client resubscribe and re-read.
                    warn!(
                        user_id = user_id.0,
                        conversation_id = conversation_id.0,
                        skipped,
                        "realtime: subscriber lagged, closing"
                    );
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                Err(RecvError::Closed) => break,
            };
            if event.conversation_id() != conversation_id {
                continue;
            }
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        if matches!(msg, Message::Close(_)) {
            break;
        }
    }

    send_task.abort();
    debug!(
        user_id = user_id.0,
        conversation_id = conversation_id.0,
        "realtime: unsubscribed"
    );
}

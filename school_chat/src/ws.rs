use crate::api::AppState;
use crate::auth::{self, Claims};
use crate::conversations;
use crate::error::{close_code, ChatError};
use crate::fanout::Event;
use crate::model::UserRecord;
use crate::protocol::{self, Inbound, OutboundFrame};
use crate::registry::{ConnectionHandle, Outgoing, PushResult, Registry};
use crate::store;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.token, None))
}

/// Socket variant that pre-subscribes to one conversation and starts the
/// session with its unread snapshot.
pub async fn ws_conversation_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.token, Some(conversation_id)))
}

/// Close silently dead connections. A client that lost its network without a
/// close frame stops answering pings; once it has missed enough beats the
/// reaper pushes a close and the connection task tears itself down.
pub fn spawn_heartbeat_reaper(
    registry: Arc<Registry>,
    interval: Duration,
    deadline: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            for conn in registry.all() {
                if conn.idle_for() > deadline {
                    tracing::warn!(user_id = %conn.user_id, connection = %conn.id, "heartbeat timeout, closing connection");
                    conn.close(close_code::UNRESPONSIVE, "heartbeat_timeout");
                }
            }
        }
    })
}

fn push_frame(handle: &ConnectionHandle, frame: &OutboundFrame) {
    if handle.queue.push_frame(frame.to_text(), frame.essential()) == PushResult::Overflow {
        handle.close(close_code::UNRESPONSIVE, "unresponsive");
    }
}

fn push_error(handle: &ConnectionHandle, e: &ChatError) {
    push_frame(
        handle,
        &OutboundFrame::Error {
            code: e.code().into(),
            message: e.to_string(),
        },
    );
}

fn note_malformed(handle: &ConnectionHandle, count: &mut u32, threshold: u32) {
    *count += 1;
    push_frame(
        handle,
        &OutboundFrame::Error {
            code: "malformed_frame".into(),
            message: "frame could not be decoded".into(),
        },
    );
    if *count >= threshold {
        tracing::warn!(connection = %handle.id, "malformed frame threshold exceeded");
        handle.close(close_code::PROTOCOL_ABUSE, "protocol_abuse");
    }
}

/// Resolve the caller's identity from the query token or an
/// `authentication` frame arriving within the grace window.
async fn authenticate(
    state: &AppState,
    token: Option<String>,
    stream: &mut SplitStream<WebSocket>,
) -> Result<Claims, ChatError> {
    if let Some(token) = token {
        return auth::verify_jwt(&state.jwt_secret, &token);
    }
    let waited = tokio::time::timeout(state.config.auth_grace(), async {
        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                WsMessage::Text(text) => {
                    return match serde_json::from_str::<Inbound>(&text) {
                        Ok(Inbound::Authentication { token }) => Some(token),
                        _ => None,
                    };
                }
                WsMessage::Close(_) => return None,
                _ => continue,
            }
        }
        None
    })
    .await;
    match waited {
        Err(_) => Err(ChatError::AuthTimeout),
        Ok(Some(token)) => auth::verify_jwt(&state.jwt_secret, &token),
        Ok(None) => Err(ChatError::Unauthorized),
    }
}

async fn close_now(sink: &mut SplitSink<WebSocket, WsMessage>, code: u16, reason: &'static str) {
    let _ = sink
        .send(WsMessage::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    token: Option<String>,
    pre_subscribe: Option<Uuid>,
) {
    let (mut sink, mut stream) = socket.split();

    let claims = match authenticate(&state, token, &mut stream).await {
        Ok(claims) => claims,
        Err(e) => {
            let code = match e {
                ChatError::AuthTimeout => close_code::AUTH_TIMEOUT,
                _ => close_code::UNAUTHORIZED,
            };
            tracing::warn!(reason = e.code(), "websocket authentication failed");
            close_now(&mut sink, code, e.code()).await;
            return;
        }
    };
    let user = claims.to_user();
    {
        let mirror = user.clone();
        if let Err(e) = state
            .store
            .write(move |conn| store::upsert_user(conn, &mirror))
            .await
        {
            tracing::error!(error = %e, "could not mirror user, refusing connection");
            close_now(&mut sink, 1011, "internal_error").await;
            return;
        }
    }

    let became_online = state.presence.connect(&user.id);
    let handle = state.registry.register(&user.id);
    tracing::info!(user_id = %user.id, connection = %handle.id, "client connected");
    if became_online {
        let (status, last_seen) = state.presence.status_of(&user.id);
        state
            .emit(Event::Presence {
                user_id: user.id.clone(),
                status,
                last_seen,
            })
            .await;
    }

    if let Some(conversation_id) = pre_subscribe {
        let uid = user.id.clone();
        match state
            .store
            .read(move |conn| conversations::snapshot(conn, &conversation_id, &uid))
            .await
        {
            Ok((unread_count, total_messages)) => push_frame(
                &handle,
                &OutboundFrame::Snapshot {
                    conversation_id,
                    unread_count,
                    total_messages,
                },
            ),
            Err(e) => {
                push_error(&handle, &e);
                handle.close(close_code::NOT_A_PARTICIPANT, "not_a_participant");
            }
        }
    }

    // Writer: drains the send queue until it is closed, then emits the close
    // frame chosen by whoever closed it (eviction, reaper, abuse, teardown).
    let writer_queue = handle.clone();
    let mut writer_task = tokio::spawn(async move {
        while let Some(item) = writer_queue.queue.pop().await {
            match item {
                Outgoing::Frame { text, .. } => {
                    if sink.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outgoing::Close { code, reason } => {
                    let _ = sink
                        .send(WsMessage::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    let threshold = state.config.malformed_frame_threshold;
    let mut malformed: u32 = 0;
    loop {
        tokio::select! {
            _ = &mut writer_task => break,
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    handle.touch();
                    state.presence.heartbeat(&user.id);
                    match serde_json::from_str::<Inbound>(&text) {
                        Ok(frame) => handle_frame(&state, &user, &handle, frame).await,
                        Err(_) => note_malformed(&handle, &mut malformed, threshold),
                    }
                }
                Some(Ok(WsMessage::Binary(_))) => {
                    handle.touch();
                    state.presence.heartbeat(&user.id);
                    note_malformed(&handle, &mut malformed, threshold);
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {
                    handle.touch();
                    state.presence.heartbeat(&user.id);
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(connection = %handle.id, error = %e, "socket error");
                    break;
                }
            }
        }
    }

    // Teardown: deregister before the connection counts as closed. The
    // store operations already dispatched above are unaffected.
    handle.close(1000, "closing");
    if tokio::time::timeout(Duration::from_secs(5), &mut writer_task)
        .await
        .is_err()
    {
        writer_task.abort();
    }
    state.registry.deregister(&user.id, handle.id);
    if state.presence.disconnect(&user.id) {
        let (status, last_seen) = state.presence.status_of(&user.id);
        state
            .emit(Event::Presence {
                user_id: user.id.clone(),
                status,
                last_seen,
            })
            .await;
    }
    tracing::info!(user_id = %user.id, connection = %handle.id, "client disconnected");
}

async fn handle_frame(
    state: &AppState,
    user: &UserRecord,
    handle: &Arc<ConnectionHandle>,
    frame: Inbound,
) {
    match frame {
        Inbound::Authentication { .. } => {
            push_frame(
                handle,
                &OutboundFrame::Error {
                    code: "already_authenticated".into(),
                    message: "connection is already authenticated".into(),
                },
            );
        }
        Inbound::Ping { .. } => {
            push_frame(
                handle,
                &OutboundFrame::Pong {
                    timestamp: protocol::now_rfc3339(),
                },
            );
        }
        Inbound::Message {
            conversation_id,
            content,
            message_type,
            reply_to,
            client_key,
        } => {
            // the accepted message comes back through fan-out, which also
            // serves as the sender's ack carrying the server-assigned id
            if let Err(e) = state
                .accept_message(user, conversation_id, content, message_type, reply_to, client_key)
                .await
            {
                push_error(handle, &e);
            }
        }
        Inbound::MessageTyping { conversation_id } => {
            if let Err(e) = state.accept_typing(&user.id, conversation_id).await {
                push_error(handle, &e);
            }
        }
        Inbound::MessageRead {
            message_id,
            conversation_id,
        } => {
            if let Err(e) = state
                .accept_mark_read(&user.id, conversation_id, Some(message_id))
                .await
            {
                push_error(handle, &e);
            }
        }
        Inbound::Status { status } => {
            state.accept_status(&user.id, status).await;
        }
    }
}

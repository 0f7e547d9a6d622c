use crate::error::close_code;
use crate::messages;
use crate::model::{Message, OnlineStatus};
use crate::protocol::OutboundFrame;
use crate::registry::{PushResult, Registry};
use crate::store::Store;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A persisted (or purely transient) event ready for delivery.
///
/// The store side finishes before any of these are produced, so a slow or
/// dead recipient can never unwind an accepted message.
#[derive(Debug)]
pub enum Event {
    Message {
        message: Message,
        participants: Vec<String>,
    },
    MessageUpdated {
        message: Message,
        participants: Vec<String>,
    },
    MessageDeleted {
        conversation_id: Uuid,
        message_id: Uuid,
        participants: Vec<String>,
    },
    Typing {
        conversation_id: Uuid,
        user_id: String,
        participants: Vec<String>,
    },
    Read {
        conversation_id: Uuid,
        message_id: Option<Uuid>,
        user_id: String,
        read_at: i64,
        participants: Vec<String>,
    },
    Presence {
        user_id: String,
        status: OnlineStatus,
        last_seen: i64,
    },
}

pub fn spawn_dispatcher(
    registry: Arc<Registry>,
    store: Arc<Store>,
    mut rx: mpsc::Receiver<Event>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            dispatch(&registry, &store, event).await;
        }
    })
}

/// Push one frame to some users' connections. Delivery per connection is
/// independent; one stuck socket never blocks the rest.
fn push_to(registry: &Registry, users: &[String], except: Option<&str>, frame: &OutboundFrame) {
    let text = frame.to_text();
    let essential = frame.essential();
    for user in users {
        if except == Some(user.as_str()) {
            continue;
        }
        for conn in registry.connections_for(user) {
            match conn.queue.push_frame(text.clone(), essential) {
                PushResult::Queued => {}
                PushResult::Dropped => {
                    tracing::debug!(user_id = %user, connection = %conn.id, "shed best-effort frame");
                }
                PushResult::Overflow => {
                    tracing::warn!(user_id = %user, connection = %conn.id, "send queue full, closing connection");
                    conn.close(close_code::UNRESPONSIVE, "unresponsive");
                }
            }
        }
    }
}

async fn dispatch(registry: &Registry, store: &Store, event: Event) {
    match event {
        Event::Message {
            message,
            participants,
        } => {
            let text = OutboundFrame::Message {
                message: message.clone(),
            }
            .to_text();
            let mut delivered = false;
            for user in &participants {
                for conn in registry.connections_for(user) {
                    match conn.queue.push_frame(text.clone(), true) {
                        PushResult::Queued => {
                            if user != &message.sender_id {
                                delivered = true;
                            }
                        }
                        PushResult::Dropped => {}
                        PushResult::Overflow => {
                            tracing::warn!(user_id = %user, connection = %conn.id, "send queue full, closing connection");
                            conn.close(close_code::UNRESPONSIVE, "unresponsive");
                        }
                    }
                }
            }
            if delivered {
                let id = message.id;
                if let Err(e) = store
                    .write(move |conn| messages::mark_delivered(conn, &id).map(|_| ()))
                    .await
                {
                    tracing::warn!(message_id = %id, error = %e, "could not record delivery");
                }
            }
        }
        Event::MessageUpdated {
            message,
            participants,
        } => {
            push_to(
                registry,
                &participants,
                None,
                &OutboundFrame::MessageUpdated { message },
            );
        }
        Event::MessageDeleted {
            conversation_id,
            message_id,
            participants,
        } => {
            push_to(
                registry,
                &participants,
                None,
                &OutboundFrame::MessageDeleted {
                    conversation_id,
                    message_id,
                },
            );
        }
        Event::Typing {
            conversation_id,
            user_id,
            participants,
        } => {
            push_to(
                registry,
                &participants,
                Some(user_id.as_str()),
                &OutboundFrame::MessageTyping {
                    conversation_id,
                    user_id: user_id.clone(),
                },
            );
        }
        Event::Read {
            conversation_id,
            message_id,
            user_id,
            read_at,
            participants,
        } => {
            push_to(
                registry,
                &participants,
                Some(user_id.as_str()),
                &OutboundFrame::MessageRead {
                    conversation_id,
                    message_id,
                    user_id: user_id.clone(),
                    read_at,
                },
            );
        }
        Event::Presence {
            user_id,
            status,
            last_seen,
        } => {
            let frame = OutboundFrame::Presence {
                user_id,
                status,
                last_seen,
            };
            let text = frame.to_text();
            for conn in registry.all() {
                if conn.queue.push_frame(text.clone(), false) == PushResult::Overflow {
                    conn.close(close_code::UNRESPONSIVE, "unresponsive");
                }
            }
        }
    }
}

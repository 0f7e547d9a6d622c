use crate::error::close_code;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use uuid::Uuid;

/// One item waiting to leave through a connection's socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Frame { text: String, essential: bool },
    Close { code: u16, reason: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    Queued,
    /// Best-effort frame dropped because the queue is full.
    Dropped,
    /// An essential frame could not be queued; the connection is beyond help.
    Overflow,
}

struct QueueState {
    items: VecDeque<Outgoing>,
    closed: bool,
}

/// Bounded outbound queue between the dispatcher and one socket writer.
///
/// When full, the oldest best-effort frame gives way. Essential frames are
/// never discarded here; if nothing can be evicted the push reports
/// `Overflow` and the caller closes the connection instead.
pub struct SendQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn push_frame(&self, text: String, essential: bool) -> PushResult {
        {
            let mut state = self.state.lock();
            if state.closed {
                return PushResult::Dropped;
            }
            if state.items.len() >= self.capacity {
                let victim = state
                    .items
                    .iter()
                    .position(|o| matches!(o, Outgoing::Frame { essential: false, .. }));
                match victim {
                    Some(i) => {
                        state.items.remove(i);
                    }
                    None if essential => return PushResult::Overflow,
                    None => return PushResult::Dropped,
                }
            }
            state.items.push_back(Outgoing::Frame { text, essential });
        }
        self.notify.notify_one();
        PushResult::Queued
    }

    /// Append a close frame and refuse everything after it.
    pub fn close(&self, code: u16, reason: &'static str) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.items.push_back(Outgoing::Close { code, reason });
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Next item for the writer; None once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Outgoing> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }
}

/// A live socket as the rest of the service sees it.
pub struct ConnectionHandle {
    pub id: Uuid,
    pub user_id: String,
    pub queue: SendQueue,
    last_seen: Mutex<Instant>,
}

impl ConnectionHandle {
    /// Stamp liveness on any sign of life from the client.
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    pub fn close(&self, code: u16, reason: &'static str) {
        self.queue.close(code, reason);
    }
}

/// In-memory map of user id to live connections, shared by every handler.
///
/// Multi-device use is expected, so the device limit evicts the oldest
/// connection rather than rejecting the new one.
pub struct Registry {
    inner: Mutex<HashMap<String, Vec<Arc<ConnectionHandle>>>>,
    device_limit: usize,
    queue_capacity: usize,
}

impl Registry {
    pub fn new(device_limit: usize, queue_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            device_limit,
            queue_capacity,
        }
    }

    pub fn register(&self, user_id: &str) -> Arc<ConnectionHandle> {
        let handle = Arc::new(ConnectionHandle {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            queue: SendQueue::new(self.queue_capacity),
            last_seen: Mutex::new(Instant::now()),
        });
        let evicted = {
            let mut guard = self.inner.lock();
            let conns = guard.entry(user_id.to_string()).or_default();
            conns.push(handle.clone());
            if conns.len() > self.device_limit {
                Some(conns.remove(0))
            } else {
                None
            }
        };
        if let Some(old) = evicted {
            tracing::info!(user_id, connection = %old.id, "device limit reached, evicting oldest connection");
            old.close(close_code::CONNECTION_EVICTED, "connection_evicted");
        }
        handle
    }

    /// Remove a connection. Returns true when it was the user's last one.
    pub fn deregister(&self, user_id: &str, connection_id: Uuid) -> bool {
        let mut guard = self.inner.lock();
        let Some(conns) = guard.get_mut(user_id) else {
            return false;
        };
        conns.retain(|c| c.id != connection_id);
        if conns.is_empty() {
            guard.remove(user_id);
            true
        } else {
            false
        }
    }

    pub fn connections_for(&self, user_id: &str) -> Vec<Arc<ConnectionHandle>> {
        self.inner
            .lock()
            .get(user_id)
            .map(|v| v.to_vec())
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<Arc<ConnectionHandle>> {
        self.inner.lock().values().flatten().cloned().collect()
    }

    pub fn count_for(&self, user_id: &str) -> usize {
        self.inner.lock().get(user_id).map_or(0, |v| v.len())
    }
}

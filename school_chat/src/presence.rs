use crate::model::OnlineStatus;
use parking_lot::Mutex;
use std::collections::HashMap;
use time::OffsetDateTime;

struct Entry {
    connections: usize,
    status: OnlineStatus,
    last_seen: i64,
}

/// Tracks availability per user across all of their devices.
///
/// A user is online from the first accepted connection until the last one
/// goes away; away/busy are explicit client choices layered on top and never
/// touch the connection count.
pub struct PresenceTracker {
    inner: Mutex<HashMap<String, Entry>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn now() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }

    /// Register a connection. Returns true if the user transitioned to online.
    pub fn connect(&self, user_id: &str) -> bool {
        let mut guard = self.inner.lock();
        let entry = guard.entry(user_id.to_string()).or_insert(Entry {
            connections: 0,
            status: OnlineStatus::Offline,
            last_seen: 0,
        });
        entry.connections += 1;
        entry.last_seen = Self::now();
        if entry.connections == 1 {
            entry.status = OnlineStatus::Online;
            true
        } else {
            false
        }
    }

    /// Deregister a connection. Returns true if the user transitioned to offline.
    pub fn disconnect(&self, user_id: &str) -> bool {
        let mut guard = self.inner.lock();
        let Some(entry) = guard.get_mut(user_id) else {
            return false;
        };
        entry.connections = entry.connections.saturating_sub(1);
        entry.last_seen = Self::now();
        if entry.connections == 0 {
            entry.status = OnlineStatus::Offline;
            true
        } else {
            false
        }
    }

    /// Explicit status change from the client. Offline cannot be requested;
    /// it is derived from connections. Returns the applied status.
    pub fn set_status(&self, user_id: &str, status: OnlineStatus) -> Option<OnlineStatus> {
        if status == OnlineStatus::Offline {
            return None;
        }
        let mut guard = self.inner.lock();
        let entry = guard.get_mut(user_id)?;
        if entry.connections == 0 {
            return None;
        }
        entry.status = status;
        entry.last_seen = Self::now();
        Some(status)
    }

    /// Stamp activity from a heartbeat or any inbound frame.
    pub fn heartbeat(&self, user_id: &str) {
        let mut guard = self.inner.lock();
        if let Some(entry) = guard.get_mut(user_id) {
            entry.last_seen = Self::now();
        }
    }

    pub fn status_of(&self, user_id: &str) -> (OnlineStatus, i64) {
        let guard = self.inner.lock();
        match guard.get(user_id) {
            Some(entry) => (entry.status, entry.last_seen),
            None => (OnlineStatus::Offline, 0),
        }
    }

    /// Users with at least one live connection.
    pub fn online_snapshot(&self) -> Vec<(String, OnlineStatus, i64)> {
        let guard = self.inner.lock();
        guard
            .iter()
            .filter(|(_, e)| e.connections > 0)
            .map(|(id, e)| (id.clone(), e.status, e.last_seen))
            .collect()
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

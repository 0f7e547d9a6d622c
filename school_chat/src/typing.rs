use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Debounces typing indicators so one keystroke burst becomes one broadcast.
pub struct TypingTracker {
    last: Mutex<HashMap<(String, Uuid), Instant>>,
    debounce: Duration,
}

impl TypingTracker {
    pub fn new(debounce: Duration) -> Self {
        Self {
            last: Mutex::new(HashMap::new()),
            debounce,
        }
    }

    /// Register a typing action. Returns true if the event should be broadcast.
    pub fn typing(&self, user_id: &str, conversation_id: Uuid) -> bool {
        let mut guard = self.last.lock();
        let key = (user_id.to_string(), conversation_id);
        let now = Instant::now();
        let should = match guard.get(&key) {
            Some(&prev) => now.duration_since(prev) >= self.debounce,
            None => true,
        };
        if should {
            guard.insert(key, now);
        }
        should
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debounce_logic() {
        let tracker = TypingTracker::new(Duration::from_secs(2));
        let conversation = Uuid::nil();
        assert!(tracker.typing("u", conversation));
        assert!(!tracker.typing("u", conversation));
        // a different conversation debounces independently
        assert!(tracker.typing("u", Uuid::new_v4()));
    }
}

//! In-memory context cache.
//!
//! Holds the recent message tail per session so prompt building does not
//! hit SQLite on every turn. Read-through, never write-back: appends
//! invalidate the entry and the next read repopulates it. The TTL is
//! refreshed on every read, so an active conversation stays cached.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

use super::types::Message;

struct Entry {
    messages: Vec<Message>,
    expires_at: Instant,
}

pub struct ContextCache {
    ttl: Duration,
    entries: Mutex<HashMap<Uuid, Entry>>,
}

impl ContextCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cached tail for a session, refreshing its TTL. `None` on miss or
    /// expiry.
    pub fn get(&self, session_id: Uuid) -> Option<Vec<Message>> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let entry = entries.get_mut(&session_id)?;
        if Instant::now() >= entry.expires_at {
            entries.remove(&session_id);
            return None;
        }
        entry.expires_at = Instant::now() + self.ttl;
        Some(entry.messages.clone())
    }

    /// Store a freshly loaded tail. Only copies of immutable messages are
    /// held.
    pub fn put(&self, session_id: Uuid, messages: Vec<Message>) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.insert(
            session_id,
            Entry {
                messages,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drop the entry for a session (called on every append).
    pub fn invalidate(&self, session_id: Uuid) {
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .remove(&session_id);
    }

    /// Drop all expired entries. Called opportunistically.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .retain(|_, entry| entry.expires_at > now);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }
}

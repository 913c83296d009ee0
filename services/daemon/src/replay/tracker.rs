//! One-shot replay token table.
//!
//! A token correlates a daemon-issued replay with the row it re-issues. It
//! travels to the proxy in the internal replay header and is consumed exactly
//! once at intake; stale tokens purge lazily on access.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const TOKEN_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayOrigin {
    pub replayed_from_id: i64,
    pub initiator: String,
}

struct Entry {
    origin: ReplayOrigin,
    created_at: Instant,
}

#[derive(Default)]
pub struct ReplayTracker {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ReplayTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a single-use token for a replay of `replayed_from_id`.
    pub fn issue(&self, replayed_from_id: i64, initiator: &str) -> String {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        let mut entries = self.lock();
        purge_expired(&mut entries);
        entries.insert(
            token.clone(),
            Entry {
                origin: ReplayOrigin {
                    replayed_from_id,
                    initiator: initiator.to_owned(),
                },
                created_at: Instant::now(),
            },
        );
        token
    }

    /// Atomically remove and return the entry for `token`. A second consume
    /// of the same token returns `None`.
    pub fn consume(&self, token: &str) -> Option<ReplayOrigin> {
        let mut entries = self.lock();
        purge_expired(&mut entries);
        entries.remove(token).map(|e| e.origin)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn purge_expired(entries: &mut HashMap<String, Entry>) {
    entries.retain(|_, e| e.created_at.elapsed() < TOKEN_TTL);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_single_use() {
        let tracker = ReplayTracker::new();
        let token = tracker.issue(42, "replay-cli");

        let first = tracker.consume(&token);
        assert_eq!(
            first,
            Some(ReplayOrigin {
                replayed_from_id: 42,
                initiator: "replay-cli".to_owned(),
            })
        );
        assert_eq!(tracker.consume(&token), None);
    }

    #[test]
    fn unknown_tokens_return_none() {
        let tracker = ReplayTracker::new();
        assert_eq!(tracker.consume("deadbeef"), None);
    }

    #[test]
    fn tokens_are_distinct() {
        let tracker = ReplayTracker::new();
        let a = tracker.issue(1, "tui");
        let b = tracker.issue(1, "tui");
        assert_ne!(a, b);
        assert!(tracker.consume(&a).is_some());
        assert!(tracker.consume(&b).is_some());
    }
}

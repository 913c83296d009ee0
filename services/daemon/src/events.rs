//! Bounded in-memory log of interceptor runtime events.
//!
//! Single producer set (runner + loader), many consumers (control clients
//! polling `getInterceptorEvents`). `seq` is monotonic for the process
//! lifetime and survives `clear()`, so pollers using `after_seq` observe a
//! gap rather than a repeat. Overflow drops the oldest entry and decrements
//! its level count.

use procsi_protocol::{
    EventCounts, EventLevel, EventType, GetInterceptorEventsParams, InterceptorEventRecord,
    InterceptorEventsResult,
};
use std::collections::VecDeque;
use std::sync::Mutex;

pub const DEFAULT_EVENT_CAPACITY: usize = 5000;
const DEFAULT_QUERY_LIMIT: usize = 500;

/// Everything but `seq` and `timestamp`, which `append` stamps.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub kind: EventType,
    pub level: EventLevel,
    pub interceptor: String,
    pub message: String,
    pub error: Option<String>,
    pub request_id: Option<i64>,
    pub request_url: Option<String>,
    pub request_method: Option<String>,
}

impl EventDraft {
    pub fn new(
        kind: EventType,
        level: EventLevel,
        interceptor: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            level,
            interceptor: interceptor.into(),
            message: message.into(),
            error: None,
            request_id: None,
            request_url: None,
            request_method: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_request(mut self, id: i64, url: impl Into<String>, method: impl Into<String>) -> Self {
        self.request_id = Some(id);
        self.request_url = Some(url.into());
        self.request_method = Some(method.into());
        self
    }
}

struct Inner {
    ring: VecDeque<InterceptorEventRecord>,
    next_seq: u64,
    counts: EventCounts,
}

pub struct EventLog {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                ring: VecDeque::with_capacity(capacity.min(1024)),
                next_seq: 1,
                counts: EventCounts::default(),
            }),
        }
    }

    /// Stamp `seq` and `timestamp`, append, and evict the oldest entry if the
    /// ring is full. Returns the assigned seq.
    pub fn append(&self, draft: EventDraft) -> u64 {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let record = InterceptorEventRecord {
            seq,
            timestamp: crate::storage::now_ms(),
            kind: draft.kind,
            level: draft.level,
            interceptor: draft.interceptor,
            message: draft.message,
            error: draft.error,
            request_id: draft.request_id,
            request_url: draft.request_url,
            request_method: draft.request_method,
        };

        bump(&mut inner.counts, record.level, 1);
        inner.ring.push_back(record);
        if inner.ring.len() > self.capacity {
            if let Some(evicted) = inner.ring.pop_front() {
                bump(&mut inner.counts, evicted.level, -1);
            }
        }
        seq
    }

    /// Events with `seq > after_seq` passing the predicates, oldest first,
    /// plus the current per-level totals for the whole buffer.
    pub fn query(&self, params: &GetInterceptorEventsParams) -> InterceptorEventsResult {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let after = params.after_seq.unwrap_or(0);
        let limit = params.limit.map_or(DEFAULT_QUERY_LIMIT, |l| l as usize);

        let events = inner
            .ring
            .iter()
            .filter(|e| e.seq > after)
            .filter(|e| params.level.map_or(true, |l| e.level == l))
            .filter(|e| params.kind.map_or(true, |k| e.kind == k))
            .filter(|e| {
                params
                    .interceptor
                    .as_ref()
                    .map_or(true, |name| &e.interceptor == name)
            })
            .take(limit)
            .cloned()
            .collect();

        InterceptorEventsResult {
            events,
            counts: inner.counts,
        }
    }

    /// Empty the buffer and reset level counts. `seq` keeps counting.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.ring.clear();
        inner.counts = EventCounts::default();
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

fn bump(counts: &mut EventCounts, level: EventLevel, delta: i64) {
    let slot = match level {
        EventLevel::Info => &mut counts.info,
        EventLevel::Warn => &mut counts.warn,
        EventLevel::Error => &mut counts.error,
    };
    *slot = slot.saturating_add_signed(delta);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(kind: EventType, level: EventLevel, name: &str) -> EventDraft {
        EventDraft::new(kind, level, name, "msg")
    }

    #[test]
    fn seq_starts_at_one_and_increments() {
        let log = EventLog::new(10);
        assert_eq!(log.append(draft(EventType::Loaded, EventLevel::Info, "a")), 1);
        assert_eq!(log.append(draft(EventType::Matched, EventLevel::Info, "a")), 2);
    }

    #[test]
    fn overflow_drops_oldest_and_adjusts_counts() {
        let log = EventLog::new(2);
        log.append(draft(EventType::Loaded, EventLevel::Info, "a"));
        log.append(draft(EventType::HandlerError, EventLevel::Warn, "a"));
        log.append(draft(EventType::MatchError, EventLevel::Error, "a"));

        let result = log.query(&GetInterceptorEventsParams::default());
        assert_eq!(result.events.len(), 2);
        assert_eq!(result.events[0].seq, 2);
        assert_eq!(result.counts.info, 0);
        assert_eq!(result.counts.warn, 1);
        assert_eq!(result.counts.error, 1);
    }

    #[test]
    fn after_seq_skips_seen_events() {
        let log = EventLog::new(10);
        for _ in 0..5 {
            log.append(draft(EventType::Matched, EventLevel::Info, "a"));
        }
        let result = log.query(&GetInterceptorEventsParams {
            after_seq: Some(3),
            ..GetInterceptorEventsParams::default()
        });
        assert_eq!(result.events.len(), 2);
        assert_eq!(result.events[0].seq, 4);
    }

    #[test]
    fn clear_keeps_seq_monotonic() {
        let log = EventLog::new(10);
        log.append(draft(EventType::Loaded, EventLevel::Info, "a"));
        log.clear();
        let seq = log.append(draft(EventType::Loaded, EventLevel::Info, "a"));
        assert_eq!(seq, 2);

        let result = log.query(&GetInterceptorEventsParams::default());
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.counts.info, 1);
    }

    #[test]
    fn predicates_filter_by_level_type_and_name() {
        let log = EventLog::new(10);
        log.append(draft(EventType::Loaded, EventLevel::Info, "alpha"));
        log.append(draft(EventType::HandlerTimeout, EventLevel::Warn, "alpha"));
        log.append(draft(EventType::HandlerTimeout, EventLevel::Warn, "beta"));

        let result = log.query(&GetInterceptorEventsParams {
            level: Some(EventLevel::Warn),
            interceptor: Some("beta".to_owned()),
            ..GetInterceptorEventsParams::default()
        });
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].interceptor, "beta");

        let result = log.query(&GetInterceptorEventsParams {
            kind: Some(EventType::Loaded),
            ..GetInterceptorEventsParams::default()
        });
        assert_eq!(result.events.len(), 1);
    }
}

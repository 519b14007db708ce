use agentflow_protocol::RunEvent;
use serde_json::Value;
use std::collections::VecDeque;

/// Sliding window of one run's events plus its sequence counter.
///
/// The counter never resets when the window slides, so eviction cannot
/// produce duplicate sequence numbers.
#[derive(Debug)]
pub struct RunLog {
    events: VecDeque<RunEvent>,
    max_events: usize,
    last_seq: u64,
    pub(crate) replay_truncate_emitted: bool,
    pub(crate) governance_warning_emitted: bool,
}

impl RunLog {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::new(),
            max_events: max_events.max(1),
            last_seq: 0,
            replay_truncate_emitted: false,
            governance_warning_emitted: false,
        }
    }

    /// Assign the next sequence number and append, evicting the oldest entry
    /// once the window is full.
    pub fn push(&mut self, mut event: RunEvent) -> RunEvent {
        self.last_seq = self.last_seq.saturating_add(1);
        event.seq = self.last_seq;
        self.events.push_back(event.clone());
        while self.events.len() > self.max_events {
            let _ = self.events.pop_front();
        }
        event
    }

    pub fn replay_from(&self, since_seq: u64) -> Vec<RunEvent> {
        self.events
            .iter()
            .filter(|event| event.seq > since_seq)
            .cloned()
            .collect()
    }

    /// True when events a client at `since_seq` has not seen were evicted.
    pub fn evicted_since(&self, since_seq: u64) -> bool {
        self.oldest_seq()
            .is_some_and(|oldest| oldest > since_seq.saturating_add(1))
    }

    pub fn oldest_seq(&self) -> Option<u64> {
        self.events.front().map(|e| e.seq)
    }

    pub fn newest_seq(&self) -> Option<u64> {
        self.events.back().map(|e| e.seq)
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RunEvent> {
        self.events.iter()
    }
}

/// Cut `s` to at most `max_bytes` without splitting a code point.
///
/// Returns the kept prefix and whether anything was dropped.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> (&str, bool) {
    if s.len() <= max_bytes {
        return (s, false);
    }
    let mut cut = max_bytes;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    (&s[..cut], true)
}

/// Truncate the `text` payload of a process output event to `limit` bytes.
///
/// The returned flag is true when the event was modified.
pub fn govern_process_output(mut event: RunEvent, limit: usize) -> (RunEvent, bool) {
    if !event.is_process_output() {
        return (event, false);
    }
    let Some(text) = event.text() else {
        return (event, false);
    };
    let original_bytes = text.len();
    let (kept, truncated) = truncate_utf8(text, limit);
    if !truncated {
        return (event, false);
    }
    let kept = kept.to_string();

    if let Some(Value::Object(data)) = event.data.as_mut() {
        data.insert("text".to_string(), Value::String(kept));
        data.insert("truncated".to_string(), Value::Bool(true));
        data.insert("originalBytes".to_string(), Value::from(original_bytes));
        data.insert("limitBytes".to_string(), Value::from(limit));
    }
    (event, true)
}

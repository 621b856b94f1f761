//! Bounded structured trace ring buffer (spec §7).
//!
//! The settlement driver and sweeper push one [`TraceEvent`] per stage
//! transition, retry, or failure. `status()`-style callers can drain the
//! most recent 200 for diagnostics. Preimages and private keys are never
//! put in here — only a truncated signature prefix for correlation.

use std::collections::VecDeque;
use std::sync::Mutex;

const CAPACITY: usize = 200;

/// What kind of thing happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    StageTransition,
    Retry,
    Failure,
    Info,
}

#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub ts_ms: i64,
    pub trade_id: Option<String>,
    pub stage: Option<String>,
    pub kind: TraceKind,
    pub message: String,
    /// First 16 hex chars of an envelope signature, for correlation only.
    pub envelope_sig_prefix: Option<String>,
}

/// Truncate a hex signature to a correlation-only prefix.
pub fn sig_prefix(sig: &str) -> String {
    sig.chars().take(16).collect()
}

/// A fixed-capacity FIFO ring buffer of the most recent trace events.
pub struct TraceBuffer {
    events: Mutex<VecDeque<TraceEvent>>,
}

impl TraceBuffer {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(CAPACITY)),
        }
    }

    pub fn push(&self, event: TraceEvent) {
        let mut guard = self.events.lock().expect("trace buffer poisoned");
        if guard.len() >= CAPACITY {
            guard.pop_front();
        }
        guard.push_back(event);
    }

    /// Snapshot of all currently-buffered events, oldest first.
    pub fn snapshot(&self) -> Vec<TraceEvent> {
        self.events
            .lock()
            .expect("trace buffer poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("trace buffer poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TraceBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_at_200_entries() {
        let buf = TraceBuffer::new();
        for i in 0..250 {
            buf.push(TraceEvent {
                ts_ms: i,
                trade_id: None,
                stage: None,
                kind: TraceKind::Info,
                message: format!("event {i}"),
                envelope_sig_prefix: None,
            });
        }
        assert_eq!(buf.len(), CAPACITY);
        let snapshot = buf.snapshot();
        // Oldest 50 were evicted; the buffer should start at event 50.
        assert_eq!(snapshot.first().unwrap().message, "event 50");
    }

    #[test]
    fn sig_prefix_truncates_to_16_chars() {
        let full = "a".repeat(128);
        assert_eq!(sig_prefix(&full).len(), 16);
    }
}

//! Debounce/batch bookkeeping for the watcher.
//!
//! Kept separate from the event loop in `mod.rs` so the flush-trigger logic
//! (the three conditions in `spec.md` §4.1) can be unit tested without
//! standing up a real `notify` watcher.

use crate::types::{ChangeBatch, ChangeEvent};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

pub struct Debouncer {
    pending: HashMap<PathBuf, ChangeEvent>,
    /// Insertion order, oldest first — used both for "latest kind wins"
    /// bookkeeping and for the LRU-drop-25%-oldest backpressure policy.
    order: Vec<PathBuf>,
    first_event_at: Option<Instant>,
    last_event_at: Option<Instant>,
    window: Duration,
    max_batch_size: usize,
    hard_ceiling: Duration,
}

pub enum FlushReason {
    Quiescent,
    BatchFull,
    HardCeiling,
}

impl Debouncer {
    pub fn new(window: Duration, max_batch_size: usize, hard_ceiling: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            order: Vec::new(),
            first_event_at: None,
            last_event_at: None,
            window,
            max_batch_size,
            hard_ceiling,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Record an event, deduplicating by path (latest kind wins).
    pub fn record(&mut self, event: ChangeEvent) {
        let now = Instant::now();
        if self.pending.is_empty() {
            self.first_event_at = Some(now);
        }
        self.last_event_at = Some(now);

        if !self.pending.contains_key(&event.path) {
            self.order.push(event.path.clone());
        }
        self.pending.insert(event.path.clone(), event);
    }

    /// Should the pending set be flushed right now?
    pub fn should_flush(&self) -> Option<FlushReason> {
        if self.pending.is_empty() {
            return None;
        }
        if self.pending.len() >= self.max_batch_size {
            return Some(FlushReason::BatchFull);
        }
        if let Some(first) = self.first_event_at
            && first.elapsed() >= self.hard_ceiling
        {
            return Some(FlushReason::HardCeiling);
        }
        if let Some(last) = self.last_event_at
            && last.elapsed() >= self.window
        {
            return Some(FlushReason::Quiescent);
        }
        None
    }

    /// Instant at which the debouncer should next be polled, if anything is
    /// pending — the earlier of the quiescent deadline and the hard ceiling.
    pub fn next_wake(&self) -> Option<Instant> {
        let last = self.last_event_at?;
        let first = self.first_event_at?;
        Some(std::cmp::min(last + self.window, first + self.hard_ceiling))
    }

    /// Drain everything accumulated into a `ChangeBatch`, ordered oldest path
    /// first, resetting all timers.
    pub fn flush(&mut self) -> ChangeBatch {
        self.flush_into(Vec::new())
    }

    /// Like `flush`, but fills a caller-supplied buffer instead of
    /// allocating a fresh `Vec` — lets the caller draw from a pool instead
    /// of paying an allocation on every flush.
    pub fn flush_into(&mut self, mut buf: Vec<ChangeEvent>) -> ChangeBatch {
        buf.clear();
        buf.extend(self.order.drain(..).filter_map(|path| self.pending.remove(&path)));
        self.first_event_at = None;
        self.last_event_at = None;
        ChangeBatch { events: buf }
    }

    /// Drop the oldest `fraction` of pending paths (rounded up), returning
    /// how many were dropped. Used under output backpressure per `spec.md`
    /// §4.1 step 4.
    pub fn drop_oldest_fraction(&mut self, fraction: f64) -> usize {
        let drop_count = ((self.order.len() as f64) * fraction).ceil() as usize;
        let drop_count = drop_count.min(self.order.len());
        for path in self.order.drain(..drop_count) {
            self.pending.remove(&path);
        }
        drop_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChangeKind;
    use std::time::SystemTime;

    fn event(path: &str, kind: ChangeKind, seq: u64) -> ChangeEvent {
        ChangeEvent {
            path: PathBuf::from(path),
            kind,
            sequence: seq,
            timestamp: SystemTime::now(),
        }
    }

    #[test]
    fn dedups_by_path_latest_kind_wins() {
        let mut debouncer = Debouncer::new(Duration::from_millis(50), 50, Duration::from_millis(500));
        debouncer.record(event("a.tmpl", ChangeKind::Created, 1));
        debouncer.record(event("a.tmpl", ChangeKind::Modified, 2));
        assert_eq!(debouncer.len(), 1);
        let batch = debouncer.flush();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.events[0].kind, ChangeKind::Modified);
    }

    #[test]
    fn flushes_when_batch_full() {
        let mut debouncer = Debouncer::new(Duration::from_secs(10), 3, Duration::from_secs(10));
        debouncer.record(event("a", ChangeKind::Created, 1));
        debouncer.record(event("b", ChangeKind::Created, 2));
        assert!(debouncer.should_flush().is_none());
        debouncer.record(event("c", ChangeKind::Created, 3));
        assert!(matches!(debouncer.should_flush(), Some(FlushReason::BatchFull)));
    }

    #[test]
    fn drop_oldest_fraction_removes_earliest_paths() {
        let mut debouncer = Debouncer::new(Duration::from_secs(10), 50, Duration::from_secs(10));
        for (i, path) in ["a", "b", "c", "d"].iter().enumerate() {
            debouncer.record(event(path, ChangeKind::Created, i as u64));
        }
        let dropped = debouncer.drop_oldest_fraction(0.25);
        assert_eq!(dropped, 1);
        assert_eq!(debouncer.len(), 3);
        let batch = debouncer.flush();
        let paths: Vec<_> = batch.events.iter().map(|e| e.path.to_str().unwrap()).collect();
        assert_eq!(paths, vec!["b", "c", "d"]);
    }
}

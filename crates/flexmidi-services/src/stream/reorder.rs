//! Restores `seq` order on the receiving side.

use std::collections::{BTreeMap, BTreeSet};

use flexmidi_core::ctrl::MAX_NACK_KEYS;
use flexmidi_core::StreamEnvelope;

/// What one `push` produced.
#[derive(Debug, Default)]
pub struct Reordered {
    /// Envelopes now deliverable, in increasing `seq`.
    pub ready: Vec<StreamEnvelope>,
    /// Newly detected missing seqs, at most `MAX_NACK_KEYS` past the next
    /// expected seq. Each seq is reported once.
    pub missing: Vec<u64>,
    /// Seqs given up on because the buffer overflowed.
    pub skipped: u64,
    pub duplicate: bool,
}

pub struct ReorderBuffer {
    next: u64,
    held: BTreeMap<u64, StreamEnvelope>,
    reported: BTreeSet<u64>,
    max_held: usize,
}

impl ReorderBuffer {
    pub fn new(max_held: usize) -> Self {
        Self {
            next: 0,
            held: BTreeMap::new(),
            reported: BTreeSet::new(),
            max_held: max_held.max(1),
        }
    }

    /// Next seq expected for delivery.
    pub fn next_seq(&self) -> u64 {
        self.next
    }

    pub fn held(&self) -> usize {
        self.held.len()
    }

    pub fn push(&mut self, env: StreamEnvelope) -> Reordered {
        let mut out = Reordered::default();
        let seq = env.seq;

        if seq < self.next || self.held.contains_key(&seq) {
            out.duplicate = true;
            return out;
        }

        if seq == self.next {
            out.ready.push(env);
            self.next += 1;
        } else {
            let window_end = seq.min(self.next.saturating_add(MAX_NACK_KEYS as u64));
            out.missing = (self.next..window_end)
                .filter(|s| !self.held.contains_key(s) && self.reported.insert(*s))
                .collect();
            self.held.insert(seq, env);

            if self.held.len() > self.max_held {
                if let Some(&first) = self.held.keys().next() {
                    out.skipped = first - self.next;
                    tracing::warn!(from = self.next, to = first, "reorder buffer full, skipping gap");
                    self.next = first;
                }
            }
        }

        while let Some(env) = self.held.remove(&self.next) {
            out.ready.push(env);
            self.next += 1;
        }
        self.reported = self.reported.split_off(&self.next);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(seq: u64) -> StreamEnvelope {
        let mut e = StreamEnvelope::new("token", seq.to_string());
        e.seq = seq;
        e
    }

    fn seqs(out: &Reordered) -> Vec<u64> {
        out.ready.iter().map(|e| e.seq).collect()
    }

    #[test]
    fn in_order_passes_through() {
        let mut buf = ReorderBuffer::new(8);
        for s in 0..3 {
            let out = buf.push(ev(s));
            assert_eq!(seqs(&out), vec![s]);
            assert!(out.missing.is_empty());
        }
        assert_eq!(buf.next_seq(), 3);
    }

    #[test]
    fn gap_is_reported_once_and_filled() {
        let mut buf = ReorderBuffer::new(8);
        buf.push(ev(0));

        let out = buf.push(ev(3));
        assert!(out.ready.is_empty());
        assert_eq!(out.missing, vec![1, 2]);

        let out = buf.push(ev(4));
        assert!(out.missing.is_empty());

        let out = buf.push(ev(2));
        assert!(out.ready.is_empty());

        let out = buf.push(ev(1));
        assert_eq!(seqs(&out), vec![1, 2, 3, 4]);
        assert_eq!(buf.held(), 0);
    }

    #[test]
    fn far_jump_reports_a_bounded_window() {
        let mut buf = ReorderBuffer::new(8);
        let out = buf.push(ev(10_000_000));
        assert_eq!(out.missing.len(), MAX_NACK_KEYS);
        assert_eq!(out.missing.first(), Some(&0));
        assert_eq!(buf.held(), 1);

        assert!(buf.push(ev(10_000_001)).missing.is_empty());
        assert_eq!(seqs(&buf.push(ev(0))), vec![0]);
        assert_eq!(buf.push(ev(2)).missing, Vec::<u64>::new());
    }

    #[test]
    fn duplicates_are_flagged() {
        let mut buf = ReorderBuffer::new(8);
        buf.push(ev(0));
        buf.push(ev(2));
        assert!(buf.push(ev(0)).duplicate);
        assert!(buf.push(ev(2)).duplicate);
        assert!(!buf.push(ev(1)).duplicate);
    }

    #[test]
    fn overflow_skips_the_gap() {
        let mut buf = ReorderBuffer::new(2);
        buf.push(ev(0));
        buf.push(ev(2));
        buf.push(ev(3));
        let out = buf.push(ev(4));
        assert_eq!(out.skipped, 1);
        assert_eq!(seqs(&out), vec![2, 3, 4]);
        assert_eq!(buf.next_seq(), 5);

        assert!(buf.push(ev(1)).duplicate);
    }
}

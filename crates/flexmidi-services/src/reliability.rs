//! Duplicate suppression and resend control.
//!
//! Delivery is at-least-once: senders may repeat a request, receivers drop
//! repeats of a `corr` seen within the replay window. Frames already sent
//! are kept in a bounded resend buffer so a peer's nack can be answered.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use flexmidi_core::config::ReliabilityConfig;
use flexmidi_core::ctrl::{Ctrl, ResendKey};
use flexmidi_core::{CommandEnvelope, Ump128};

/// Routing decision for an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayVerdict {
    Accepted,
    Suppressed,
}

// ── Replay cache ──────────────────────────────────────────────────────────────

struct Seen {
    /// Last accepted peer timestamp. Only compared against later requests
    /// for the same corr.
    ts: u64,
    /// Local time of that acceptance. Drives expiry.
    at: Instant,
}

/// `corr → last accepted ts`.
///
/// Expiry and the entry cap run on local time and insertion order, so a
/// peer-chosen `ts` cannot push other entries out.
pub struct ReplayCache {
    window: Duration,
    window_ms: u64,
    max_entries: usize,
    entries: DashMap<String, Seen>,
    order: Mutex<VecDeque<(String, Instant)>>,
}

impl ReplayCache {
    pub fn new(window_ms: u64, max_entries: usize) -> Self {
        Self {
            window: Duration::from_millis(window_ms),
            window_ms,
            max_entries: max_entries.max(1),
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
        }
    }

    /// Accept (and remember) `ts` if at least one window has passed since
    /// the last accepted ts for `corr`. The shard lock held by the entry
    /// makes check-then-update atomic per corr.
    pub fn check(&self, corr: &str, ts: u64) -> ReplayVerdict {
        self.check_at(corr, ts, Instant::now())
    }

    fn check_at(&self, corr: &str, ts: u64, now: Instant) -> ReplayVerdict {
        self.sweep(now);

        let mut inserted = false;
        let verdict = match self.entries.entry(corr.to_string()) {
            Entry::Occupied(mut e) => {
                // Older than the cached value counts as no time elapsed.
                let elapsed = ts.saturating_sub(e.get().ts);
                if elapsed >= self.window_ms {
                    e.insert(Seen { ts, at: now });
                    ReplayVerdict::Accepted
                } else {
                    ReplayVerdict::Suppressed
                }
            }
            Entry::Vacant(e) => {
                e.insert(Seen { ts, at: now });
                inserted = true;
                ReplayVerdict::Accepted
            }
        };

        // Entry guard is released; the queue lock is never held across it.
        if inserted {
            let mut order = self.order.lock().unwrap_or_else(|e| e.into_inner());
            order.push_back((corr.to_string(), now));
            self.enforce_cap(&mut order);
        }
        verdict
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, corr: &str) -> bool {
        self.entries.contains_key(corr)
    }

    /// Drop entries not accepted within one window of local time. Entries
    /// re-accepted since they were queued move to the back.
    fn sweep(&self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        let mut order = self.order.lock().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0usize;
        while let Some((_, queued_at)) = order.front() {
            if *queued_at > cutoff {
                break;
            }
            let Some((corr, _)) = order.pop_front() else {
                break;
            };
            let refreshed = self
                .entries
                .get(&corr)
                .map(|seen| seen.at)
                .filter(|at| *at > cutoff);
            match refreshed {
                Some(at) => order.push_back((corr, at)),
                None => {
                    if self.entries.remove(&corr).is_some() {
                        removed += 1;
                    }
                }
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "evicted expired replay entries");
        }
    }

    fn enforce_cap(&self, order: &mut VecDeque<(String, Instant)>) {
        let mut evicted = 0usize;
        while self.entries.len() > self.max_entries {
            let Some((oldest, _)) = order.pop_front() else {
                break;
            };
            if self.entries.remove(&oldest).is_some() {
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::debug!(cap = self.max_entries, evicted, "replay cache over capacity, evicted oldest");
        }
    }
}

// ── Resend buffer ─────────────────────────────────────────────────────────────

/// Frames found for a nack, in request order.
pub type Resends<K> = Vec<(K, Vec<Ump128>)>;

/// Sent frames kept for retransmission, oldest evicted past capacity.
pub struct ResendBuffer<K: ResendKey> {
    capacity: usize,
    inner: Mutex<BufferInner<K>>,
}

struct BufferInner<K> {
    frames: HashMap<K, Vec<Ump128>>,
    order: VecDeque<K>,
}

impl<K: ResendKey> ResendBuffer<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(BufferInner {
                frames: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn record(&self, key: K, frames: Vec<Ump128>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.frames.insert(key.clone(), frames).is_none() {
            inner.order.push_back(key);
        }
        while inner.frames.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.frames.remove(&oldest);
        }
    }

    /// Drop every entry covered by `acked`. Returns the number released.
    pub fn release(&self, acked: &K) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = inner.frames.len();
        inner.frames.retain(|k, _| !k.covered_by(acked));
        let BufferInner { frames, order } = &mut *inner;
        order.retain(|k| frames.contains_key(k));
        before - frames.len()
    }

    /// Frames for the requested keys that are still buffered.
    pub fn lookup(&self, keys: &[K]) -> Resends<K> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        keys.iter()
            .filter_map(|k| inner.frames.get(k).map(|f| (k.clone(), f.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Reliability ───────────────────────────────────────────────────────────────

/// Replay cache plus resend buffer for one endpoint.
pub struct Reliability<K: ResendKey> {
    replay: ReplayCache,
    buffer: ResendBuffer<K>,
}

impl<K: ResendKey> Reliability<K> {
    pub fn new(config: &ReliabilityConfig) -> Self {
        Self {
            replay: ReplayCache::new(config.replay_window_ms, config.max_replay_entries),
            buffer: ResendBuffer::new(config.max_buffered),
        }
    }

    pub fn check_replay(&self, env: &CommandEnvelope) -> ReplayVerdict {
        self.replay.check(&env.corr, env.ts)
    }

    pub fn record(&self, key: K, frames: Vec<Ump128>) {
        self.buffer.record(key, frames);
    }

    /// Apply a control message. An ack releases covered frames; a nack
    /// returns whatever is still buffered for the listed keys.
    pub fn handle_ctrl(&self, ctrl: &Ctrl<K>) -> Option<Resends<K>> {
        if let Some(acked) = &ctrl.ack {
            let released = self.buffer.release(acked);
            tracing::trace!(ack = ?acked, released, "ack applied");
        }
        let keys = ctrl.nack.as_deref()?;
        let resends = self.buffer.lookup(keys);
        if resends.len() < keys.len() {
            tracing::debug!(
                requested = keys.len(),
                found = resends.len(),
                "nack for frames no longer buffered"
            );
        }
        if resends.is_empty() {
            None
        } else {
            Some(resends)
        }
    }

    pub fn build_ack(&self, key: K) -> Ctrl<K> {
        Ctrl::ack(key)
    }

    pub fn build_nack(&self, keys: Vec<K>) -> Ctrl<K> {
        Ctrl::nack(keys)
    }

    pub fn replay(&self) -> &ReplayCache {
        &self.replay
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

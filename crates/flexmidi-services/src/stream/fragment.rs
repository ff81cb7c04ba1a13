//! Splitting large `data` into `frag:{i,n}` envelopes and joining them back.

use std::collections::{HashMap, VecDeque};

use flexmidi_core::{Fragment, StreamEnvelope};

use super::StreamError;

/// Partial events held at once; the oldest is dropped past this.
const MAX_PARTIALS: usize = 64;

/// Default cap on `frag.n`.
pub const DEFAULT_MAX_FRAGMENTS: u32 = 1024;

/// Split `env` so no piece carries more than `max_bytes` of `data`.
///
/// Cuts fall on char boundaries, so a piece may run short; a single char
/// wider than `max_bytes` gets a piece to itself. All pieces share one `id`
/// (the envelope's own, or a fresh one). An envelope that already fits is
/// returned unchanged.
pub fn split(env: StreamEnvelope, max_bytes: usize) -> Vec<StreamEnvelope> {
    let max_bytes = max_bytes.max(1);
    let data = match env.data.as_deref() {
        Some(d) if d.len() > max_bytes => d,
        _ => return vec![env],
    };

    let mut chunks: Vec<&str> = Vec::new();
    let mut start = 0;
    let mut end = 0;
    for (idx, ch) in data.char_indices() {
        let next = idx + ch.len_utf8();
        if next - start > max_bytes && end > start {
            chunks.push(&data[start..end]);
            start = end;
        }
        end = next;
    }
    chunks.push(&data[start..]);

    let id = env
        .id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    let n = chunks.len() as u32;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| StreamEnvelope {
            id: Some(id.clone()),
            frag: Some(Fragment { i: i as u32, n }),
            data: Some(chunk.to_string()),
            ..env.clone()
        })
        .collect()
}

struct Partial {
    n: u32,
    parts: Vec<Option<String>>,
}

/// Joins fragments by `id`. Unfragmented envelopes pass straight through.
///
/// `frag.n` comes from the peer, so it is checked against `max_fragments`
/// before any slot is allocated.
pub struct FragmentAssembler {
    partials: HashMap<String, Partial>,
    order: VecDeque<String>,
    max_fragments: u32,
}

impl Default for FragmentAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAGMENTS)
    }
}

impl FragmentAssembler {
    pub fn new(max_fragments: u32) -> Self {
        Self {
            partials: HashMap::new(),
            order: VecDeque::new(),
            max_fragments: max_fragments.max(1),
        }
    }

    /// Returns the whole event once the last fragment (`i == n-1`) arrives.
    /// The emitted envelope is the last fragment's, with `frag` cleared and
    /// `data` the concatenation of every piece.
    pub fn push(&mut self, env: StreamEnvelope) -> Result<Option<StreamEnvelope>, StreamError> {
        let Some(frag) = env.frag else {
            return Ok(Some(env));
        };
        let Some(id) = env.id.clone() else {
            return Err(StreamError::Fragment("fragment without id".into()));
        };
        if frag.n == 0 || frag.i >= frag.n {
            return Err(StreamError::Fragment(format!(
                "fragment {}/{} of {id} out of range",
                frag.i, frag.n
            )));
        }
        if frag.n > self.max_fragments {
            return Err(StreamError::Fragment(format!(
                "{id} announces {} fragments, limit is {}",
                frag.n, self.max_fragments
            )));
        }

        if !self.partials.contains_key(&id) {
            self.evict_if_full();
            self.order.push_back(id.clone());
        }
        let partial = self.partials.entry(id.clone()).or_insert_with(|| Partial {
            n: frag.n,
            parts: vec![None; frag.n as usize],
        });
        if partial.n != frag.n {
            self.forget(&id);
            return Err(StreamError::Fragment(format!("fragment count changed mid-event for {id}")));
        }
        partial.parts[frag.i as usize] = env.data.clone();

        if !frag.is_last() {
            return Ok(None);
        }

        let Some(partial) = self.forget(&id) else {
            return Ok(None);
        };
        let mut data = String::new();
        for (i, part) in partial.parts.into_iter().enumerate() {
            match part {
                Some(p) => data.push_str(&p),
                None => {
                    return Err(StreamError::Fragment(format!(
                        "fragment {i}/{} of {id} missing",
                        partial.n
                    )))
                }
            }
        }
        Ok(Some(StreamEnvelope {
            frag: None,
            data: Some(data),
            ..env
        }))
    }

    pub fn pending(&self) -> usize {
        self.partials.len()
    }

    fn forget(&mut self, id: &str) -> Option<Partial> {
        self.order.retain(|o| o != id);
        self.partials.remove(id)
    }

    fn evict_if_full(&mut self) {
        while self.partials.len() >= MAX_PARTIALS {
            let Some(oldest) = self.order.pop_front() else {
                return;
            };
            self.partials.remove(&oldest);
            tracing::debug!(id = %oldest, "dropping incomplete fragmented event");
        }
    }
}

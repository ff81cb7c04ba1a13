//! Control-plane messages: ack / nack resend control.
//!
//! A receiver that detects a gap sends a nack listing the keys it is
//! missing; the sender looks them up in its resend buffer and re-sends.
//! An ack releases buffered frames the receiver no longer needs.
//!
//! Streams key frames by `seq` and acks are cumulative. The bridge keys
//! replies by `corr` and an ack covers exactly one correlation id.

use std::fmt::Debug;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::envelope::{CommandEnvelope, JsonValue, StreamEnvelope, CTRL_EVENT, CTRL_INTENT};

/// Maximum keys carried by a single nack. Longer gap lists are truncated;
/// the receiver asks again for the remainder.
pub const MAX_NACK_KEYS: usize = 512;

/// Key under which frames are buffered for retransmission.
pub trait ResendKey:
    Clone + Eq + Hash + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// True when an ack for `acked` releases frames buffered under `self`.
    fn covered_by(&self, acked: &Self) -> bool;
}

impl ResendKey for u64 {
    fn covered_by(&self, acked: &Self) -> bool {
        self <= acked
    }
}

impl ResendKey for String {
    fn covered_by(&self, acked: &Self) -> bool {
        self == acked
    }
}

/// `{ack?: K, nack?: [K]}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ctrl<K> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack: Option<K>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nack: Option<Vec<K>>,
}

impl<K> Default for Ctrl<K> {
    fn default() -> Self {
        Self {
            ack: None,
            nack: None,
        }
    }
}

impl<K: ResendKey> Ctrl<K> {
    pub fn ack(key: K) -> Self {
        Self {
            ack: Some(key),
            nack: None,
        }
    }

    pub fn nack(mut keys: Vec<K>) -> Self {
        keys.truncate(MAX_NACK_KEYS);
        Self {
            ack: None,
            nack: Some(keys),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ack.is_none() && self.nack.as_ref().map_or(true, |n| n.is_empty())
    }

    /// Wrap for the stream plane: `ev = "ctrl"`, JSON in `data`.
    pub fn to_stream_envelope(&self) -> Result<StreamEnvelope, serde_json::Error> {
        let data = serde_json::to_string(self)?;
        Ok(StreamEnvelope::new(CTRL_EVENT, data))
    }

    pub fn from_stream_envelope(env: &StreamEnvelope) -> Option<Self> {
        if !env.is_ctrl() {
            return None;
        }
        serde_json::from_str(env.data.as_deref()?).ok()
    }

    /// Wrap for the command plane: `intent = "flex.ctrl"`, ctrl object as body.
    pub fn to_command_envelope(&self) -> Result<CommandEnvelope, serde_json::Error> {
        let body = JsonValue::from_serialize(self)?;
        Ok(CommandEnvelope::new(CTRL_EVENT, CTRL_INTENT, body))
    }

    pub fn from_command_envelope(env: &CommandEnvelope) -> Option<Self> {
        if !env.is_ctrl() {
            return None;
        }
        env.body.deserialize_into().ok()
    }
}

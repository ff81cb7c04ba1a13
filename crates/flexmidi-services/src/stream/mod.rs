//! Streaming adapter: ordered, fragmentable events over a transport.
//!
//! A `StreamSender` and a `StreamReceiver` each own a transport. Events
//! carry a sender-monotonic `seq`; the receiver restores order, nacks gaps
//! and acks cumulatively every `ack_every` deliveries. The sender answers
//! that control traffic from `run_ctrl` on its own transport.

pub mod fragment;
pub mod reorder;
mod receiver;
mod sender;

pub use receiver::{StreamDelivery, StreamReceiver};
pub use sender::StreamSender;

use flexmidi_core::{CodecError, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream codec: {0}")]
    Codec(#[from] CodecError),

    #[error("stream transport: {0}")]
    Transport(#[from] TransportError),

    #[error("stream serialization: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("fragment: {0}")]
    Fragment(String),
}

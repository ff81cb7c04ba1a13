//! Transport abstraction shared by the UDP session and the in-process loopback.

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::wire::{Ump128, MAX_MTU, MIN_MTU, PROTOCOL_VERSION};

/// All packets carried by one inbound datagram, delivered together.
pub type UmpBatch = Vec<Ump128>;

/// Lifecycle phase of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Closed,
    Opening,
    Ready,
}

/// Per-transport negotiated state.
///
/// Created on open, mutated only by negotiation, reset on close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub local_id: Uuid,
    /// Learned from the peer's negotiation datagram.
    pub remote_id: Option<Uuid>,
    pub protocol_version: u8,
    pub negotiated_group: u8,
    pub negotiated_channel: u8,
    pub peer_addr: Option<SocketAddr>,
}

impl SessionState {
    pub fn new(local_id: Uuid, group: u8, channel: u8) -> Self {
        Self {
            phase: SessionPhase::Closed,
            local_id,
            remote_id: None,
            protocol_version: PROTOCOL_VERSION,
            negotiated_group: group,
            negotiated_channel: channel,
            peer_addr: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.phase == SessionPhase::Ready
    }

    pub fn is_negotiated(&self) -> bool {
        self.remote_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOp {
    Bind,
    Listen,
    Connect,
}

impl fmt::Display for SocketOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SocketOp::Bind => "bind",
            SocketOp::Listen => "listen",
            SocketOp::Connect => "connect",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{op} failed: {source}")]
    Socket {
        op: SocketOp,
        #[source]
        source: std::io::Error,
    },

    #[error("send failed: {0}")]
    Send(String),

    #[error("transport not connected")]
    NotConnected,

    #[error("session closed")]
    SessionClosed,

    #[error("negotiation timed out after {0} ms")]
    NegotiationTimeout(u64),

    #[error("mtu {mtu} outside {min}..={max}")]
    InvalidMtu { mtu: usize, min: usize, max: usize },

    #[error("inbound receiver already taken")]
    ReceiverTaken,
}

impl TransportError {
    pub fn socket(op: SocketOp, source: std::io::Error) -> Self {
        TransportError::Socket { op, source }
    }
}

/// Reject an MTU that cannot hold one packet or exceeds a UDP datagram.
pub fn validate_mtu(mtu: usize) -> Result<usize, TransportError> {
    if (MIN_MTU..=MAX_MTU).contains(&mtu) {
        Ok(mtu)
    } else {
        Err(TransportError::InvalidMtu {
            mtu,
            min: MIN_MTU,
            max: MAX_MTU,
        })
    }
}

/// A bidirectional UMP transport.
///
/// Inbound traffic is exposed as a channel of batches rather than a
/// callback; the consumer takes the receiver once and drains it on its own
/// task.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bring the transport to `Ready`. Idempotent while ready.
    async fn open(&self) -> Result<(), TransportError>;

    /// Send packets, coalesced into MTU-bounded frames. Order is preserved
    /// and the frames of one call are not interleaved with another call's,
    /// so a caller passing whole Flex Data runs gets them delivered whole.
    async fn send(&self, packets: &[Ump128]) -> Result<(), TransportError>;

    /// Tear down. Idempotent.
    async fn close(&self);

    /// Take the inbound batch channel. Only the first call succeeds.
    fn take_inbound(&self) -> Result<mpsc::Receiver<UmpBatch>, TransportError>;

    /// Snapshot of the current session state.
    fn state(&self) -> SessionState;

    fn mtu(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_is_closed_and_unnegotiated() {
        let state = SessionState::new(Uuid::new_v4(), 2, 5);
        assert_eq!(state.phase, SessionPhase::Closed);
        assert!(!state.is_ready());
        assert!(!state.is_negotiated());
        assert_eq!(state.protocol_version, PROTOCOL_VERSION);
        assert_eq!((state.negotiated_group, state.negotiated_channel), (2, 5));
    }

    #[test]
    fn mtu_bounds() {
        assert!(validate_mtu(MIN_MTU).is_ok());
        assert!(validate_mtu(MAX_MTU).is_ok());
        assert!(matches!(
            validate_mtu(MIN_MTU - 1),
            Err(TransportError::InvalidMtu { min: MIN_MTU, .. })
        ));
        let err = validate_mtu(MAX_MTU + 1).unwrap_err();
        assert_eq!(err.to_string(), format!("mtu {} outside {MIN_MTU}..={MAX_MTU}", MAX_MTU + 1));
    }

    #[test]
    fn socket_error_names_operation() {
        let err = TransportError::socket(
            SocketOp::Bind,
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        );
        assert_eq!(err.to_string(), "bind failed: in use");
    }
}

//! Capability negotiation rule.
//!
//! Each endpoint sends one `NegotiationMessage` carrying its id, protocol
//! version, group and channel. The agreed version is the lower of the two.
//! Group and channel are taken from the endpoint with the lower id so both
//! sides settle on the same values.

use std::time::{Duration, Instant};

use uuid::Uuid;

use flexmidi_core::transport::SessionState;
use flexmidi_core::wire::NegotiationMessage;

/// Values this endpoint proposes.
#[derive(Debug, Clone, Copy)]
pub struct Proposal {
    pub version: u8,
    pub group: u8,
    pub channel: u8,
}

impl Proposal {
    pub fn message(&self, local_id: Uuid) -> NegotiationMessage {
        NegotiationMessage::new(self.version, *local_id.as_bytes(), self.group, self.channel)
    }
}

/// Outcome of applying a peer's negotiation datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Learned {
    /// First datagram from this remote id. Always answered.
    NewPeer,
    /// Already known. Answered only through [`ReplyThrottle`].
    Known,
    /// Our own datagram reflected back (self-loopback).
    Own,
}

pub fn apply(state: &mut SessionState, local: &Proposal, msg: &NegotiationMessage) -> Learned {
    let remote_id = Uuid::from_bytes(msg.endpoint_id);
    if remote_id == state.local_id {
        return Learned::Own;
    }
    if state.remote_id == Some(remote_id) {
        return Learned::Known;
    }

    state.remote_id = Some(remote_id);
    state.protocol_version = local.version.min(msg.version);
    if remote_id < state.local_id {
        state.negotiated_group = msg.group & 0x0F;
        state.negotiated_channel = msg.channel & 0x0F;
    } else {
        state.negotiated_group = local.group & 0x0F;
        state.negotiated_channel = local.channel & 0x0F;
    }
    Learned::NewPeer
}

/// Decides which peer negotiation datagrams get an answer.
///
/// A known peer that keeps sending has not heard our answer, so it is
/// answered again. Answers are spaced by `interval`, which keeps two
/// negotiated sessions from echoing each other's answers forever.
#[derive(Debug)]
pub struct ReplyThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ReplyThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    pub fn should_reply(&mut self, learned: Learned, now: Instant) -> bool {
        let due = match learned {
            Learned::NewPeer => true,
            Learned::Known => self
                .last
                .map_or(true, |at| now.saturating_duration_since(at) >= self.interval),
            Learned::Own => false,
        };
        if due {
            self.last = Some(now);
        }
        due
    }
}

//! Session actor: the only task touching the data socket.
//!
//! Callers reach it through a command channel; negotiated state is
//! published on a watch channel so `open()` can await it without sharing
//! the socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use uuid::Uuid;
use zerocopy::AsBytes;

use flexmidi_core::transport::{SessionState, TransportError, UmpBatch};
use flexmidi_core::wire::{Ump128, MAX_MTU};

use super::negotiate::{self, Proposal, ReplyThrottle};
use crate::frame::{decode_datagram, Datagram, FrameEncoder, FramePacker};

/// Interval between negotiation attempts until the peer answers.
pub const NEGOTIATION_RETRY: Duration = Duration::from_millis(250);

/// Minimum spacing between answers to a peer that is already known.
pub const REPLY_INTERVAL: Duration = Duration::from_millis(125);

/// Largest datagram the actor will read.
const RECV_BUF: usize = MAX_MTU;

pub(crate) enum Command {
    Send {
        packets: Vec<Ump128>,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
}

pub(crate) struct SessionActor {
    pub socket: UdpSocket,
    pub mtu: usize,
    pub encoder: FrameEncoder,
    pub local_id: Uuid,
    pub proposal: Proposal,
    /// False when negotiation is disabled or the peer is this session.
    pub negotiate: bool,
    pub state_tx: Arc<watch::Sender<SessionState>>,
    /// Never awaited: a full channel drops the batch so sends keep flowing.
    pub inbound_tx: mpsc::Sender<UmpBatch>,
    pub dropped_inbound: Arc<AtomicU64>,
    pub replies: ReplyThrottle,
    pub cmd_rx: mpsc::Receiver<Command>,
    pub shutdown: broadcast::Receiver<()>,
}

impl SessionActor {
    pub async fn run(mut self) {
        let mut buf = vec![0u8; RECV_BUF];
        let mut retry = tokio::time::interval(NEGOTIATION_RETRY);

        loop {
            let negotiating = self.negotiate && !self.state_tx.borrow().is_negotiated();

            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::debug!("session actor shutting down");
                    return;
                }

                cmd = self.cmd_rx.recv() => {
                    let Some(Command::Send { packets, reply }) = cmd else {
                        tracing::debug!("command channel closed, session actor exiting");
                        return;
                    };
                    let result = self.send_frames(&packets).await;
                    let _ = reply.send(result);
                }

                _ = retry.tick(), if negotiating => {
                    self.send_negotiation().await;
                }

                result = self.socket.recv(&mut buf) => {
                    match result {
                        Ok(len) => self.handle_datagram(&buf[..len]).await,
                        // ICMP port unreachable from a peer that is not up yet
                        Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                            tracing::trace!("peer not listening");
                        }
                        Err(e) => tracing::warn!(error = %e, "recv failed"),
                    }
                }
            }
        }
    }

    async fn send_frames(&mut self, packets: &[Ump128]) -> Result<(), TransportError> {
        for frame in FramePacker::pack(self.mtu, packets)? {
            let bytes = self.encoder.encode(&frame);
            self.socket
                .send(&bytes)
                .await
                .map_err(|e| TransportError::Send(e.to_string()))?;
            tracing::trace!(packets = frame.len(), bytes = bytes.len(), "frame sent");
        }
        Ok(())
    }

    async fn send_negotiation(&self) {
        let msg = self.proposal.message(self.local_id);
        match self.socket.send(msg.as_bytes()).await {
            Ok(_) => tracing::trace!("negotiation sent"),
            Err(e) => tracing::debug!(error = %e, "negotiation send failed"),
        }
    }

    async fn handle_datagram(&mut self, data: &[u8]) {
        match decode_datagram(data) {
            Ok(Datagram::Data { sequence, packets, .. }) => {
                if packets.is_empty() {
                    return;
                }
                tracing::trace!(sequence, packets = packets.len(), "frame received");
                match self.inbound_tx.try_send(packets) {
                    Ok(()) => {}
                    Err(TrySendError::Full(batch)) => {
                        let dropped = self.dropped_inbound.fetch_add(1, Ordering::Relaxed) + 1;
                        if dropped == 1 || dropped % 100 == 0 {
                            tracing::warn!(dropped, packets = batch.len(), "inbound channel full, dropping batch");
                        } else {
                            tracing::trace!(dropped, "inbound batch dropped");
                        }
                    }
                    Err(TrySendError::Closed(_)) => {
                        tracing::trace!("inbound receiver dropped, discarding batch");
                    }
                }
            }
            Ok(Datagram::Negotiation(msg)) => {
                let mut learned = negotiate::Learned::Known;
                let proposal = self.proposal;
                self.state_tx
                    .send_modify(|state| learned = negotiate::apply(state, &proposal, &msg));

                if learned == negotiate::Learned::NewPeer {
                    let state = self.state_tx.borrow().clone();
                    tracing::info!(
                        remote = ?state.remote_id,
                        version = state.protocol_version,
                        group = state.negotiated_group,
                        channel = state.negotiated_channel,
                        "negotiated with peer"
                    );
                }
                if self.replies.should_reply(learned, Instant::now()) {
                    self.send_negotiation().await;
                }
            }
            Err(e) => tracing::debug!(error = %e, len = data.len(), "dropping malformed datagram"),
        }
    }
}

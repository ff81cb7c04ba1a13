use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, Mutex};

use flexmidi_core::config::{ReliabilityConfig, StreamConfig};
use flexmidi_core::ctrl::Ctrl;
use flexmidi_core::transport::validate_mtu;
use flexmidi_core::wire::{RTP_HEADER_LEN, UMP_BYTES};
use flexmidi_core::{FlexAssembler, FlexCodec, StreamEnvelope, Transport, Ump128};

use super::{fragment, StreamError};
use crate::metrics::StreamMetrics;
use crate::reliability::Reliability;

struct Outbox {
    next_seq: u64,
    pending: Vec<Ump128>,
}

/// Sending half of a stream session.
///
/// Each envelope gets the next `seq`, is split if its `data` is over the
/// fragment budget, encoded and recorded for resend. Pending packets go out
/// in one transport call once a full MTU frame's worth is queued, so a run
/// is never split across calls and a retransmit cannot land inside it;
/// `flush` pushes the remainder.
pub struct StreamSender {
    transport: Arc<dyn Transport>,
    codec: FlexCodec,
    reliability: Reliability<u64>,
    outbox: Mutex<Outbox>,
    frame_umps: usize,
    max_fragment_bytes: usize,
    metrics: Arc<StreamMetrics>,
}

impl StreamSender {
    pub fn new(
        transport: Arc<dyn Transport>,
        codec: FlexCodec,
        stream: &StreamConfig,
        reliability: &ReliabilityConfig,
    ) -> Result<Self, StreamError> {
        let mtu = validate_mtu(transport.mtu())?;
        Ok(Self {
            transport,
            codec,
            reliability: Reliability::new(reliability),
            outbox: Mutex::new(Outbox {
                next_seq: 0,
                pending: Vec::new(),
            }),
            frame_umps: (mtu - RTP_HEADER_LEN) / UMP_BYTES,
            max_fragment_bytes: stream.max_fragment_bytes,
            metrics: Arc::new(StreamMetrics::new()),
        })
    }

    pub fn metrics(&self) -> Arc<StreamMetrics> {
        self.metrics.clone()
    }

    /// Frames still buffered for resend.
    pub fn buffered(&self) -> usize {
        self.reliability.buffered()
    }

    /// Queue one event. Returns the seq of its last envelope.
    pub async fn send(&self, env: StreamEnvelope) -> Result<u64, StreamError> {
        let mut outbox = self.outbox.lock().await;
        let mut last = outbox.next_seq;

        for mut piece in fragment::split(env, self.max_fragment_bytes) {
            piece.seq = outbox.next_seq;
            let frames = self.codec.encode_stream(&piece)?;
            self.reliability.record(piece.seq, frames.clone());
            outbox.pending.extend(frames);
            self.metrics.event_sent();
            last = piece.seq;
            outbox.next_seq += 1;
        }
        tracing::trace!(seq = last, pending = outbox.pending.len(), "stream event queued");

        // pending holds whole runs only
        if outbox.pending.len() >= self.frame_umps {
            let pending = std::mem::take(&mut outbox.pending);
            self.transmit(&pending).await?;
        }
        Ok(last)
    }

    /// Push every pending frame to the transport.
    pub async fn flush(&self) -> Result<(), StreamError> {
        let mut outbox = self.outbox.lock().await;
        if outbox.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut outbox.pending);
        self.transmit(&pending).await
    }

    async fn transmit(&self, packets: &[Ump128]) -> Result<(), StreamError> {
        self.transport.send(packets).await?;
        self.metrics.add_bytes_sent(packets.len() * UMP_BYTES);
        Ok(())
    }

    /// Answer the receiver's control traffic on this sender's transport:
    /// acks release buffered frames, nacks re-send them.
    pub async fn run_ctrl(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut inbound = self
            .transport
            .take_inbound()
            .context("stream sender needs its transport's inbound channel")?;
        let mut assembler = FlexAssembler::new();

        loop {
            let batch = tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                batch = inbound.recv() => match batch {
                    Some(b) => b,
                    None => return Ok(()),
                },
            };
            self.metrics.add_bytes_received(batch.len() * UMP_BYTES);

            for text in assembler.push_batch(&batch) {
                let env = match text.and_then(|t| flexmidi_core::codec::parse_text::<StreamEnvelope>(&t)) {
                    Ok(env) => env,
                    Err(e) => {
                        tracing::debug!(error = %e, "undecodable ctrl traffic");
                        continue;
                    }
                };
                let Some(ctrl) = Ctrl::<u64>::from_stream_envelope(&env) else {
                    tracing::debug!(ev = %env.ev, "ignoring non-ctrl event on sender");
                    continue;
                };
                self.apply_ctrl(&ctrl).await;
            }
        }
    }

    async fn apply_ctrl(&self, ctrl: &Ctrl<u64>) {
        let Some(resends) = self.reliability.handle_ctrl(ctrl) else {
            return;
        };
        tracing::debug!(count = resends.len(), "retransmitting stream frames");
        for (seq, frames) in resends {
            match self.transmit(&frames).await {
                Ok(()) => self.metrics.add_retransmits(1),
                Err(e) => tracing::warn!(seq, error = %e, "stream retransmit failed"),
            }
        }
    }
}

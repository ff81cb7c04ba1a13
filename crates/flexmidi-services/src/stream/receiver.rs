use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use flexmidi_core::codec::parse_text;
use flexmidi_core::config::StreamConfig;
use flexmidi_core::ctrl::Ctrl;
use flexmidi_core::wire::UMP_BYTES;
use flexmidi_core::{FlexAssembler, FlexCodec, StreamEnvelope, Transport, UmpBatch};

use super::fragment::FragmentAssembler;
use super::reorder::ReorderBuffer;
use super::StreamError;
use crate::metrics::StreamMetrics;

const DELIVERY_CAPACITY: usize = 256;

/// What the receiver hands to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelivery {
    /// One complete event, fragments joined.
    Event(StreamEnvelope),
    /// Control-plane traffic from the peer.
    Ctrl(StreamEnvelope),
}

/// Receiving half of a stream session.
///
/// Only the sender keeps frames for resend; the receiver's outbound traffic
/// is ack/nack, which is regenerated rather than retransmitted.
pub struct StreamReceiver {
    transport: Arc<dyn Transport>,
    codec: FlexCodec,
    ack_every: u64,
    reorder: ReorderBuffer,
    fragments: FragmentAssembler,
    delivered_since_ack: u64,
    metrics: Arc<StreamMetrics>,
}

impl StreamReceiver {
    pub fn new(
        transport: Arc<dyn Transport>,
        codec: FlexCodec,
        stream: &StreamConfig,
    ) -> Self {
        Self {
            transport,
            codec,
            ack_every: stream.ack_every.max(1),
            reorder: ReorderBuffer::new(stream.max_reorder),
            fragments: FragmentAssembler::new(stream.max_fragments),
            delivered_since_ack: 0,
            metrics: Arc::new(StreamMetrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<StreamMetrics> {
        self.metrics.clone()
    }

    /// Start receiving on a background task. Deliveries arrive on the
    /// returned channel; the task ends on shutdown, when the transport's
    /// inbound closes, or when the channel's receiver is dropped.
    pub fn spawn(
        self,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(mpsc::Receiver<StreamDelivery>, JoinHandle<()>), StreamError> {
        let inbound = self.transport.take_inbound()?;
        let (tx, rx) = mpsc::channel(DELIVERY_CAPACITY);
        let handle = tokio::spawn(self.run(inbound, tx, shutdown));
        Ok((rx, handle))
    }

    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<UmpBatch>,
        deliveries: mpsc::Sender<StreamDelivery>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut assembler = FlexAssembler::new();
        loop {
            let batch = tokio::select! {
                _ = shutdown.recv() => break,
                batch = inbound.recv() => match batch {
                    Some(b) => b,
                    None => break,
                },
            };
            self.metrics.add_bytes_received(batch.len() * UMP_BYTES);

            for text in assembler.push_batch(&batch) {
                let env = match text.and_then(|t| parse_text::<StreamEnvelope>(&t)) {
                    Ok(env) => env,
                    Err(e) => {
                        tracing::warn!(error = %e, "undecodable stream event");
                        continue;
                    }
                };
                if !self.on_envelope(env, &deliveries).await {
                    tracing::debug!("stream consumer gone, receiver exiting");
                    return;
                }
            }
        }
        tracing::debug!("stream receiver stopped");
    }

    /// False once the consumer has dropped its channel.
    async fn on_envelope(&mut self, env: StreamEnvelope, deliveries: &mpsc::Sender<StreamDelivery>) -> bool {
        if env.is_ctrl() {
            return deliveries.send(StreamDelivery::Ctrl(env)).await.is_ok();
        }

        self.metrics.event_received();
        let out = self.reorder.push(env);
        if out.duplicate {
            tracing::trace!("duplicate stream event dropped");
            return true;
        }
        if !out.missing.is_empty() {
            tracing::debug!(missing = ?out.missing, "gap in stream, requesting resend");
            self.send_ctrl(&Ctrl::nack(out.missing)).await;
            self.metrics.nack_sent();
        }
        if out.skipped > 0 {
            self.metrics.add_sequence_gaps(out.skipped);
        }

        for env in out.ready {
            let seq = env.seq;
            match self.fragments.push(env) {
                Ok(Some(whole)) => {
                    if deliveries.send(StreamDelivery::Event(whole)).await.is_err() {
                        return false;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.metrics.fragment_rejected();
                    tracing::warn!(seq, error = %e, "dropping malformed fragment");
                }
            }

            self.delivered_since_ack += 1;
            if self.delivered_since_ack >= self.ack_every {
                self.delivered_since_ack = 0;
                self.send_ctrl(&Ctrl::ack(seq)).await;
                self.metrics.ack_sent();
            }
        }
        true
    }

    async fn send_ctrl(&self, ctrl: &Ctrl<u64>) {
        let frames = match ctrl
            .to_stream_envelope()
            .map_err(StreamError::from)
            .and_then(|env| Ok(self.codec.encode_stream(&env)?))
        {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, "ctrl message not encodable");
                return;
            }
        };
        match self.transport.send(&frames).await {
            Ok(()) => self.metrics.add_bytes_sent(frames.len() * UMP_BYTES),
            Err(e) => tracing::warn!(error = %e, "ctrl send failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use flexmidi_core::Fragment;
    use flexmidi_transport::LoopbackTransport;

    struct Fixture {
        peer: Arc<LoopbackTransport>,
        peer_rx: mpsc::Receiver<UmpBatch>,
        deliveries: mpsc::Receiver<StreamDelivery>,
        metrics: Arc<StreamMetrics>,
        _shutdown: broadcast::Sender<()>,
    }

    async fn fixture(stream: StreamConfig) -> Fixture {
        let (peer, local) = LoopbackTransport::pair();
        peer.open().await.unwrap();
        local.open().await.unwrap();
        let peer = Arc::new(peer);
        let peer_rx = peer.take_inbound().unwrap();

        let receiver = StreamReceiver::new(
            Arc::new(local),
            FlexCodec::default(),
            &stream,
        );
        let metrics = receiver.metrics();
        let (shutdown, _) = broadcast::channel(1);
        let (deliveries, _) = receiver.spawn(shutdown.subscribe()).unwrap();
        Fixture {
            peer,
            peer_rx,
            deliveries,
            metrics,
            _shutdown: shutdown,
        }
    }

    impl Fixture {
        async fn inject(&self, env: &StreamEnvelope) {
            let frames = FlexCodec::default().encode_stream(env).unwrap();
            self.peer.send(&frames).await.unwrap();
        }

        async fn next(&mut self) -> StreamDelivery {
            tokio::time::timeout(Duration::from_secs(2), self.deliveries.recv())
                .await
                .expect("timed out")
                .expect("receiver ended")
        }

        async fn next_ctrl_from_receiver(&mut self) -> Ctrl<u64> {
            let batch = tokio::time::timeout(Duration::from_secs(2), self.peer_rx.recv())
                .await
                .expect("timed out")
                .unwrap();
            let env = FlexCodec::default().decode_stream(&batch).unwrap();
            Ctrl::from_stream_envelope(&env).unwrap()
        }
    }

    fn token(seq: u64, data: &str) -> StreamEnvelope {
        let mut e = StreamEnvelope::new("token", data);
        e.seq = seq;
        e
    }

    fn event_data(d: StreamDelivery) -> (u64, String) {
        match d {
            StreamDelivery::Event(e) => (e.seq, e.data.unwrap_or_default()),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delivers_in_order_and_acks() {
        let mut fx = fixture(StreamConfig {
            ack_every: 2,
            ..StreamConfig::default()
        })
        .await;
        fx.inject(&token(0, "Hello")).await;
        fx.inject(&token(1, "from")).await;

        assert_eq!(event_data(fx.next().await), (0, "Hello".into()));
        assert_eq!(event_data(fx.next().await), (1, "from".into()));
        assert_eq!(fx.next_ctrl_from_receiver().await, Ctrl::ack(1));
    }

    #[tokio::test]
    async fn gap_is_nacked_then_delivered_in_order() {
        let mut fx = fixture(StreamConfig::default()).await;
        fx.inject(&token(0, "a")).await;
        fx.inject(&token(2, "c")).await;

        assert_eq!(event_data(fx.next().await), (0, "a".into()));
        assert_eq!(fx.next_ctrl_from_receiver().await, Ctrl::nack(vec![1]));

        fx.inject(&token(1, "b")).await;
        assert_eq!(event_data(fx.next().await), (1, "b".into()));
        assert_eq!(event_data(fx.next().await), (2, "c".into()));
        assert_eq!(fx.metrics.snapshot().nacks_sent, 1);
    }

    #[tokio::test]
    async fn fragments_fire_only_when_complete() {
        let mut fx = fixture(StreamConfig::default()).await;
        let mut first = token(0, "Hel").with_id("f");
        first.frag = Some(Fragment { i: 0, n: 2 });
        let mut last = token(1, "lo").with_id("f");
        last.frag = Some(Fragment { i: 1, n: 2 });

        fx.inject(&first).await;
        let early = tokio::time::timeout(Duration::from_millis(100), fx.deliveries.recv()).await;
        assert!(early.is_err(), "first fragment must not fire");

        fx.inject(&last).await;
        assert_eq!(event_data(fx.next().await), (1, "Hello".into()));
    }

    #[tokio::test]
    async fn oversized_fragment_count_is_counted_and_dropped() {
        let mut fx = fixture(StreamConfig {
            max_fragments: 8,
            ..StreamConfig::default()
        })
        .await;
        let mut huge = token(0, "x").with_id("h");
        huge.frag = Some(Fragment { i: 0, n: u32::MAX });
        fx.inject(&huge).await;
        fx.inject(&token(1, "after")).await;

        assert_eq!(event_data(fx.next().await), (1, "after".into()));
        assert_eq!(fx.metrics.snapshot().fragments_rejected, 1);
    }

    #[tokio::test]
    async fn ctrl_is_surfaced() {
        let mut fx = fixture(StreamConfig::default()).await;
        let ack = Ctrl::ack(7u64).to_stream_envelope().unwrap();
        fx.inject(&ack).await;
        match fx.next().await {
            StreamDelivery::Ctrl(env) => assert_eq!(Ctrl::from_stream_envelope(&env), Some(Ctrl::ack(7u64))),
            other => panic!("expected ctrl, got {other:?}"),
        }
    }
}

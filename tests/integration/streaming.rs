use crate::*;

use flexmidi_core::config::{ReliabilityConfig, StreamConfig};
use flexmidi_core::ctrl::Ctrl;
use flexmidi_core::wire::{RTP_HEADER_LEN, UMP_BYTES};
use flexmidi_core::{FlexCodec, StreamEnvelope};
use flexmidi_services::{StreamDelivery, StreamReceiver, StreamSender};
use flexmidi_transport::LoopbackTransport;
use tokio::sync::broadcast;

const TOKENS: [&str; 4] = ["Hello", "from", "two", "sessions"];

struct StreamPair {
    sender: Arc<StreamSender>,
    deliveries: mpsc::Receiver<StreamDelivery>,
    receiver_metrics: Arc<flexmidi_services::metrics::StreamMetrics>,
    shutdown: broadcast::Sender<()>,
}

async fn stream_pair(
    wrap_sender: impl FnOnce(Arc<dyn Transport>) -> Arc<dyn Transport>,
    stream: StreamConfig,
) -> Result<StreamPair> {
    let (a, b) = LoopbackTransport::pair();
    a.open().await?;
    b.open().await?;
    let sender_transport = wrap_sender(Arc::new(a));

    let (shutdown, _) = broadcast::channel(1);
    let sender = Arc::new(StreamSender::new(
        sender_transport,
        FlexCodec::default(),
        &stream,
        &ReliabilityConfig::default(),
    )?);
    tokio::spawn(sender.clone().run_ctrl(shutdown.subscribe()));

    let receiver = StreamReceiver::new(Arc::new(b), FlexCodec::default(), &stream);
    let receiver_metrics = receiver.metrics();
    let (deliveries, _) = receiver.spawn(shutdown.subscribe())?;

    Ok(StreamPair {
        sender,
        deliveries,
        receiver_metrics,
        shutdown,
    })
}

impl StreamPair {
    async fn next_event(&mut self) -> Result<StreamEnvelope> {
        loop {
            match within("stream event", self.deliveries.recv())
                .await?
                .context("receiver ended")?
            {
                StreamDelivery::Event(env) => return Ok(env),
                StreamDelivery::Ctrl(_) => continue,
            }
        }
    }
}

#[tokio::test]
async fn test_tokens_arrive_in_order() -> Result<()> {
    let mut pair = stream_pair(|t| t, StreamConfig::default()).await?;

    for token in TOKENS {
        pair.sender.send(StreamEnvelope::new("token", token)).await?;
    }
    pair.sender.flush().await?;

    for (seq, token) in TOKENS.iter().enumerate() {
        let env = pair.next_event().await?;
        assert_eq!(env.seq, seq as u64);
        assert_eq!(env.data.as_deref(), Some(*token));
    }
    let _ = pair.shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn test_large_event_is_fragmented_and_rejoined() -> Result<()> {
    let stream = StreamConfig {
        max_fragment_bytes: 16,
        ..StreamConfig::default()
    };
    let mut pair = stream_pair(|t| t, stream).await?;

    let text = "Übermäßig lange Nachricht, die in Stücke geteilt wird.";
    let last = pair.sender.send(StreamEnvelope::new("token", text)).await?;
    assert!(last > 0, "expected more than one fragment");
    pair.sender.flush().await?;

    let env = pair.next_event().await?;
    assert_eq!(env.data.as_deref(), Some(text));
    assert_eq!(env.frag, None);
    assert_eq!(env.seq, last);
    let _ = pair.shutdown.send(());
    Ok(())
}

/// The sender's third transport call (seq 2) is lost; the receiver nacks
/// the gap and the sender's ctrl loop re-sends it.
#[tokio::test]
async fn test_lost_event_is_repaired_by_nack() -> Result<()> {
    let mut pair = stream_pair(
        |t| -> Arc<dyn Transport> { Arc::new(LossyTransport::new(t, vec![2])) },
        StreamConfig::default(),
    )
    .await?;

    for token in ["a", "b", "c", "d", "e"] {
        pair.sender.send(StreamEnvelope::new("token", token)).await?;
        pair.sender.flush().await?;
    }

    let mut got = Vec::new();
    for _ in 0..5 {
        let env = pair.next_event().await?;
        got.push((env.seq, env.data.unwrap_or_default()));
    }
    let expected: Vec<(u64, String)> = ["a", "b", "c", "d", "e"]
        .iter()
        .enumerate()
        .map(|(i, t)| (i as u64, t.to_string()))
        .collect();
    assert_eq!(got, expected);

    // The retransmit counter is bumped after the resend leaves the sender.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pair.receiver_metrics.snapshot().nacks_sent, 1);
    assert_eq!(pair.sender.metrics().snapshot().retransmits, 1);
    let _ = pair.shutdown.send(());
    Ok(())
}

/// Two packets per frame, so every event spans several frames. A stream of
/// nacks for seq 0 runs alongside the sends; each resend must land between
/// runs, never inside one.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retransmits_never_split_a_run() -> Result<()> {
    let (a, b) = LoopbackTransport::pair_with_mtu(RTP_HEADER_LEN + 2 * UMP_BYTES);
    a.open().await?;
    b.open().await?;
    let mut inbound = b.take_inbound()?;

    let (shutdown, _) = broadcast::channel(1);
    let sender = Arc::new(StreamSender::new(
        Arc::new(a),
        FlexCodec::default(),
        &StreamConfig::default(),
        &ReliabilityConfig::default(),
    )?);
    let ctrl_task = tokio::spawn(sender.clone().run_ctrl(shutdown.subscribe()));

    sender.send(StreamEnvelope::new("token", "first")).await?;
    sender.flush().await?;

    let codec = FlexCodec::default();
    let nack = codec.encode_stream(&Ctrl::nack(vec![0u64]).to_stream_envelope()?)?;
    let burst = {
        let sender = sender.clone();
        tokio::spawn(async move {
            for i in 0..20 {
                let data = format!("event {i} {}", "x".repeat(40));
                sender.send(StreamEnvelope::new("token", data)).await?;
            }
            sender.flush().await?;
            anyhow::Ok(())
        })
    };
    for _ in 0..20 {
        b.send(&nack).await?;
        tokio::task::yield_now().await;
    }
    burst.await??;

    let mut assembler = FlexAssembler::new();
    let mut seen = std::collections::BTreeSet::new();
    while let Ok(Some(batch)) = tokio::time::timeout(Duration::from_millis(300), inbound.recv()).await {
        for text in assembler.push_batch(&batch) {
            let env: StreamEnvelope = parse_text(&text?)?;
            seen.insert(env.seq);
        }
    }
    assert_eq!(assembler.interrupted_runs(), 0);
    assert_eq!(seen, (0..=20).collect());

    let _ = shutdown.send(());
    ctrl_task.await??;
    Ok(())
}

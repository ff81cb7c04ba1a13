use crate::*;

use flexmidi_core::config::ReliabilityConfig;
use flexmidi_core::{FlexCodec, JsonValue, Reply};
use flexmidi_services::handler::{handler_fn, PingHandler};
use flexmidi_services::{FlexBridge, IntentRouter, Journal, JournalRole, MemoryJournal};
use flexmidi_transport::LoopbackTransport;
use tokio::sync::broadcast;

fn ping_envelope() -> CommandEnvelope {
    CommandEnvelope {
        v: 1,
        ts: 1000,
        corr: "abc".into(),
        intent: "ping".into(),
        body: JsonValue::object(Vec::<(String, JsonValue)>::new()),
    }
}

/// Origin sends a ping; the serving side sees the identical envelope and the
/// origin gets the ack followed by the final reply.
#[tokio::test]
async fn test_loopback_ping_ack_then_reply() -> Result<()> {
    let (origin, server) = LoopbackTransport::pair();
    origin.open().await?;
    server.open().await?;
    let mut replies = EnvelopeReader::new(&origin)?;

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let recording = handler_fn(move |env: CommandEnvelope| {
        let seen_tx = seen_tx.clone();
        async move {
            let _ = seen_tx.send(env);
            Ok(Reply::success())
        }
    });
    let journal = Arc::new(MemoryJournal::new());
    let bridge = FlexBridge::new(
        Arc::new(server),
        Arc::new(IntentRouter::new().route("ping", recording)),
        journal.clone(),
        &ReliabilityConfig::default(),
    );
    let (shutdown, _) = broadcast::channel(1);
    let task = tokio::spawn(bridge.run(shutdown.subscribe()));

    let sent = ping_envelope();
    origin.send(&FlexCodec::default().encode(&sent)?).await?;

    let seen = within("handler", seen_rx.recv()).await?.context("handler gone")?;
    assert_eq!(seen, sent);

    let ack = replies.next().await?;
    assert_eq!(ack.corr, "abc");
    assert_eq!(ack.as_reply(), Some(Reply::ack()));
    let done = replies.next().await?;
    assert_eq!(done.as_reply(), Some(Reply::success()));

    let tail = journal.tail(10).await?;
    let roles: Vec<JournalRole> = tail.iter().map(|e| e.role).collect();
    assert_eq!(roles, vec![JournalRole::Request, JournalRole::Response]);

    shutdown.send(())?;
    task.await??;
    Ok(())
}

/// A repeat inside the replay window is suppressed; no third reply arrives.
#[tokio::test]
async fn test_duplicate_request_is_suppressed() -> Result<()> {
    let (origin, server) = LoopbackTransport::pair();
    origin.open().await?;
    server.open().await?;
    let mut replies = EnvelopeReader::new(&origin)?;

    let bridge = FlexBridge::new(
        Arc::new(server),
        Arc::new(IntentRouter::new().route("ping", Arc::new(PingHandler))),
        Arc::new(MemoryJournal::new()),
        &ReliabilityConfig::default(),
    );
    let (shutdown, _) = broadcast::channel(1);
    let task = tokio::spawn(bridge.run(shutdown.subscribe()));

    let frames = FlexCodec::default().encode(&ping_envelope())?;
    origin.send(&frames).await?;
    origin.send(&frames).await?;

    replies.next().await?;
    replies.next().await?;
    let extra = tokio::time::timeout(Duration::from_millis(200), replies.next()).await;
    assert!(extra.is_err(), "duplicate produced a reply: {extra:?}");

    shutdown.send(())?;
    task.await??;
    Ok(())
}

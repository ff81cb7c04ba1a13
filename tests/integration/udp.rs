use crate::*;

use flexmidi_core::config::{FlexConfig, ReliabilityConfig};
use flexmidi_core::{FlexCodec, Reply, SessionPhase};
use flexmidi_services::handler::PingHandler;
use flexmidi_services::{FlexBridge, IntentRouter, MemoryJournal};
use flexmidi_transport::{RtpMidiSession, SessionOptions};
use tokio::sync::broadcast;

fn config_for(bind: u16, peer: u16) -> FlexConfig {
    let mut config = FlexConfig::default();
    config.session.bind_addr = localhost(bind).to_string();
    config.session.peer_addr = localhost(peer).to_string();
    config.session.enable_discovery = false;
    config
}

fn session(config: &FlexConfig) -> Result<Arc<RtpMidiSession>> {
    Ok(Arc::new(RtpMidiSession::new(SessionOptions::from_config(config)?)))
}

#[tokio::test]
async fn test_udp_sessions_learn_each_other() -> Result<()> {
    let (pa, pb) = (free_port(), free_port());
    let a = session(&config_for(pa, pb))?;
    let b = session(&config_for(pb, pa))?;

    let (ra, rb) = tokio::join!(a.open(), b.open());
    ra?;
    rb?;

    assert_eq!(a.state().remote_id, Some(b.local_id()));
    assert_eq!(b.state().remote_id, Some(a.local_id()));
    assert!(a.state().is_negotiated());

    a.close().await;
    b.close().await;
    assert_eq!(a.state().phase, SessionPhase::Closed);
    Ok(())
}

/// The peer opens after a delay; the opener's retries still complete the
/// handshake within the timeout.
#[tokio::test]
async fn test_late_peer_still_negotiates() -> Result<()> {
    let (pa, pb) = (free_port(), free_port());
    let a = session(&config_for(pa, pb))?;
    let b = session(&config_for(pb, pa))?;

    let late_b = {
        let b = b.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            b.open().await
        }
    };
    let (ra, rb) = tokio::join!(a.open(), late_b);
    ra?;
    rb?;
    assert_eq!(a.state().remote_id, Some(b.local_id()));

    a.close().await;
    b.close().await;
    Ok(())
}

#[tokio::test]
async fn test_required_negotiation_fails_without_peer() -> Result<()> {
    let mut config = config_for(free_port(), free_port());
    config.session.negotiation_timeout_ms = 300;
    config.session.require_negotiation = true;
    let a = session(&config)?;

    let err = a.open().await.unwrap_err();
    assert!(matches!(err, TransportError::NegotiationTimeout(300)), "{err}");
    assert_eq!(a.state().phase, SessionPhase::Closed);
    assert!(matches!(
        a.send(&[Ump128::default()]).await,
        Err(TransportError::NotConnected)
    ));
    Ok(())
}

/// Full request path over UDP: origin session → bridge session → replies.
#[tokio::test]
async fn test_bridge_over_udp() -> Result<()> {
    let (pa, pb) = (free_port(), free_port());
    let origin = session(&config_for(pa, pb))?;
    let server = session(&config_for(pb, pa))?;
    let (ro, rs) = tokio::join!(origin.open(), server.open());
    ro?;
    rs?;

    let mut replies = EnvelopeReader::new(&*origin)?;
    let bridge = FlexBridge::new(
        server.clone(),
        Arc::new(IntentRouter::new().route("ping", Arc::new(PingHandler))),
        Arc::new(MemoryJournal::new()),
        &ReliabilityConfig::default(),
    );
    let (shutdown, _) = broadcast::channel(1);
    let task = tokio::spawn(bridge.run(shutdown.subscribe()));

    let state = origin.state();
    let codec = FlexCodec::new(state.negotiated_group, state.negotiated_channel);
    let request = CommandEnvelope::new("udp-1", "ping", flexmidi_core::JsonValue::Null);
    origin.send(&codec.encode(&request)?).await?;

    let ack = replies.next().await?;
    assert_eq!((ack.corr.as_str(), ack.as_reply()), ("udp-1", Some(Reply::ack())));
    let done = replies.next().await?;
    assert_eq!(done.as_reply(), Some(Reply::success()));

    shutdown.send(())?;
    task.await??;
    origin.close().await;
    server.close().await;
    Ok(())
}

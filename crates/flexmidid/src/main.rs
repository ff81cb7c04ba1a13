//! flexmidid: serves flexmidi requests over an RTP-MIDI session.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use flexmidi_core::config::FlexConfig;
use flexmidi_core::Transport;
use flexmidi_services::handler::PingHandler;
use flexmidi_services::{FileJournal, FlexBridge, IntentRouter, Journal, MemoryJournal};
use flexmidi_transport::{RtpMidiSession, SessionOptions};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = FlexConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = FlexConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        FlexConfig::default()
    });

    let options = SessionOptions::from_config(&config).context("invalid session config")?;
    let session = Arc::new(RtpMidiSession::new(options));
    tracing::info!(
        local_id = %session.local_id(),
        name = %config.session.local_name,
        bind = %config.session.bind_addr,
        "flexmidid starting"
    );

    session.open().await.context("failed to open session")?;
    let state = session.state();
    tracing::info!(
        peer = ?state.peer_addr,
        remote_id = ?state.remote_id,
        version = state.protocol_version,
        "session ready"
    );

    let journal: Arc<dyn Journal> = if config.bridge.journal_dir.as_os_str().is_empty() {
        tracing::info!("journal in memory");
        Arc::new(MemoryJournal::new())
    } else {
        let journal = FileJournal::new(&config.bridge.journal_dir)
            .await
            .context("failed to open journal directory")?;
        tracing::info!(root = %journal.root().display(), "journal initialized");
        Arc::new(journal)
    };

    let router = IntentRouter::new().route("ping", Arc::new(PingHandler));
    tracing::info!(intents = ?router.intents(), "routes registered");

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let bridge = FlexBridge::new(
        session.clone(),
        Arc::new(router),
        journal,
        &config.reliability,
    );
    let mut bridge_task = tokio::spawn(bridge.run(shutdown_tx.subscribe()));

    let state_printer = {
        let mut state_rx = session.subscribe_state();
        tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                let s = state_rx.borrow_and_update().clone();
                tracing::info!(
                    phase = ?s.phase,
                    remote_id = ?s.remote_id,
                    group = s.negotiated_group,
                    channel = s.negotiated_channel,
                    "session state changed"
                );
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    let bridge_done = tokio::select! {
        _ = shutdown_rx.recv() => {
            tracing::info!("shutting down");
            false
        }
        r = &mut bridge_task => {
            log_bridge_exit(r);
            true
        }
        r = state_printer => {
            tracing::error!("state printer exited: {:?}", r);
            false
        }
    };

    // Handler tasks must be gone before the session closes under them.
    if !bridge_done {
        let _ = shutdown_tx.send(());
        log_bridge_exit(bridge_task.await);
    }

    session.close().await;
    Ok(())
}

fn log_bridge_exit(r: Result<Result<()>, tokio::task::JoinError>) {
    match r {
        Ok(Ok(())) => tracing::info!("bridge exited"),
        Ok(Err(e)) => tracing::error!(error = %e, "bridge failed"),
        Err(e) => tracing::error!(error = %e, "bridge task panicked"),
    }
}

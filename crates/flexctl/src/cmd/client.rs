//! A short-lived session that sends requests and collects their replies.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;

use flexmidi_core::codec::parse_text;
use flexmidi_core::config::FlexConfig;
use flexmidi_core::ctrl::Ctrl;
use flexmidi_core::{CommandEnvelope, FlexAssembler, FlexCodec, Transport, UmpBatch};
use flexmidi_transport::{RtpMidiSession, SessionOptions};

use super::request::{is_final, Outcome};

pub struct Client {
    session: RtpMidiSession,
    inbound: mpsc::Receiver<UmpBatch>,
    assembler: FlexAssembler,
    codec: FlexCodec,
}

impl Client {
    pub async fn connect(config: &FlexConfig, bind: SocketAddr, peer: Option<SocketAddr>) -> Result<Self> {
        let mut options = SessionOptions::from_config(config).context("invalid session config")?;
        options.bind_addr = bind;
        if peer.is_some() {
            options.peer_addr = peer;
            options.enable_discovery = false;
        }
        if options.peer_addr.is_none() && !options.enable_discovery {
            bail!("no peer: pass --peer or set session.peer_addr");
        }

        let session = RtpMidiSession::new(options);
        let inbound = session.take_inbound()?;
        session.open().await.context("failed to open session")?;
        let state = session.state();
        tracing::debug!(peer = ?state.peer_addr, remote = ?state.remote_id, "client session ready");

        Ok(Self {
            codec: FlexCodec::new(state.negotiated_group, state.negotiated_channel),
            session,
            inbound,
            assembler: FlexAssembler::new(),
        })
    }

    /// Send `env` and wait for its final reply. If only the ack arrives in
    /// time, the final reply is nacked once before giving up.
    pub async fn request(&mut self, env: &CommandEnvelope, timeout: Duration) -> Result<Outcome> {
        let mut outcome = Outcome {
            corr: env.corr.clone(),
            replies: Vec::new(),
        };
        self.send(env).await?;

        let mut nacked = false;
        loop {
            if self.collect(&mut outcome, timeout).await? {
                let ack = Ctrl::ack(outcome.corr.clone()).to_command_envelope()?;
                self.send(&ack).await?;
                return Ok(outcome);
            }
            if nacked || outcome.replies.is_empty() {
                return Ok(outcome);
            }
            tracing::info!(corr = %outcome.corr, "final reply overdue, asking for a resend");
            let nack = Ctrl::nack(vec![outcome.corr.clone()]).to_command_envelope()?;
            self.send(&nack).await?;
            nacked = true;
        }
    }

    pub async fn close(&self) {
        self.session.close().await;
    }

    async fn send(&self, env: &CommandEnvelope) -> Result<()> {
        let frames = self.codec.encode(env)?;
        self.session.send(&frames).await?;
        Ok(())
    }

    /// Gather replies for `outcome.corr` until a final one or the deadline.
    async fn collect(&mut self, outcome: &mut Outcome, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let batch = match tokio::time::timeout_at(deadline, self.inbound.recv()).await {
                Ok(Some(batch)) => batch,
                Ok(None) => bail!("session closed while waiting for {}", outcome.corr),
                Err(_) => return Ok(false),
            };
            for text in self.assembler.push_batch(&batch) {
                let env: CommandEnvelope = match text.and_then(|t| parse_text(&t)) {
                    Ok(env) => env,
                    Err(e) => {
                        tracing::debug!(error = %e, "ignoring undecodable reply");
                        continue;
                    }
                };
                if env.corr != outcome.corr {
                    continue;
                }
                let Some(reply) = env.as_reply() else {
                    continue;
                };
                let done = is_final(&reply);
                outcome.replies.push(reply);
                if done {
                    return Ok(true);
                }
            }
        }
    }
}

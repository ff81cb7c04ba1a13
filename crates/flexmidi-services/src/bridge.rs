//! Bridge: serves requests arriving on a transport.
//!
//! Per inbound request: reassemble → decode → replay check → journal the
//! request → ack → run the handler on its own task → journal the result →
//! final reply. Exactly two replies go out per dispatched request.
//!
//! The read loop never awaits a transport send itself. Every outbound
//! reply runs on the handler set, so a peer that stops reading cannot
//! wedge the loop that drains our own inbound channel.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use flexmidi_core::codec::parse_text;
use flexmidi_core::config::ReliabilityConfig;
use flexmidi_core::ctrl::Ctrl;
use flexmidi_core::envelope::UNKNOWN_CORR;
use flexmidi_core::{
    CodecError, CommandEnvelope, FlexAssembler, FlexCodec, JsonValue, Reply, Transport,
    TransportError,
};

use crate::handler::RouteHandler;
use crate::journal::{Journal, JournalRole};
use crate::reliability::{Reliability, ReplayVerdict};

pub struct FlexBridge {
    transport: Arc<dyn Transport>,
    handler: Arc<dyn RouteHandler>,
    journal: Arc<dyn Journal>,
    reliability: Arc<Reliability<String>>,
}

/// State shared with handler tasks.
#[derive(Clone)]
struct Dispatch {
    transport: Arc<dyn Transport>,
    codec: FlexCodec,
    handler: Arc<dyn RouteHandler>,
    journal: Arc<dyn Journal>,
    reliability: Arc<Reliability<String>>,
}

impl FlexBridge {
    pub fn new(
        transport: Arc<dyn Transport>,
        handler: Arc<dyn RouteHandler>,
        journal: Arc<dyn Journal>,
        config: &ReliabilityConfig,
    ) -> Self {
        Self {
            transport,
            handler,
            journal,
            reliability: Arc::new(Reliability::new(config)),
        }
    }

    pub fn reliability(&self) -> &Arc<Reliability<String>> {
        &self.reliability
    }

    /// Serve until shutdown. The transport must already be open; replies
    /// use its negotiated group and channel.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut inbound = self
            .transport
            .take_inbound()
            .context("bridge needs the transport's inbound channel")?;

        let state = self.transport.state();
        let dispatch = Dispatch {
            transport: self.transport.clone(),
            codec: FlexCodec::new(state.negotiated_group, state.negotiated_channel),
            handler: self.handler.clone(),
            journal: self.journal.clone(),
            reliability: self.reliability.clone(),
        };
        let mut assembler = FlexAssembler::new();
        let mut handlers: JoinSet<()> = JoinSet::new();

        tracing::info!(
            group = state.negotiated_group,
            channel = state.negotiated_channel,
            "bridge serving"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(in_flight = handlers.len(), "bridge shutting down");
                    handlers.shutdown().await;
                    return Ok(());
                }

                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!(error = %e, "handler task panicked");
                        }
                    }
                }

                batch = inbound.recv() => {
                    let Some(batch) = batch else {
                        tracing::info!("transport inbound closed, bridge exiting");
                        handlers.shutdown().await;
                        return Ok(());
                    };
                    for text in assembler.push_batch(&batch) {
                        dispatch.on_message(text, &mut handlers);
                    }
                }
            }
        }
    }
}

impl Dispatch {
    fn on_message(&self, text: Result<Vec<u8>, CodecError>, handlers: &mut JoinSet<()>) {
        let env = match text.and_then(|t| parse_text::<CommandEnvelope>(&t)) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable request");
                let this = self.clone();
                let reply = Reply::failure(e.to_string());
                handlers.spawn(async move { this.send_reply(UNKNOWN_CORR, &reply).await });
                return;
            }
        };

        if env.is_reply() {
            tracing::trace!(corr = %env.corr, "ignoring reply envelope");
            return;
        }

        if env.is_ctrl() {
            self.on_ctrl(&env, handlers);
            return;
        }

        if self.reliability.check_replay(&env) == ReplayVerdict::Suppressed {
            tracing::info!(corr = %env.corr, intent = %env.intent, ts = env.ts, "duplicate request suppressed");
            return;
        }

        let this = self.clone();
        handlers.spawn(async move { this.serve(env).await });
    }

    fn on_ctrl(&self, env: &CommandEnvelope, handlers: &mut JoinSet<()>) {
        let Some(ctrl) = Ctrl::<String>::from_command_envelope(env) else {
            tracing::debug!("malformed ctrl envelope");
            return;
        };
        let Some(resends) = self.reliability.handle_ctrl(&ctrl) else {
            return;
        };
        let transport = self.transport.clone();
        handlers.spawn(async move {
            for (corr, frames) in resends {
                tracing::debug!(corr = %corr, "retransmitting reply");
                if let Err(e) = transport.send(&frames).await {
                    tracing::warn!(corr = %corr, error = %e, "reply retransmit failed");
                }
            }
        });
    }

    async fn serve(self, env: CommandEnvelope) {
        let corr = env.corr.clone();
        tracing::debug!(corr = %corr, intent = %env.intent, "dispatching");

        match JsonValue::from_serialize(&env) {
            Ok(record) => self.journal_write(&corr, JournalRole::Request, &record).await,
            Err(e) => tracing::warn!(corr = %corr, error = %e, "request not journaled"),
        }

        self.send_reply(&corr, &Reply::ack()).await;

        let reply = match self.handler.handle(&env).await {
            Ok(r) => Reply {
                ack: true,
                success: r.success.or(Some(true)),
                ..r
            },
            Err(e) => {
                tracing::info!(corr = %corr, error = %e, "handler failed");
                Reply::failure(e.to_string())
            }
        };

        self.journal_write(&corr, JournalRole::Response, &reply.to_body()).await;

        let frames = match self.codec.encode(&CommandEnvelope::reply(&corr, &reply)) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(corr = %corr, error = %e, "final reply not encodable");
                return;
            }
        };
        self.reliability.record(corr.clone(), frames.clone());
        if let Err(e) = self.transport.send(&frames).await {
            tracing::warn!(corr = %corr, error = %e, "final reply send failed");
        }
    }

    async fn journal_write(&self, corr: &str, role: JournalRole, payload: &JsonValue) {
        if let Err(e) = self.journal.write(corr, role, payload).await {
            tracing::warn!(corr, role = role.as_str(), error = %e, "journal write failed");
        }
    }

    /// Best-effort reply. Failures are logged, never propagated.
    async fn send_reply(&self, corr: &str, reply: &Reply) {
        if let Err(e) = self.try_send_reply(corr, reply).await {
            tracing::warn!(corr, error = %e, "reply send failed");
        }
    }

    async fn try_send_reply(&self, corr: &str, reply: &Reply) -> Result<(), ReplyError> {
        let frames = self.codec.encode(&CommandEnvelope::reply(corr, reply))?;
        self.transport.send(&frames).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum ReplyError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

//! flexmidi integration test harness.
//!
//! Scenarios run end to end in one process: over `LoopbackTransport` pairs
//! and over real UDP sessions on 127.0.0.1. Nothing here needs root or a
//! network beyond the loopback interface.
//!
//!   cargo test --test integration

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use flexmidi_core::codec::parse_text;
use flexmidi_core::{
    CommandEnvelope, FlexAssembler, SessionState, Transport, TransportError, Ump128, UmpBatch,
};

mod bridge;
mod streaming;
mod udp;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const STEP_TIMEOUT: Duration = Duration::from_secs(3);

/// An unused UDP port on 127.0.0.1.
pub fn free_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .and_then(|s| s.local_addr())
        .map(|a| a.port())
        .expect("no free port")
}

pub fn localhost(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Await `fut`, failing the step after [`STEP_TIMEOUT`].
pub async fn within<T>(what: &str, fut: impl std::future::Future<Output = T>) -> Result<T> {
    tokio::time::timeout(STEP_TIMEOUT, fut)
        .await
        .with_context(|| format!("timed out waiting for {what}"))
}

/// Reads command envelopes off a transport's inbound channel.
pub struct EnvelopeReader {
    inbound: mpsc::Receiver<UmpBatch>,
    assembler: FlexAssembler,
    queued: std::collections::VecDeque<CommandEnvelope>,
}

impl EnvelopeReader {
    pub fn new(transport: &dyn Transport) -> Result<Self> {
        Ok(Self {
            inbound: transport.take_inbound()?,
            assembler: FlexAssembler::new(),
            queued: Default::default(),
        })
    }

    pub async fn next(&mut self) -> Result<CommandEnvelope> {
        loop {
            if let Some(env) = self.queued.pop_front() {
                return Ok(env);
            }
            let batch = within("envelope", self.inbound.recv())
                .await?
                .context("inbound closed")?;
            for text in self.assembler.push_batch(&batch) {
                self.queued.push_back(parse_text(&text?)?);
            }
        }
    }
}

/// Wraps a transport and silently drops chosen `send` calls.
///
/// Calls are counted from zero; a call listed in `drop_calls` reports
/// success but never reaches the wire.
pub struct LossyTransport {
    inner: Arc<dyn Transport>,
    drop_calls: Vec<usize>,
    calls: AtomicUsize,
}

impl LossyTransport {
    pub fn new(inner: Arc<dyn Transport>, drop_calls: Vec<usize>) -> Self {
        Self {
            inner,
            drop_calls,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for LossyTransport {
    async fn open(&self) -> Result<(), TransportError> {
        self.inner.open().await
    }

    async fn send(&self, packets: &[Ump128]) -> Result<(), TransportError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.drop_calls.contains(&n) {
            return Ok(());
        }
        self.inner.send(packets).await
    }

    async fn close(&self) {
        self.inner.close().await
    }

    fn take_inbound(&self) -> Result<mpsc::Receiver<UmpBatch>, TransportError> {
        self.inner.take_inbound()
    }

    fn state(&self) -> SessionState {
        self.inner.state()
    }

    fn mtu(&self) -> usize {
        self.inner.mtu()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_lossy_transport_drops_only_listed_calls() {
    let (a, b) = flexmidi_transport::LoopbackTransport::pair();
    a.open().await.unwrap();
    b.open().await.unwrap();
    let mut rx = b.take_inbound().unwrap();
    let lossy = LossyTransport::new(Arc::new(a), vec![1]);

    for i in 0..3u32 {
        lossy.send(&[Ump128::from_words([i, 0, 0, 0])]).await.unwrap();
    }
    assert_eq!(lossy.calls(), 3);
    assert_eq!(rx.recv().await.unwrap()[0].words[0], 0);
    assert_eq!(rx.recv().await.unwrap()[0].words[0], 2);
}

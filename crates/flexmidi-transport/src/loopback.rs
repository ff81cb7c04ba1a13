//! In-process transport for tests and single-process wiring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use uuid::Uuid;

use flexmidi_core::transport::{SessionPhase, SessionState, Transport, TransportError, UmpBatch};
use flexmidi_core::wire::{Ump128, DEFAULT_MTU};

use crate::frame::{frame_capacity, FramePacker};
use crate::session::INBOUND_CAPACITY;

/// Delivers sends straight into an inbound channel: its own for
/// [`LoopbackTransport::new`], the other end's for [`LoopbackTransport::pair`].
///
/// Sends are framed under the MTU exactly like the UDP session, one batch
/// per frame. Concurrent sends queue behind each other so the frames of one
/// call stay contiguous.
pub struct LoopbackTransport {
    mtu: usize,
    local_id: Uuid,
    remote_id: Uuid,
    target: mpsc::Sender<UmpBatch>,
    send_lock: AsyncMutex<()>,
    inbound_rx: Mutex<Option<mpsc::Receiver<UmpBatch>>>,
    state: Mutex<SessionState>,
    opened_once: AtomicBool,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::with_mtu(DEFAULT_MTU)
    }

    pub fn with_mtu(mtu: usize) -> Self {
        let local_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        Self::build(mtu, local_id, local_id, tx, rx)
    }

    /// Two endpoints wired back to back.
    pub fn pair() -> (Self, Self) {
        Self::pair_with_mtu(DEFAULT_MTU)
    }

    pub fn pair_with_mtu(mtu: usize) -> (Self, Self) {
        let (a_id, b_id) = (Uuid::new_v4(), Uuid::new_v4());
        let (a_tx, a_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(INBOUND_CAPACITY);
        (
            Self::build(mtu, a_id, b_id, b_tx, a_rx),
            Self::build(mtu, b_id, a_id, a_tx, b_rx),
        )
    }

    fn build(
        mtu: usize,
        local_id: Uuid,
        remote_id: Uuid,
        target: mpsc::Sender<UmpBatch>,
        inbound_rx: mpsc::Receiver<UmpBatch>,
    ) -> Self {
        Self {
            mtu,
            local_id,
            remote_id,
            target,
            send_lock: AsyncMutex::new(()),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            state: Mutex::new(SessionState::new(local_id, 0, 0)),
            opened_once: AtomicBool::new(false),
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    fn phase(&self) -> SessionPhase {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).phase
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open(&self) -> Result<(), TransportError> {
        frame_capacity(self.mtu)?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.phase = SessionPhase::Ready;
        state.remote_id = Some(self.remote_id);
        self.opened_once.store(true, Ordering::SeqCst);
        tracing::debug!(local = %self.local_id, remote = %self.remote_id, "loopback open");
        Ok(())
    }

    async fn send(&self, packets: &[Ump128]) -> Result<(), TransportError> {
        if self.phase() != SessionPhase::Ready {
            return Err(if self.opened_once.load(Ordering::SeqCst) {
                TransportError::SessionClosed
            } else {
                TransportError::NotConnected
            });
        }
        let frames = FramePacker::pack(self.mtu, packets)?;
        let _guard = self.send_lock.lock().await;
        for frame in frames {
            self.target
                .send(frame)
                .await
                .map_err(|_| TransportError::Send("loopback receiver dropped".into()))?;
        }
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.phase == SessionPhase::Closed {
            return;
        }
        *state = SessionState::new(self.local_id, 0, 0);
        tracing::debug!(local = %self.local_id, "loopback closed");
    }

    fn take_inbound(&self) -> Result<mpsc::Receiver<UmpBatch>, TransportError> {
        self.inbound_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(TransportError::ReceiverTaken)
    }

    fn state(&self) -> SessionState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

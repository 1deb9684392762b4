use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

use tokio::sync::broadcast;
use tracing::debug;

use crate::errors::SessionError;
use crate::transport::MockTransport;
use crate::transport::PtyTransport;
use crate::transport::Transport;
use aether_protocol::PtyGeometry;
use aether_protocol::SessionId;
use aether_protocol::SessionSpec;
use aether_protocol::SessionState;
use aether_protocol::TransportKind;

// Lifecycle stored as an atomic; mirrors `SessionState` in the protocol.
const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const CLOSING: u8 = 2;
const CLOSED: u8 = 3;

/// State machine around one transport. Exclusively owns it: no other
/// component holds the transport, and all engine traffic for the session
/// funnels through here.
pub struct Session {
    id: SessionId,
    state: AtomicU8,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Builds the backend named by the spec and transitions straight from
    /// `Created` to `Running`. A spawn failure is terminal for the attempt;
    /// no `Session` value exists afterwards and the caller starts over with a
    /// fresh id.
    pub(crate) async fn open(id: SessionId, spec: &SessionSpec) -> Result<Self, SessionError> {
        let transport: Arc<dyn Transport> = match spec.transport {
            TransportKind::Pty => PtyTransport::spawn(spec).await?,
            TransportKind::Mock => MockTransport::spawn(spec)?,
        };
        debug!(session_id = id.0, backend = ?spec.transport, "session running");
        Ok(Self {
            id,
            state: AtomicU8::new(RUNNING),
            transport,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::SeqCst) {
            CREATED => SessionState::Created,
            RUNNING => SessionState::Running,
            CLOSING => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    pub fn dimensions(&self) -> PtyGeometry {
        self.transport.geometry()
    }

    fn ensure_running(&self) -> Result<(), SessionError> {
        if self.state.load(Ordering::SeqCst) == RUNNING {
            Ok(())
        } else {
            Err(SessionError::Closed)
        }
    }

    pub async fn write(&self, bytes: impl Into<Vec<u8>>) -> Result<(), SessionError> {
        self.ensure_running()?;
        self.transport.write(bytes.into()).await?;
        Ok(())
    }

    pub async fn resize(&self, geometry: PtyGeometry) -> Result<(), SessionError> {
        self.ensure_running()?;
        self.transport.resize(geometry).await?;
        Ok(())
    }

    /// Live output stream. After close the returned stream is already ended;
    /// subscribing is never an error.
    pub fn subscribe_output(&self) -> broadcast::Receiver<Vec<u8>> {
        self.transport.subscribe()
    }

    /// Graceful teardown. Idempotent: closing a session twice (or closing one
    /// whose process already exited) succeeds without effect.
    pub async fn close(&self) {
        let prev = self
            .state
            .compare_exchange(RUNNING, CLOSING, Ordering::SeqCst, Ordering::SeqCst);
        if prev.is_err() {
            return;
        }
        self.transport.close().await;
        self.state.store(CLOSED, Ordering::SeqCst);
        debug!(session_id = self.id.0, "session closed");
    }

    /// Marks the terminal state after the child exited on its own, without
    /// driving the close path again.
    pub(crate) fn mark_closed(&self) {
        self.state.store(CLOSED, Ordering::SeqCst);
    }

    pub(crate) async fn wait_exited(&self) {
        self.transport.wait_exited().await;
    }
}

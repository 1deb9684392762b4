//! Byte-level transports between the engine and a shell process. The real
//! backend owns an OS pseudo-terminal; the mock backend echoes writes with a
//! synthetic prompt so upstream code stays backend-agnostic on hosts where no
//! PTY is available.

mod mock;
mod pty;

pub(crate) use mock::MockTransport;
pub(crate) use pty::PtyTransport;

use crate::errors::TransportError;
use aether_protocol::PtyGeometry;
use async_trait::async_trait;
use tokio::sync::broadcast;

pub(crate) const WRITER_CHANNEL_CAPACITY: usize = 128;
pub(crate) const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// One transport is exclusively owned by one session. All implementations
/// must deliver output chunks in production order and treat `close` as
/// idempotent.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Forwards bytes to the process's stdin side. Fails with
    /// [`TransportError::Closed`] once the process has exited or the
    /// transport was closed.
    async fn write(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Produces a finite stream of output chunks. The stream ends when the
    /// process exits or the transport is closed; a subscription taken after
    /// that observes an immediately-ended stream.
    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>>;

    /// Propagates new geometry to the backend. A repeat of the current
    /// geometry is a no-op and sends no downstream signal.
    async fn resize(&self, geometry: PtyGeometry) -> Result<(), TransportError>;

    fn geometry(&self) -> PtyGeometry;

    /// Terminates the process: polite signal first, forced kill once the
    /// grace period elapses. Idempotent.
    async fn close(&self);

    fn has_exited(&self) -> bool;

    /// Resolves once the underlying process has exited (or the transport was
    /// torn down).
    async fn wait_exited(&self);
}

/// Login-shell fallback used when a session spec names no shell.
pub(crate) fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|shell| !shell.is_empty())
        .unwrap_or_else(|| "/bin/bash".to_string())
}

/// A receiver whose stream has already ended, handed out for subscriptions
/// taken after close.
pub(crate) fn closed_receiver() -> broadcast::Receiver<Vec<u8>> {
    let (tx, rx) = broadcast::channel(1);
    drop(tx);
    rx
}

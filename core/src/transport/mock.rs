use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::sync::broadcast;
use tokio::sync::mpsc;

use crate::errors::TransportError;
use crate::transport::OUTPUT_CHANNEL_CAPACITY;
use crate::transport::Transport;
use crate::transport::WRITER_CHANNEL_CAPACITY;
use crate::transport::closed_receiver;
use aether_protocol::PtyGeometry;
use aether_protocol::SessionSpec;

const MOCK_PROMPT: &[u8] = b"$ ";

/// Echo-only backend for hosts without a privileged process: every write is
/// reflected back as output, newline-terminated writes are followed by a
/// synthetic prompt, and writing `exit` ends the "process". API-identical to
/// the real transport so upstream code cannot tell the backends apart.
pub(crate) struct MockTransport {
    writer_tx: StdMutex<Option<mpsc::Sender<Vec<u8>>>>,
    output_tx: StdMutex<Option<broadcast::Sender<Vec<u8>>>>,
    geometry: StdMutex<PtyGeometry>,
    resize_signals: AtomicUsize,
    exited: Arc<AtomicBool>,
    exit_notify: Arc<Notify>,
    closing: AtomicBool,
}

impl MockTransport {
    pub(crate) fn spawn(spec: &SessionSpec) -> Result<Arc<Self>, TransportError> {
        let geometry = spec.geometry;
        if !geometry.is_valid() {
            return Err(TransportError::InvalidGeometry {
                rows: geometry.rows,
                cols: geometry.cols,
            });
        }

        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(WRITER_CHANNEL_CAPACITY);
        let (output_tx, _) = broadcast::channel::<Vec<u8>>(OUTPUT_CHANNEL_CAPACITY);
        let exited = Arc::new(AtomicBool::new(false));
        let exit_notify = Arc::new(Notify::new());

        let echo_tx = output_tx.clone();
        let echo_exited = Arc::clone(&exited);
        let echo_notify = Arc::clone(&exit_notify);
        tokio::spawn(async move {
            let _ = echo_tx.send(MOCK_PROMPT.to_vec());
            while let Some(bytes) = writer_rx.recv().await {
                let is_exit = bytes.trim_ascii() == b"exit";
                let newline_terminated = bytes.ends_with(b"\n");
                let _ = echo_tx.send(bytes);
                if is_exit {
                    break;
                }
                if newline_terminated {
                    let _ = echo_tx.send(MOCK_PROMPT.to_vec());
                }
            }
            echo_exited.store(true, Ordering::SeqCst);
            echo_notify.notify_waiters();
        });

        let transport = Arc::new(Self {
            writer_tx: StdMutex::new(Some(writer_tx)),
            output_tx: StdMutex::new(Some(output_tx)),
            geometry: StdMutex::new(geometry),
            resize_signals: AtomicUsize::new(0),
            exited,
            exit_notify,
            closing: AtomicBool::new(false),
        });

        let finalizer = Arc::clone(&transport);
        tokio::spawn(async move {
            finalizer.wait_exited().await;
            finalizer.drop_channels();
        });

        Ok(transport)
    }

    fn drop_channels(&self) {
        if let Ok(mut guard) = self.writer_tx.lock() {
            guard.take();
        }
        if let Ok(mut guard) = self.output_tx.lock() {
            guard.take();
        }
    }

    /// Number of geometry changes that actually reached the backend, used to
    /// assert resize idempotence.
    #[cfg(test)]
    pub(crate) fn resize_signal_count(&self) -> usize {
        self.resize_signals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.has_exited() || self.closing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let writer = self
            .writer_tx
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or(TransportError::Closed)?;
        writer
            .send(bytes)
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        if let Ok(guard) = self.output_tx.lock() {
            if let Some(tx) = guard.as_ref() {
                return tx.subscribe();
            }
        }
        closed_receiver()
    }

    async fn resize(&self, geometry: PtyGeometry) -> Result<(), TransportError> {
        if !geometry.is_valid() {
            return Err(TransportError::InvalidGeometry {
                rows: geometry.rows,
                cols: geometry.cols,
            });
        }
        if self.has_exited() || self.closing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut current = self
            .geometry
            .lock()
            .map_err(|_| TransportError::io(std::io::Error::other("geometry poisoned")))?;
        if *current == geometry {
            return Ok(());
        }
        *current = geometry;
        self.resize_signals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn geometry(&self) -> PtyGeometry {
        match self.geometry.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.exited.store(true, Ordering::SeqCst);
        self.exit_notify.notify_waiters();
        self.drop_channels();
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    async fn wait_exited(&self) {
        loop {
            let notified = self.exit_notify.notified();
            if self.has_exited() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::sync::broadcast::error::RecvError;

    async fn collect_until(
        rx: &mut broadcast::Receiver<Vec<u8>>,
        needle: &[u8],
    ) -> Vec<u8> {
        let mut collected = Vec::new();
        loop {
            match rx.recv().await {
                Ok(chunk) => {
                    collected.extend_from_slice(&chunk);
                    if collected
                        .windows(needle.len())
                        .any(|window| window == needle)
                    {
                        return collected;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return collected,
            }
        }
    }

    #[tokio::test]
    async fn echoes_writes_and_appends_prompt() {
        let transport = MockTransport::spawn(&SessionSpec::mock()).expect("spawn mock");
        let mut rx = transport.subscribe();

        transport
            .write(b"echo hi\n".to_vec())
            .await
            .expect("write");

        let collected = collect_until(&mut rx, b"echo hi\n$ ").await;
        let text = String::from_utf8_lossy(&collected);
        assert!(text.ends_with("echo hi\n$ "), "unexpected output: {text:?}");
    }

    #[tokio::test]
    async fn output_preserves_write_order() {
        let transport = MockTransport::spawn(&SessionSpec::mock()).expect("spawn mock");
        let mut rx = transport.subscribe();

        for line in [b"one\n".as_slice(), b"two\n", b"three\n"] {
            transport.write(line.to_vec()).await.expect("write");
        }

        let collected = collect_until(&mut rx, b"three\n").await;
        let text = String::from_utf8_lossy(&collected);
        let one = text.find("one\n").expect("first write echoed");
        let two = text.find("two\n").expect("second write echoed");
        let three = text.find("three\n").expect("third write echoed");
        assert!(one < two && two < three, "out of order: {text:?}");
    }

    #[tokio::test]
    async fn exit_ends_the_stream() {
        let transport = MockTransport::spawn(&SessionSpec::mock()).expect("spawn mock");
        let mut rx = transport.subscribe();

        transport.write(b"exit\n".to_vec()).await.expect("write");
        transport.wait_exited().await;
        assert!(transport.has_exited());

        // Stream must be finite once the "process" is gone.
        loop {
            match rx.recv().await {
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    }

    #[tokio::test]
    async fn write_after_close_is_rejected() {
        let transport = MockTransport::spawn(&SessionSpec::mock()).expect("spawn mock");
        transport.close().await;
        let err = transport
            .write(b"ls\n".to_vec())
            .await
            .expect_err("write after close");
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let transport = MockTransport::spawn(&SessionSpec::mock()).expect("spawn mock");
        transport.close().await;
        transport.close().await;
        assert!(transport.has_exited());
    }

    #[tokio::test]
    async fn subscription_after_close_ends_immediately() {
        let transport = MockTransport::spawn(&SessionSpec::mock()).expect("spawn mock");
        transport.close().await;
        let mut rx = transport.subscribe();
        loop {
            match rx.recv().await {
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    }

    #[tokio::test]
    async fn identical_resize_sends_no_duplicate_signal() {
        let transport = MockTransport::spawn(&SessionSpec::mock()).expect("spawn mock");
        transport
            .resize(PtyGeometry::new(50, 120))
            .await
            .expect("resize");
        transport
            .resize(PtyGeometry::new(50, 120))
            .await
            .expect("repeat resize");
        assert_eq!(transport.resize_signal_count(), 1);
        assert_eq!(transport.geometry(), PtyGeometry::new(50, 120));
    }

    #[tokio::test]
    async fn zero_geometry_is_rejected() {
        let transport = MockTransport::spawn(&SessionSpec::mock()).expect("spawn mock");
        let err = transport
            .resize(PtyGeometry::new(0, 80))
            .await
            .expect_err("invalid resize");
        assert!(matches!(
            err,
            TransportError::InvalidGeometry { rows: 0, cols: 80 }
        ));
    }
}

use std::io::ErrorKind;
use std::io::Read;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use portable_pty::ChildKiller;
use portable_pty::CommandBuilder;
use portable_pty::MasterPty;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use shlex::Shlex;
use tokio::sync::Notify;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::errors::TransportError;
use crate::transport::OUTPUT_CHANNEL_CAPACITY;
use crate::transport::Transport;
use crate::transport::WRITER_CHANNEL_CAPACITY;
use crate::transport::closed_receiver;
use crate::transport::default_shell;
use aether_protocol::PtyGeometry;
use aether_protocol::SessionSpec;

const MIN_GRACE_MS: u64 = 500;
const MAX_GRACE_MS: u64 = 60_000;

/// Real backend: one OS pseudo-terminal paired with one spawned shell. The
/// blocking PTY reader runs on its own thread and feeds a broadcast channel;
/// writes are serialized through an mpsc channel drained off the async
/// runtime. This is the only component in the engine that spawns or
/// terminates an OS process.
pub(crate) struct PtyTransport {
    writer_tx: StdMutex<Option<mpsc::Sender<Vec<u8>>>>,
    output_tx: StdMutex<Option<broadcast::Sender<Vec<u8>>>>,
    master: StdMutex<Box<dyn MasterPty + Send>>,
    geometry: StdMutex<PtyGeometry>,
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
    #[cfg_attr(not(unix), allow(dead_code))]
    child_pid: Option<u32>,
    exited: Arc<AtomicBool>,
    exit_notify: Arc<Notify>,
    closing: AtomicBool,
    grace_period: Duration,
    writer_handle: JoinHandle<()>,
}

impl PtyTransport {
    pub(crate) async fn spawn(spec: &SessionSpec) -> Result<Arc<Self>, TransportError> {
        let geometry = spec.geometry;
        if !geometry.is_valid() {
            return Err(TransportError::InvalidGeometry {
                rows: geometry.rows,
                cols: geometry.cols,
            });
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: geometry.rows,
                cols: geometry.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(TransportError::spawn)?;

        let shell = spec.shell.clone().unwrap_or_else(default_shell);
        let mut tokens: Vec<String> = Shlex::new(&shell).collect();
        if tokens.is_empty() {
            return Err(TransportError::spawn(anyhow!(
                "empty shell command for session"
            )));
        }
        let mut command_builder = CommandBuilder::new(tokens.remove(0));
        for arg in tokens {
            command_builder.arg(arg);
        }
        for (name, value) in &spec.env {
            command_builder.env(name, value);
        }

        let mut child = pair
            .slave
            .spawn_command(command_builder)
            .map_err(TransportError::spawn)?;
        let killer = child.clone_killer();
        let child_pid = child.process_id();

        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(WRITER_CHANNEL_CAPACITY);
        let (output_tx, _) = broadcast::channel::<Vec<u8>>(OUTPUT_CHANNEL_CAPACITY);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(TransportError::spawn)?;
        let output_tx_clone = output_tx.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let _ = output_tx_clone.send(buf[..n].to_vec());
                    }
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(5));
                        continue;
                    }
                    Err(_) => break,
                }
            }
        });

        let writer = pair.master.take_writer().map_err(TransportError::spawn)?;
        let writer = Arc::new(StdMutex::new(writer));
        let writer_handle = tokio::spawn({
            let writer = writer.clone();
            async move {
                while let Some(bytes) = writer_rx.recv().await {
                    let writer = writer.clone();
                    let _ = tokio::task::spawn_blocking(move || {
                        if let Ok(mut guard) = writer.lock() {
                            use std::io::Write;
                            let _ = guard.write_all(&bytes);
                            let _ = guard.flush();
                        }
                    })
                    .await;
                }
            }
        });

        let exited = Arc::new(AtomicBool::new(false));
        let exit_notify = Arc::new(Notify::new());
        let wait_exited = Arc::clone(&exited);
        let wait_notify = Arc::clone(&exit_notify);
        tokio::task::spawn_blocking(move || {
            let _ = child.wait();
            wait_exited.store(true, Ordering::SeqCst);
            wait_notify.notify_waiters();
        });

        let transport = Arc::new(Self {
            writer_tx: StdMutex::new(Some(writer_tx)),
            output_tx: StdMutex::new(Some(output_tx)),
            master: StdMutex::new(pair.master),
            geometry: StdMutex::new(geometry),
            killer: StdMutex::new(killer),
            child_pid,
            exited,
            exit_notify,
            closing: AtomicBool::new(false),
            grace_period: Duration::from_millis(spec.grace_period_ms.clamp(
                MIN_GRACE_MS,
                MAX_GRACE_MS,
            )),
            writer_handle,
        });

        // Once the child is gone, release the channel ends the transport
        // holds so live subscriptions observe end-of-stream.
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

    fn writer(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.writer_tx.lock().ok().and_then(|guard| guard.clone())
    }

    fn force_kill(&self) {
        if let Ok(mut killer) = self.killer.lock() {
            if let Err(err) = killer.kill() {
                debug!(error = ?err, "force kill failed; child likely already gone");
            }
        }
    }
}

#[async_trait]
impl Transport for PtyTransport {
    async fn write(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.has_exited() || self.closing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let writer = self.writer().ok_or(TransportError::Closed)?;
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
        {
            let mut current = self
                .geometry
                .lock()
                .map_err(|_| TransportError::io(std::io::Error::other("geometry poisoned")))?;
            // Identical geometry is a no-op; the child receives no signal.
            if *current == geometry {
                return Ok(());
            }
            *current = geometry;
        }
        let master = self
            .master
            .lock()
            .map_err(|_| TransportError::io(std::io::Error::other("master poisoned")))?;
        master
            .resize(PtySize {
                rows: geometry.rows,
                cols: geometry.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(TransportError::spawn)
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
        if self.has_exited() {
            return;
        }

        // Stop accepting writes before signaling the child.
        if let Ok(mut guard) = self.writer_tx.lock() {
            guard.take();
        }

        #[cfg(unix)]
        if let Some(pid) = self.child_pid {
            // Polite phase: hang up the controlling terminal.
            unsafe {
                libc::kill(pid as i32, libc::SIGHUP);
            }
        }

        let grace = tokio::time::timeout(self.grace_period, self.wait_exited()).await;
        if grace.is_err() {
            warn!(
                grace_ms = self.grace_period.as_millis() as u64,
                "child ignored hangup; escalating to forced kill"
            );
            self.force_kill();
            let _ = tokio::time::timeout(self.grace_period, self.wait_exited()).await;
        }
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

impl Drop for PtyTransport {
    fn drop(&mut self) {
        if !self.has_exited() {
            self.force_kill();
        }
        self.writer_handle.abort();
    }
}

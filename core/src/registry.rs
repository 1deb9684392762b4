use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tracing::info;
use tracing::warn;

use crate::errors::RegistryError;
use crate::session::Session;
use aether_protocol::SessionEvent;
use aether_protocol::SessionEventKind;
use aether_protocol::SessionId;
use aether_protocol::SessionSpec;
use aether_protocol::SessionState;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Process-wide catalog of live sessions. Lives for the whole process; the
/// embedding application calls [`SessionRegistry::shutdown`] on exit to close
/// every remaining session. Ids are never reused, and a session that reaches
/// its terminal state is evicted from the table in the same step.
pub struct SessionRegistry {
    next_session_id: AtomicU32,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            next_session_id: AtomicU32::new(0),
            sessions: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Lifecycle edges (`Created`, `Closed`) for every session in the table.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Allocates a fresh id and opens a session for it. On spawn failure the
    /// registry keeps no trace of the attempted id.
    pub async fn create(self: &Arc<Self>, spec: SessionSpec) -> Result<SessionId, RegistryError> {
        let id = SessionId::new(self.next_session_id.fetch_add(1, Ordering::SeqCst));
        let session = Session::open(id, &spec)
            .await
            .map_err(|source| RegistryError::Create { source })?;
        let session = Arc::new(session);

        self.sessions.lock().await.insert(id, Arc::clone(&session));
        self.emit(SessionEventKind::Created, id, SessionState::Running);
        info!(session_id = id.0, "session created");

        // Supervisor: when the child exits on its own, evict synchronously
        // with the terminal transition so the table never holds a closed
        // session.
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            session.wait_exited().await;
            session.mark_closed();
            registry.evict(id).await;
        });

        Ok(id)
    }

    pub async fn get(&self, id: SessionId) -> Result<Arc<Session>, RegistryError> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound { session_id: id })
    }

    /// Closes the session and removes it from the table. Destroying an id
    /// that is absent (or already destroyed) succeeds.
    pub async fn destroy(&self, id: SessionId) {
        let session = self.sessions.lock().await.remove(&id);
        if let Some(session) = session {
            session.close().await;
            self.emit(SessionEventKind::Closed, id, SessionState::Closed);
            info!(session_id = id.0, "session destroyed");
        }
    }

    /// Process-exit teardown: closes every live session.
    pub async fn shutdown(&self) {
        let drained: Vec<(SessionId, Arc<Session>)> =
            self.sessions.lock().await.drain().collect();
        for (id, session) in drained {
            session.close().await;
            self.emit(SessionEventKind::Closed, id, SessionState::Closed);
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    async fn evict(&self, id: SessionId) {
        if self.sessions.lock().await.remove(&id).is_some() {
            self.emit(SessionEventKind::Closed, id, SessionState::Closed);
            warn!(session_id = id.0, "session process exited; evicted");
        }
    }

    fn emit(&self, kind: SessionEventKind, session_id: SessionId, state: SessionState) {
        let _ = self.events.send(SessionEvent {
            kind,
            session_id,
            state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn registry() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new())
    }

    #[tokio::test]
    async fn create_get_destroy_roundtrip() {
        let registry = registry();
        let id = registry
            .create(SessionSpec::mock())
            .await
            .expect("create session");

        let session = registry.get(id).await.expect("get session");
        assert_eq!(session.id(), id);
        assert_eq!(session.state(), SessionState::Running);

        registry.destroy(id).await;
        assert_matches!(
            registry.get(id).await,
            Err(RegistryError::NotFound { session_id }) if session_id == id
        );
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let registry = registry();
        let id = registry
            .create(SessionSpec::mock())
            .await
            .expect("create session");
        registry.destroy(id).await;
        // Second destroy of the same id is success, not NotFound.
        registry.destroy(id).await;
    }

    #[tokio::test]
    async fn ids_are_never_reused() {
        let registry = registry();
        let first = registry
            .create(SessionSpec::mock())
            .await
            .expect("create first");
        registry.destroy(first).await;
        let second = registry
            .create(SessionSpec::mock())
            .await
            .expect("create second");
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn child_exit_evicts_the_session() {
        let registry = registry();
        let mut events = registry.subscribe_events();
        let id = registry
            .create(SessionSpec::mock())
            .await
            .expect("create session");

        let session = registry.get(id).await.expect("get session");
        session.write(b"exit\n".to_vec()).await.expect("write exit");

        // Wait for the supervisor to notice and evict.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !registry.is_empty().await {
            assert!(tokio::time::Instant::now() < deadline, "eviction timed out");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut saw_closed = false;
        while let Ok(event) = events.try_recv() {
            if event.kind == SessionEventKind::Closed && event.session_id == id {
                saw_closed = true;
            }
        }
        assert!(saw_closed, "expected a Closed event for the evicted session");
    }

    #[tokio::test]
    async fn shutdown_closes_every_session() {
        let registry = registry();
        for _ in 0..3 {
            registry
                .create(SessionSpec::mock())
                .await
                .expect("create session");
        }
        assert_eq!(registry.len().await, 3);

        registry.shutdown().await;
        assert!(registry.is_empty().await);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_shell_leaves_no_entry() {
        let registry = registry();
        let spec = SessionSpec {
            shell: Some("/bin/definitely-not-a-shell-xyz".to_string()),
            ..SessionSpec::default()
        };
        let err = registry.create(spec).await.expect_err("spawn must fail");
        assert_matches!(err, RegistryError::Create { .. });
        assert!(registry.is_empty().await);
    }
}

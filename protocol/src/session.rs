use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u32);

impl SessionId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session lifecycle. `Closed` is terminal; a closed session is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Running,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::Running => write!(f, "running"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Terminal geometry in character cells. Rows and cols must be positive; the
/// engine rejects zero in either dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyGeometry {
    pub rows: u16,
    pub cols: u16,
}

impl PtyGeometry {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    pub fn is_valid(&self) -> bool {
        self.rows > 0 && self.cols > 0
    }
}

impl Default for PtyGeometry {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Backend selection, made explicitly at session creation time. There is no
/// ambient host detection inside the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Real OS pseudo-terminal backed by a spawned shell.
    #[default]
    Pty,
    /// Echo-only transport with a synthetic prompt, for unprivileged hosts.
    Mock,
}

/// Parameters for opening a new session.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSpec {
    /// Shell command line. `None` falls back to `$SHELL`, then `/bin/bash`.
    #[serde(default)]
    pub shell: Option<String>,

    #[serde(default)]
    pub geometry: PtyGeometry,

    /// Extra environment variables applied to the spawned process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub transport: TransportKind,

    /// Grace window between the polite termination signal and the forced
    /// kill when closing the session. Clamped by the engine.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

fn default_grace_period_ms() -> u64 {
    5_000
}

impl Default for SessionSpec {
    fn default() -> Self {
        Self {
            shell: None,
            geometry: PtyGeometry::default(),
            env: HashMap::new(),
            transport: TransportKind::default(),
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

impl SessionSpec {
    pub fn mock() -> Self {
        Self {
            transport: TransportKind::Mock,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    Created,
    Closed,
}

/// Registry broadcast payload emitted on session lifecycle edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub session_id: SessionId,
    pub state: SessionState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn session_spec_defaults_from_empty_json() {
        let spec: SessionSpec = serde_json::from_str("{}").expect("deserialize");
        assert_eq!(spec.geometry, PtyGeometry::new(24, 80));
        assert_eq!(spec.transport, TransportKind::Pty);
        assert_eq!(spec.grace_period_ms, 5_000);
        assert!(spec.shell.is_none());
        assert!(spec.env.is_empty());
    }

    #[test]
    fn geometry_rejects_zero_dimensions() {
        assert!(!PtyGeometry::new(0, 80).is_valid());
        assert!(!PtyGeometry::new(24, 0).is_valid());
        assert!(PtyGeometry::new(1, 1).is_valid());
    }

    #[test]
    fn session_state_serializes_snake_case() {
        let json = serde_json::to_string(&SessionState::Closing).expect("serialize");
        assert_eq!(json, "\"closing\"");
    }
}

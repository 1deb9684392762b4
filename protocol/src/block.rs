use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// History entry id, monotonically increasing within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl BlockId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Pending,
    Streaming,
    Completed,
    Failed,
}

impl BlockStatus {
    /// Whether the entry is still accepting output.
    pub fn is_open(&self) -> bool {
        matches!(self, BlockStatus::Pending | BlockStatus::Streaming)
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockStatus::Pending => write!(f, "pending"),
            BlockStatus::Streaming => write!(f, "streaming"),
            BlockStatus::Completed => write!(f, "completed"),
            BlockStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Read-only snapshot of one history entry as handed to presentation layers.
/// Output is rendered lossily as UTF-8; the engine keeps the raw bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    pub id: BlockId,
    pub input: String,
    pub output: String,
    pub status: BlockStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
}

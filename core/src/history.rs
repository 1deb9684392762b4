use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::errors::HistoryError;
use aether_protocol::BlockId;
use aether_protocol::BlockRecord;
use aether_protocol::BlockStatus;

/// Per-session ordered log correlating submitted commands with their
/// streamed output. Entries are append-only: once `Completed` or `Failed`
/// they are never edited, so re-running a block always creates a new entry.
/// At most one entry per session is open at a time; all arriving output is
/// attributed to it.
#[derive(Default)]
pub struct BlockHistory {
    state: Mutex<HistoryState>,
}

#[derive(Default)]
struct HistoryState {
    entries: Vec<BlockEntry>,
    /// Index into `entries` of the open (non-terminal) entry, if any.
    open: Option<usize>,
    next_id: u64,
}

struct BlockEntry {
    id: BlockId,
    input: String,
    output: Vec<u8>,
    status: BlockStatus,
    submitted_at: Instant,
    execution_time: Option<Duration>,
}

impl BlockEntry {
    fn record(&self) -> BlockRecord {
        BlockRecord {
            id: self.id,
            input: self.input.clone(),
            output: String::from_utf8_lossy(&self.output).into_owned(),
            status: self.status,
            execution_time_ms: self
                .execution_time
                .map(|elapsed| elapsed.as_millis().try_into().unwrap_or(u64::MAX)),
        }
    }
}

impl BlockHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a new `Pending` entry and returns its id. Fails with
    /// `BlockInProgress` while another entry is still open.
    pub async fn begin_block(&self, input: &str) -> Result<BlockId, HistoryError> {
        let mut state = self.state.lock().await;
        if let Some(open_idx) = state.open {
            let block_id = state.entries[open_idx].id;
            return Err(HistoryError::BlockInProgress { block_id });
        }
        let id = BlockId::new(state.next_id);
        state.next_id += 1;
        state.entries.push(BlockEntry {
            id,
            input: input.to_string(),
            output: Vec::new(),
            status: BlockStatus::Pending,
            submitted_at: Instant::now(),
            execution_time: None,
        });
        state.open = Some(state.entries.len() - 1);
        Ok(id)
    }

    /// Attributes an output chunk to the open entry. The first chunk moves
    /// the entry from `Pending` to `Streaming`; chunk order is preserved so
    /// the accumulated output is a faithful byte-order concatenation.
    pub async fn append_output(&self, id: BlockId, chunk: &[u8]) -> Result<(), HistoryError> {
        let mut state = self.state.lock().await;
        let open_idx = match state.open {
            Some(idx) if state.entries[idx].id == id => idx,
            _ => return Err(HistoryError::NoSuchEntry { block_id: id }),
        };
        let entry = &mut state.entries[open_idx];
        if entry.status == BlockStatus::Pending {
            entry.status = BlockStatus::Streaming;
        }
        entry.output.extend_from_slice(chunk);
        Ok(())
    }

    /// Marks the entry `Completed` or `Failed`, freezing its output and
    /// recording elapsed time since submission.
    pub async fn complete_block(&self, id: BlockId, success: bool) -> Result<(), HistoryError> {
        let mut state = self.state.lock().await;
        let idx = state
            .entries
            .iter()
            .position(|entry| entry.id == id)
            .ok_or(HistoryError::NoSuchEntry { block_id: id })?;
        let entry = &mut state.entries[idx];
        if !entry.status.is_open() {
            return Err(HistoryError::AlreadyComplete { block_id: id });
        }
        entry.status = if success {
            BlockStatus::Completed
        } else {
            BlockStatus::Failed
        };
        entry.execution_time = Some(entry.submitted_at.elapsed());
        state.open = None;
        Ok(())
    }

    /// Re-submission: copies the original entry's input into a brand-new
    /// entry via `begin_block`. The original is untouched.
    pub async fn re_run(&self, id: BlockId) -> Result<BlockId, HistoryError> {
        let input = self
            .input_of(id)
            .await
            .ok_or(HistoryError::NoSuchEntry { block_id: id })?;
        self.begin_block(&input).await
    }

    /// Session-teardown path: the open entry, if any, is force-completed as
    /// `Failed` with its elapsed time recorded.
    pub async fn force_fail_open(&self) -> Option<BlockId> {
        let mut state = self.state.lock().await;
        let open_idx = state.open.take()?;
        let entry = &mut state.entries[open_idx];
        entry.status = BlockStatus::Failed;
        entry.execution_time = Some(entry.submitted_at.elapsed());
        debug!(block_id = entry.id.0, "open block force-failed on teardown");
        Some(entry.id)
    }

    pub async fn open_block(&self) -> Option<BlockId> {
        let state = self.state.lock().await;
        state.open.map(|idx| state.entries[idx].id)
    }

    pub async fn input_of(&self, id: BlockId) -> Option<String> {
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.input.clone())
    }

    pub async fn get(&self, id: BlockId) -> Option<BlockRecord> {
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .find(|entry| entry.id == id)
            .map(BlockEntry::record)
    }

    /// Entries in creation order; a read-only snapshot safe to take while
    /// output is still streaming in.
    pub async fn list(&self) -> Vec<BlockRecord> {
        let state = self.state.lock().await;
        state.entries.iter().map(BlockEntry::record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn begin_twice_without_complete_is_rejected() {
        let history = BlockHistory::new();
        let first = history.begin_block("echo one").await.expect("begin");
        let err = history
            .begin_block("echo two")
            .await
            .expect_err("second begin");
        assert_eq!(err, HistoryError::BlockInProgress { block_id: first });
    }

    #[tokio::test]
    async fn first_append_moves_pending_to_streaming() {
        let history = BlockHistory::new();
        let id = history.begin_block("echo hi").await.expect("begin");
        assert_eq!(history.get(id).await.expect("get").status, BlockStatus::Pending);

        history.append_output(id, b"hi\n").await.expect("append");
        let record = history.get(id).await.expect("get");
        assert_eq!(record.status, BlockStatus::Streaming);
        assert_eq!(record.output, "hi\n");
        assert_eq!(record.execution_time_ms, None);
    }

    #[tokio::test]
    async fn append_preserves_chunk_order() {
        let history = BlockHistory::new();
        let id = history.begin_block("seq 3").await.expect("begin");
        for chunk in [b"1\n".as_slice(), b"2\n", b"3\n"] {
            history.append_output(id, chunk).await.expect("append");
        }
        let record = history.get(id).await.expect("get");
        assert_eq!(record.output, "1\n2\n3\n");
    }

    #[tokio::test]
    async fn append_to_non_open_entry_is_rejected() {
        let history = BlockHistory::new();
        let id = history.begin_block("echo hi").await.expect("begin");
        history.complete_block(id, true).await.expect("complete");

        let err = history
            .append_output(id, b"late\n")
            .await
            .expect_err("append after complete");
        assert_eq!(err, HistoryError::NoSuchEntry { block_id: id });
    }

    #[tokio::test]
    async fn complete_records_execution_time_and_freezes_entry() {
        let history = BlockHistory::new();
        let id = history.begin_block("echo hi").await.expect("begin");
        history.append_output(id, b"hi\n").await.expect("append");
        history.complete_block(id, true).await.expect("complete");

        let record = history.get(id).await.expect("get");
        assert_eq!(record.status, BlockStatus::Completed);
        assert!(record.execution_time_ms.is_some());

        let err = history
            .complete_block(id, false)
            .await
            .expect_err("double complete");
        assert_eq!(err, HistoryError::AlreadyComplete { block_id: id });
    }

    #[tokio::test]
    async fn re_run_copies_input_and_leaves_original_untouched() {
        let history = BlockHistory::new();
        let original = history.begin_block("make build").await.expect("begin");
        history
            .append_output(original, b"ok\n")
            .await
            .expect("append");
        history
            .complete_block(original, true)
            .await
            .expect("complete");
        let before = history.get(original).await.expect("get");

        let copy = history.re_run(original).await.expect("re-run");
        assert_ne!(copy, original);

        let copy_record = history.get(copy).await.expect("get copy");
        assert_eq!(copy_record.input, "make build");
        assert_eq!(copy_record.status, BlockStatus::Pending);
        assert_eq!(copy_record.output, "");

        let after = history.get(original).await.expect("get original");
        assert_eq!(after.status, before.status);
        assert_eq!(after.output, before.output);
        assert_eq!(after.execution_time_ms, before.execution_time_ms);
    }

    #[tokio::test]
    async fn re_run_of_unknown_entry_is_rejected() {
        let history = BlockHistory::new();
        let missing = BlockId::new(42);
        assert_matches!(
            history.re_run(missing).await,
            Err(HistoryError::NoSuchEntry { block_id }) if block_id == missing
        );
    }

    #[tokio::test]
    async fn force_fail_marks_open_entry_failed_with_elapsed_time() {
        let history = BlockHistory::new();
        let id = history.begin_block("sleep 100").await.expect("begin");
        history.append_output(id, b"...").await.expect("append");

        let failed = history.force_fail_open().await.expect("force fail");
        assert_eq!(failed, id);

        let record = history.get(id).await.expect("get");
        assert_eq!(record.status, BlockStatus::Failed);
        assert!(record.execution_time_ms.is_some());

        // Nothing open anymore; a second force-fail is a no-op.
        assert_eq!(history.force_fail_open().await, None);
    }

    #[tokio::test]
    async fn list_returns_entries_in_creation_order() {
        let history = BlockHistory::new();
        let first = history.begin_block("a").await.expect("begin a");
        history.complete_block(first, true).await.expect("complete");
        let second = history.begin_block("b").await.expect("begin b");

        let ids: Vec<BlockId> = history.list().await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![first, second]);
    }
}

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use regex_lite::Regex;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::errors::DispatchError;
use crate::errors::HistoryError;
use crate::history::BlockHistory;
use crate::session::Session;
use crate::suggest::SuggestionProvider;
use aether_protocol::BlockId;
use aether_protocol::PtyGeometry;
use aether_protocol::Suggestion;

const SHUTDOWN_PUMP_TIMEOUT: Duration = Duration::from_secs(5);

fn default_prompt_pattern() -> String {
    // Recognizes the common single-character prompt tails ("$ ", "# ",
    // "% ", "> ") at the end of accumulated output.
    r"[$#%>] $".to_string()
}

fn default_tail_window_bytes() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Regex marking a shell-prompt boundary; a match at the tail of the
    /// open block's output completes the block.
    #[serde(default = "default_prompt_pattern")]
    pub prompt_pattern: String,

    /// How many trailing output bytes are kept for boundary detection.
    #[serde(default = "default_tail_window_bytes")]
    pub tail_window_bytes: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            prompt_pattern: default_prompt_pattern(),
            tail_window_bytes: default_tail_window_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A new block was begun and the command written to the session.
    Started(BlockId),
    /// A block is already open; the submission was enqueued and will be
    /// flushed in FIFO order as blocks complete.
    Queued,
    /// Empty or whitespace-only input; no block was created.
    Ignored,
}

/// Single entry point translating user intent into session writes plus block
/// bookkeeping. One dispatcher per session; commands are serialized through
/// it, so no two writes race on the session's write path.
///
/// Submissions arriving while a block is open are queued, not rejected: the
/// queue drains one entry per completed block.
pub struct CommandDispatcher {
    state: Arc<DispatchState>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher").finish_non_exhaustive()
    }
}

struct DispatchState {
    session: Arc<Session>,
    history: Arc<BlockHistory>,
    suggester: Option<Arc<dyn SuggestionProvider>>,
    queue: Mutex<VecDeque<String>>,
    prompt: Regex,
    tail_window: usize,
}

/// Pump-local scratch for prompt-boundary detection, reset whenever the open
/// block changes.
struct PumpCursor {
    block: Option<BlockId>,
    tail: Vec<u8>,
    saw_newline: bool,
}

impl PumpCursor {
    fn new() -> Self {
        Self {
            block: None,
            tail: Vec::new(),
            saw_newline: false,
        }
    }

    fn reset_for(&mut self, block: BlockId) {
        self.block = Some(block);
        self.tail.clear();
        self.saw_newline = false;
    }
}

impl CommandDispatcher {
    pub fn new(
        session: Arc<Session>,
        suggester: Option<Arc<dyn SuggestionProvider>>,
        config: DispatcherConfig,
    ) -> Result<Self, DispatchError> {
        let prompt = Regex::new(&config.prompt_pattern)
            .map_err(|error| DispatchError::PromptPattern { error })?;
        let output_rx = session.subscribe_output();
        let state = Arc::new(DispatchState {
            session,
            history: Arc::new(BlockHistory::new()),
            suggester,
            queue: Mutex::new(VecDeque::new()),
            prompt,
            tail_window: config.tail_window_bytes.max(8),
        });
        let pump = tokio::spawn(run_pump(Arc::clone(&state), output_rx));
        Ok(Self {
            state,
            pump: Mutex::new(Some(pump)),
        })
    }

    /// Read reference to the session's block log. The dispatcher remains the
    /// source of truth; callers only observe.
    pub fn history(&self) -> Arc<BlockHistory> {
        Arc::clone(&self.state.history)
    }

    /// Enter-terminated command submission.
    pub async fn submit(&self, input: &str) -> Result<SubmitOutcome, DispatchError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(SubmitOutcome::Ignored);
        }

        {
            let mut queue = self.state.queue.lock().await;
            if !queue.is_empty() || self.state.history.open_block().await.is_some() {
                queue.push_back(trimmed.to_string());
                return Ok(SubmitOutcome::Queued);
            }
        }

        match self.state.start_block(trimmed).await {
            Ok(id) => Ok(SubmitOutcome::Started(id)),
            Err(DispatchError::History(HistoryError::BlockInProgress { .. })) => {
                // Lost a race against a queue flush; fall back to the queue.
                self.state
                    .queue
                    .lock()
                    .await
                    .push_back(trimmed.to_string());
                Ok(SubmitOutcome::Queued)
            }
            Err(err) => Err(err),
        }
    }

    /// Re-submits a prior block's input as a new, independent block. The
    /// original entry is never edited.
    pub async fn re_run(&self, id: BlockId) -> Result<SubmitOutcome, DispatchError> {
        let input = self
            .state
            .history
            .input_of(id)
            .await
            .ok_or(HistoryError::NoSuchEntry { block_id: id })?;
        self.submit(&input).await
    }

    /// Raw keystroke passthrough for interactive programs. Bytes go straight
    /// to the session and are never attributed to the block history.
    pub async fn send_raw(&self, bytes: impl Into<Vec<u8>>) -> Result<(), DispatchError> {
        self.state.session.write(bytes).await?;
        Ok(())
    }

    /// Geometry changes from the display surface, forwarded verbatim.
    pub async fn resize(&self, geometry: PtyGeometry) -> Result<(), DispatchError> {
        self.state.session.resize(geometry).await?;
        Ok(())
    }

    /// Asks the suggestion collaborator for a candidate command. Failures
    /// degrade to `SuggestionUnavailable` and never affect submission.
    pub async fn suggest(&self, intent: &str) -> Result<Suggestion, DispatchError> {
        let Some(provider) = self.state.suggester.as_ref() else {
            return Err(DispatchError::SuggestionUnavailable {
                reason: "no provider configured".to_string(),
            });
        };
        provider
            .suggest(intent)
            .await
            .map_err(|err| DispatchError::SuggestionUnavailable {
                reason: err.to_string(),
            })
    }

    /// Closes the session and waits for the output pump to finish, which
    /// force-fails the open block and drops queued submissions.
    pub async fn shutdown(&self) {
        self.state.session.close().await;
        let handle = self.pump.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(SHUTDOWN_PUMP_TIMEOUT, handle)
                .await
                .is_err()
            {
                warn!("output pump did not stop within the shutdown window");
            }
        }
    }
}

impl DispatchState {
    /// Begins a block and writes `input` plus the line terminator to the
    /// session. A write failure is recorded on the block itself: an error
    /// line is appended and the block completes as `Failed`.
    async fn start_block(&self, input: &str) -> Result<BlockId, DispatchError> {
        let id = self.history.begin_block(input).await?;
        let mut line = input.as_bytes().to_vec();
        line.push(b'\n');
        if let Err(err) = self.session.write(line).await {
            let notice = format!("error: {err}\n");
            let _ = self.history.append_output(id, notice.as_bytes()).await;
            if let Err(complete_err) = self.history.complete_block(id, false).await {
                warn!(error = %complete_err, "invariant: could not fail half-started block");
            }
            return Err(err.into());
        }
        Ok(id)
    }

    /// Starts the next queued submission, skipping entries whose write
    /// fails. At most one block comes out of this; the rest of the queue
    /// waits for the next completion.
    async fn flush_queue(&self) {
        loop {
            let next = self.queue.lock().await.pop_front();
            let Some(input) = next else { return };
            match self.start_block(&input).await {
                Ok(id) => {
                    debug!(block_id = id.0, "flushed queued submission");
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "queued submission failed; trying next");
                }
            }
        }
    }

    async fn on_output(&self, cursor: &mut PumpCursor, chunk: Vec<u8>) {
        let Some(open) = self.history.open_block().await else {
            // Output outside any block (initial prompt, interactive
            // programs driven through raw writes): display-only.
            cursor.block = None;
            return;
        };
        if cursor.block != Some(open) {
            cursor.reset_for(open);
        }

        if let Err(err) = self.history.append_output(open, &chunk).await {
            warn!(error = %err, "invariant: chunk arrived for a non-open block");
            return;
        }

        if chunk.contains(&b'\n') {
            cursor.saw_newline = true;
        }
        cursor.tail.extend_from_slice(&chunk);
        if cursor.tail.len() > self.tail_window {
            let excess = cursor.tail.len() - self.tail_window;
            cursor.tail.drain(..excess);
        }

        // The boundary is only trusted once the command echo's newline has
        // been seen; a prompt alone (emitted right after spawn) does not end
        // the block.
        if !cursor.saw_newline {
            return;
        }
        let text = String::from_utf8_lossy(&cursor.tail);
        if self.prompt.is_match(&text) {
            cursor.block = None;
            if let Err(err) = self.history.complete_block(open, true).await {
                warn!(error = %err, "invariant: completing the open block failed");
            }
            self.flush_queue().await;
        }
    }
}

async fn run_pump(state: Arc<DispatchState>, mut rx: broadcast::Receiver<Vec<u8>>) {
    let mut cursor = PumpCursor::new();
    loop {
        match rx.recv().await {
            Ok(chunk) => state.on_output(&mut cursor, chunk).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "output pump lagged; dropped chunks");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    // Stream over: the process exited or the session was closed. The open
    // block force-completes as Failed and queued submissions are dropped.
    if let Some(id) = state.history.force_fail_open().await {
        debug!(block_id = id.0, "session ended with an open block");
    }
    state.queue.lock().await.clear();
}

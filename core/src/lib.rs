//! Terminal session engine: owns PTY-backed shell processes, streams their
//! output, and organizes it into replayable command blocks.
//!
//! Layering, leaf-first: [`transport`] owns the pseudo-terminal and child
//! process, [`session::Session`] wraps one transport behind a state machine,
//! [`registry::SessionRegistry`] is the process-wide table of live sessions,
//! [`history::BlockHistory`] is the per-session command-block log, and
//! [`dispatcher::CommandDispatcher`] is the single entry point translating
//! user input into session writes plus history bookkeeping.

mod dispatcher;
mod errors;
mod history;
mod registry;
mod session;
mod suggest;
mod transport;

pub use dispatcher::CommandDispatcher;
pub use dispatcher::DispatcherConfig;
pub use dispatcher::SubmitOutcome;
pub use errors::DispatchError;
pub use errors::HistoryError;
pub use errors::RegistryError;
pub use errors::SessionError;
pub use errors::SuggestError;
pub use errors::TransportError;
pub use history::BlockHistory;
pub use registry::SessionRegistry;
pub use session::Session;
pub use suggest::CannedSuggester;
pub use suggest::SuggestionProvider;
pub use transport::Transport;

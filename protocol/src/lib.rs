//! Wire-facing types shared between the terminal session engine and any
//! presentation layer (desktop shell, TUI, tests). The engine crate owns all
//! behavior; this crate only carries data.

mod block;
mod session;
mod suggest;

pub use block::BlockId;
pub use block::BlockRecord;
pub use block::BlockStatus;
pub use session::PtyGeometry;
pub use session::SessionEvent;
pub use session::SessionEventKind;
pub use session::SessionId;
pub use session::SessionSpec;
pub use session::SessionState;
pub use session::TransportKind;
pub use suggest::Suggestion;

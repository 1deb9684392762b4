use serde::Deserialize;
use serde::Serialize;

/// A candidate command produced by the suggestion collaborator for a
/// free-text intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub command: String,
    pub explanation: String,
}

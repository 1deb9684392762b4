use async_trait::async_trait;

use crate::errors::SuggestError;
use aether_protocol::Suggestion;

/// External collaborator that turns free-text intent into a candidate
/// command. Calls may be slow and may fail; neither is allowed to get in the
/// way of plain command submission.
#[async_trait]
pub trait SuggestionProvider: Send + Sync {
    async fn suggest(&self, intent: &str) -> Result<Suggestion, SuggestError>;
}

/// Deterministic built-in provider with a small set of keyed responses.
/// Useful as a default and in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct CannedSuggester;

#[async_trait]
impl SuggestionProvider for CannedSuggester {
    async fn suggest(&self, intent: &str) -> Result<Suggestion, SuggestError> {
        if intent.contains("git") {
            return Ok(Suggestion {
                command: "git status".to_string(),
                explanation: "Checks the status of your working directory.".to_string(),
            });
        }
        Ok(Suggestion {
            command: "echo 'Hello Aether'".to_string(),
            explanation: "A simple command to print text to the terminal.".to_string(),
        })
    }
}

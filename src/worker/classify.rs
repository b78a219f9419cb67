//! Deciding whether a failed message gets another attempt.

use serde::Serialize;

use crate::core::Message;
use crate::pipeline::OrchestratorResult;

/// What to do with a message whose run did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Retry,
    Terminal,
}

/// Host-supplied retry policy.
pub trait FailureClassifier: Send + Sync {
    fn classify(
        &self,
        message: &Message,
        result: &OrchestratorResult,
        max_retries: u32,
    ) -> Disposition;
}

/// Classifies by keywords in the failed stages' error text.
///
/// Exhausted retries are terminal. Errors are checked in stage order and the
/// first one matching a keyword decides; within one error terminal keywords
/// win. Critical stages' errors are used when there are any. Errors matching
/// neither list are terminal.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    terminal: Vec<String>,
    retryable: Vec<String>,
}

impl KeywordClassifier {
    pub fn new<S: Into<String>>(
        terminal: impl IntoIterator<Item = S>,
        retryable: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            terminal: terminal.into_iter().map(|k| k.into().to_lowercase()).collect(),
            retryable: retryable.into_iter().map(|k| k.into().to_lowercase()).collect(),
        }
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new(
            ["validation", "invalid"],
            ["timeout", "connection", "temporary", "unavailable"],
        )
    }
}

impl FailureClassifier for KeywordClassifier {
    fn classify(
        &self,
        message: &Message,
        result: &OrchestratorResult,
        max_retries: u32,
    ) -> Disposition {
        if message.retry_count >= max_retries {
            return Disposition::Terminal;
        }

        let critical: Vec<&str> = result
            .stages
            .iter()
            .filter(|stage| stage.critical)
            .filter_map(|stage| stage.result())
            .filter(|stage| !stage.success)
            .filter_map(|stage| stage.error.as_deref())
            .collect();
        let errors = if critical.is_empty() {
            result.errors()
        } else {
            critical
        };

        errors
            .into_iter()
            .find_map(|error| self.match_error(error))
            .unwrap_or(Disposition::Terminal)
    }
}

impl KeywordClassifier {
    fn match_error(&self, error: &str) -> Option<Disposition> {
        let text = error.to_lowercase();
        if self.terminal.iter().any(|k| text.contains(k.as_str())) {
            Some(Disposition::Terminal)
        } else if self.retryable.iter().any(|k| text.contains(k.as_str())) {
            Some(Disposition::Retry)
        } else {
            None
        }
    }
}

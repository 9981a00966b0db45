//! Pipeline error taxonomy.

use docgrid_db::DbError;
use thiserror::Error;

use crate::llm::LlmError;
use crate::wire::ParseError;

/// Terminal classification of a pipeline failure. Errors surface upward
/// and become the job's failure; nothing is swallowed locally.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Structural precondition violated (empty batch, unknown project or
    /// batch, schema mismatch). Non-retriable.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Store(#[from] DbError),

    /// The job was canceled while the pipeline was in flight; its write
    /// was discarded.
    #[error("job canceled")]
    Canceled,
}

impl ExtractError {
    pub fn is_retriable(&self) -> bool {
        match self {
            ExtractError::Llm(e) => e.is_retriable(),
            ExtractError::Store(e) => e.is_retriable(),
            ExtractError::InvalidBatch(_) | ExtractError::Parse(_) | ExtractError::Canceled => {
                false
            }
        }
    }

    /// Whether the owning batch should be marked failed for this error.
    /// Store failures leave the batch `processing` for the stale sweep;
    /// cancellation is not a failure at all.
    pub fn fails_batch(&self) -> bool {
        matches!(
            self,
            ExtractError::InvalidBatch(_) | ExtractError::Llm(_) | ExtractError::Parse(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriability_classification() {
        assert!(ExtractError::Llm(LlmError::Network("timeout".to_string())).is_retriable());
        assert!(!ExtractError::Llm(LlmError::Client {
            status: 401,
            body: String::new()
        })
        .is_retriable());
        assert!(!ExtractError::InvalidBatch("empty".to_string()).is_retriable());
        assert!(!ExtractError::Parse(ParseError::Json("nope".to_string())).is_retriable());
        assert!(!ExtractError::Canceled.is_retriable());

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        assert!(ExtractError::Store(DbError::Io(io)).is_retriable());
    }

    #[test]
    fn test_batch_failure_scope() {
        assert!(ExtractError::InvalidBatch("empty".to_string()).fails_batch());
        assert!(ExtractError::Parse(ParseError::Json("nope".to_string())).fails_batch());
        assert!(!ExtractError::Canceled.fails_batch());

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        assert!(!ExtractError::Store(DbError::Io(io)).fails_batch());
    }
}

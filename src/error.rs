use thiserror::Error;

/// Why a scan submission did not produce an accepted task.
///
/// `InvalidTarget` and `AlreadyInProgress` are resolved locally and never
/// reach the network. `TransportFailure` covers everything that went wrong
/// after a request was attempted: connection errors, timeouts, non-2xx
/// responses and undecodable bodies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("invalid scan target")]
    InvalidTarget,
    #[error("a scan submission is already in progress")]
    AlreadyInProgress,
    #[error("scan request failed: {message}")]
    TransportFailure { message: String },
}

impl SubmissionError {
    pub fn transport(message: impl Into<String>) -> Self {
        SubmissionError::TransportFailure {
            message: message.into(),
        }
    }

    /// Transport failures are surfaced in the log feed; local rejections are not.
    pub fn is_reportable(&self) -> bool {
        matches!(self, SubmissionError::TransportFailure { .. })
    }
}

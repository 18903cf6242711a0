use thiserror::Error;

/// Error taxonomy for staged transfers.
///
/// Request-level failures (`Parse`, `Protocol`, and `NotFound` from the
/// control-plane) abort the whole request. `Authorization` and `Transfer`
/// raised while moving a single file become an ERROR outcome for that file
/// only; sibling files keep going. `Cancelled` is terminal: the session was
/// closed and no amount of retrying reopens it.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StageError {
    /// Whether a retry can possibly succeed. Authorization failures are
    /// terminal: retrying cannot mint a broader credential. NotFound and
    /// malformed input are equally hopeless.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::Transfer(_))
    }
}

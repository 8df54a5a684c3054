use thiserror::Error;

/// Failure taxonomy for an active terminal session. Every variant is fatal to
/// the session it occurs in; auxiliary failures (transcript and audit writes)
/// are logged at the call site instead of being represented here.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A malformed client frame (e.g. an undecodable resize payload).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket or SSH channel I/O failure while the session was active.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote session, PTY or shell could not be started.
    #[error("shell setup failed: {0}")]
    Setup(String),
}

impl From<russh::Error> for RelayError {
    fn from(err: russh::Error) -> Self {
        RelayError::Transport(err.to_string())
    }
}

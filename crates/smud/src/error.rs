use smu_driver::InstrumentError;
use thiserror::Error;

/// Failure of one dispatched command, reported to the requesting client.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The instrument did not answer within the per-call timeout.
    #[error("{0}")]
    Timeout(String),
    /// Bus, socket, or instrument-side fault.
    #[error("{0}")]
    Transport(String),
    /// Request rejected before touching the instrument.
    #[error("{0}")]
    Validation(String),
    /// The instrument answered with something that is not a reading.
    #[error("{0}")]
    Protocol(String),
    /// The guard task is gone; the server is shutting down.
    #[error("instrument unavailable: server is shutting down")]
    Unavailable,
}

impl CommandError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CommandError::Timeout(_))
    }
}

impl From<InstrumentError> for CommandError {
    fn from(err: InstrumentError) -> Self {
        match err {
            InstrumentError::Timeout { .. } => CommandError::Timeout(err.to_string()),
            InstrumentError::MalformedReply { .. } => CommandError::Protocol(err.to_string()),
            other => CommandError::Transport(other.to_string()),
        }
    }
}

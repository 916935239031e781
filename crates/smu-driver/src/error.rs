use thiserror::Error;

/// Failures talking to an instrument.
#[derive(Debug, Error)]
pub enum InstrumentError {
    /// The instrument did not answer within the per-call timeout.
    #[error("timeout after {after_ms} ms waiting on '{command}'")]
    Timeout { command: String, after_ms: u64 },
    /// Socket-level failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Bus or instrument-side fault.
    #[error("transport fault: {0}")]
    Transport(String),
    /// Reply could not be interpreted.
    #[error("malformed reply to '{command}': {reply:?}")]
    MalformedReply { command: String, reply: String },
    /// Resource string could not be parsed.
    #[error("invalid resource '{0}'")]
    InvalidResource(String),
    /// Resource kind has no driver in this build.
    #[error("unsupported resource: {0}")]
    Unsupported(String),
}

impl InstrumentError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, InstrumentError::Timeout { .. })
    }
}

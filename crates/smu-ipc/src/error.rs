use thiserror::Error;

/// Transport and serialization failures for SMU client/server traffic.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Underlying socket I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Request/response encoding failed.
    #[error("failed to encode json payload: {0}")]
    Encode(String),
    /// Request/response decoding failed.
    #[error("failed to decode json payload: {0}")]
    Decode(String),
    /// Operation exceeded configured timeout.
    #[error("request timed out")]
    Timeout,
    /// Frame size exceeded maximum allowed payload.
    #[error("frame too large: {size} > {max}")]
    FrameTooLarge { size: usize, max: usize },
}

use thiserror::Error;

/// Failures turning a wire record into a typed [`crate::Command`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Request was not valid JSON or lacked a `type` tag.
    #[error("Invalid JSON format")]
    InvalidJson(String),
    /// Tag did not name a known command.
    #[error("Unknown command type: {0}")]
    UnknownCommand(String),
    /// Fields under `data` were missing, mistyped, or unexpected.
    #[error("invalid data for '{kind}': {detail}")]
    InvalidData { kind: String, detail: String },
}

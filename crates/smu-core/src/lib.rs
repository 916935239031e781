//! Wire types shared by the SMU server and its clients.

pub mod errors;
pub mod protocol;
pub mod time;

pub use errors::DecodeError;
pub use protocol::{
    Command, CurrentSourceSpec, Measurement, OutputState, Response, ResponseData, SourceRange,
    StatusReport, SweepPoint, SweepSpec, VoltageSourceSpec, WireRequest,
};
pub use time::now;

/// Decodes one request document, separating malformed JSON from bad commands.
pub fn decode_request(bytes: &[u8]) -> Result<Command, DecodeError> {
    let wire: WireRequest =
        serde_json::from_slice(bytes).map_err(|err| DecodeError::InvalidJson(err.to_string()))?;
    Command::try_from(wire)
}

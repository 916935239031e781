use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::DecodeError;

/// Raw `{type, data}` record exchanged on the wire before typed decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    /// Command tag, e.g. `voltage_sweep`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Command-specific fields.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Commands accepted by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireRequest", into = "WireRequest")]
pub enum Command {
    /// Sends a raw instrument command without reading a reply.
    Write {
        /// Raw instrument command text.
        command: String,
    },
    /// Sends a raw instrument query and returns the trimmed reply.
    Query {
        /// Raw instrument query text.
        command: String,
    },
    /// Takes one measurement.
    Read,
    /// Configures the instrument as a fixed voltage source.
    SetupVoltageSource(VoltageSourceSpec),
    /// Configures the instrument as a fixed current source.
    SetupCurrentSource(CurrentSourceSpec),
    /// Turns the source output on or off.
    SetOutput {
        /// Requested output state.
        state: OutputState,
    },
    /// Runs a stepped voltage sweep as one uninterrupted operation.
    VoltageSweep(SweepSpec),
    /// Reports identification, output state, and read statistics.
    GetStatus,
    /// Resets and clears the instrument.
    Reset,
    /// Switches between the fast and standard profiles.
    SetFastMode {
        /// True selects the fast profile.
        enabled: bool,
    },
}

impl Command {
    /// Wire tag for this command.
    pub fn tag(&self) -> &'static str {
        match self {
            Command::Write { .. } => "write",
            Command::Query { .. } => "query",
            Command::Read => "read",
            Command::SetupVoltageSource(_) => "setup_voltage_source",
            Command::SetupCurrentSource(_) => "setup_current_source",
            Command::SetOutput { .. } => "output",
            Command::VoltageSweep(_) => "voltage_sweep",
            Command::GetStatus => "get_status",
            Command::Reset => "reset",
            Command::SetFastMode { .. } => "set_fast_mode",
        }
    }
}

/// Source range selection.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "RangeRepr", into = "RangeRepr")]
pub enum SourceRange {
    /// Instrument chooses the range.
    #[default]
    Auto,
    /// Fixed range upper bound.
    Fixed(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RangeRepr {
    Level(f64),
    Keyword(String),
}

impl TryFrom<RangeRepr> for SourceRange {
    type Error = String;

    fn try_from(value: RangeRepr) -> Result<Self, Self::Error> {
        match value {
            RangeRepr::Level(level) => Ok(SourceRange::Fixed(level)),
            RangeRepr::Keyword(word) if word.trim().eq_ignore_ascii_case("auto") => {
                Ok(SourceRange::Auto)
            }
            RangeRepr::Keyword(word) => word
                .trim()
                .parse::<f64>()
                .map(SourceRange::Fixed)
                .map_err(|_| format!("invalid range '{word}': expected AUTO or a number")),
        }
    }
}

impl From<SourceRange> for RangeRepr {
    fn from(value: SourceRange) -> Self {
        match value {
            SourceRange::Auto => RangeRepr::Keyword("AUTO".to_string()),
            SourceRange::Fixed(level) => RangeRepr::Level(level),
        }
    }
}

/// Parameters for `setup_voltage_source`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VoltageSourceSpec {
    /// Source level in volts.
    #[serde(default)]
    pub voltage: f64,
    /// Source range.
    #[serde(default)]
    pub range: SourceRange,
    /// Current compliance in amps.
    #[serde(default = "default_voltage_compliance")]
    pub compliance: f64,
}

/// Parameters for `setup_current_source`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CurrentSourceSpec {
    /// Source level in amps.
    #[serde(default)]
    pub current: f64,
    /// Source range.
    #[serde(default)]
    pub range: SourceRange,
    /// Voltage compliance in volts.
    #[serde(default = "default_current_compliance")]
    pub compliance: f64,
}

/// Parameters for `voltage_sweep`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepSpec {
    /// First level in volts.
    pub start: f64,
    /// Last level in volts, inclusive.
    #[serde(default = "default_sweep_stop")]
    pub stop: f64,
    /// Number of points including both ends.
    #[serde(default = "default_sweep_steps")]
    pub steps: u32,
    /// Current compliance in amps.
    #[serde(default = "default_voltage_compliance")]
    pub compliance: f64,
    /// Settling delay between setting a level and measuring, in seconds.
    #[serde(default = "default_sweep_delay")]
    pub delay: f64,
}

fn default_voltage_compliance() -> f64 {
    0.1
}

fn default_current_compliance() -> f64 {
    10.0
}

fn default_sweep_stop() -> f64 {
    5.0
}

fn default_sweep_steps() -> u32 {
    11
}

fn default_sweep_delay() -> f64 {
    0.1
}

fn default_fast_mode() -> bool {
    true
}

/// Requested or reported output state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum OutputState {
    /// Output relay closed, source active.
    On,
    /// Output relay open.
    #[default]
    Off,
}

impl OutputState {
    /// Instrument keyword for this state.
    pub fn as_str(self) -> &'static str {
        match self {
            OutputState::On => "ON",
            OutputState::Off => "OFF",
        }
    }

    pub fn is_on(self) -> bool {
        self == OutputState::On
    }
}

impl fmt::Display for OutputState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ON" | "1" => Ok(OutputState::On),
            "OFF" | "0" => Ok(OutputState::Off),
            _ => Err(format!("invalid output state '{value}': expected ON or OFF")),
        }
    }
}

impl TryFrom<String> for OutputState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OutputState> for &'static str {
    fn from(value: OutputState) -> Self {
        value.as_str()
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ScpiText {
    command: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct OutputFields {
    #[serde(default)]
    state: OutputState,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FastModeFields {
    #[serde(default = "default_fast_mode")]
    enabled: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct NoFields {}

impl TryFrom<WireRequest> for Command {
    type Error = DecodeError;

    fn try_from(wire: WireRequest) -> Result<Self, Self::Error> {
        let kind = wire.kind;
        let data = match wire.data {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };

        let command = match kind.as_str() {
            "write" => Command::Write {
                command: fields::<ScpiText>(&kind, data)?.command,
            },
            "query" => Command::Query {
                command: fields::<ScpiText>(&kind, data)?.command,
            },
            "read" => {
                fields::<NoFields>(&kind, data)?;
                Command::Read
            }
            "setup_voltage_source" => Command::SetupVoltageSource(fields(&kind, data)?),
            "setup_current_source" => Command::SetupCurrentSource(fields(&kind, data)?),
            "output" => Command::SetOutput {
                state: fields::<OutputFields>(&kind, data)?.state,
            },
            "voltage_sweep" => Command::VoltageSweep(fields(&kind, data)?),
            "get_status" => {
                fields::<NoFields>(&kind, data)?;
                Command::GetStatus
            }
            "reset" => {
                fields::<NoFields>(&kind, data)?;
                Command::Reset
            }
            "set_fast_mode" => Command::SetFastMode {
                enabled: fields::<FastModeFields>(&kind, data)?.enabled,
            },
            other => return Err(DecodeError::UnknownCommand(other.to_string())),
        };
        Ok(command)
    }
}

fn fields<T: DeserializeOwned>(kind: &str, data: Value) -> Result<T, DecodeError> {
    serde_json::from_value(data).map_err(|err| DecodeError::InvalidData {
        kind: kind.to_string(),
        detail: err.to_string(),
    })
}

impl From<Command> for WireRequest {
    fn from(command: Command) -> Self {
        let kind = command.tag().to_string();
        let data = match command {
            Command::Write { command } | Command::Query { command } => {
                object([("command", Value::String(command))])
            }
            Command::Read | Command::GetStatus | Command::Reset => Value::Null,
            Command::SetupVoltageSource(spec) => to_fields(&spec),
            Command::SetupCurrentSource(spec) => to_fields(&spec),
            Command::SetOutput { state } => {
                object([("state", Value::String(state.as_str().to_string()))])
            }
            Command::VoltageSweep(spec) => to_fields(&spec),
            Command::SetFastMode { enabled } => object([("enabled", Value::Bool(enabled))]),
        };
        WireRequest { kind, data }
    }
}

fn object<const N: usize>(entries: [(&str, Value); N]) -> Value {
    Value::Object(
        entries
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect(),
    )
}

fn to_fields<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Reply sent for every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Response {
    /// Command completed.
    #[serde(rename = "success")]
    Success {
        /// Optional human-readable summary.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// Optional result payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<ResponseData>,
    },
    /// Command failed.
    #[serde(rename = "error")]
    Failure {
        /// Failure description.
        message: String,
        /// Partial results gathered before the failure, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<ResponseData>,
    },
}

impl Response {
    pub fn message(message: impl Into<String>) -> Self {
        Response::Success {
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn data(data: ResponseData) -> Self {
        Response::Success {
            message: None,
            data: Some(data),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Response::Failure {
            message: message.into(),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success { .. })
    }
}

/// Result payloads carried in `Response::data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    /// Raw instrument reply.
    Text(String),
    /// Ordered sweep points.
    Sweep(Vec<SweepPoint>),
    /// Status record.
    Status(StatusReport),
    /// Single measurement.
    Measurement(Measurement),
}

/// One measurement taken by `read`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Measured voltage in volts.
    pub voltage: f64,
    /// Measured current in amps.
    pub current: f64,
    /// Resistance in ohms; absent when the instrument did not report it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resistance: Option<f64>,
    /// Power in watts; absent when the instrument did not report it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<f64>,
    /// Completion time of the read.
    pub timestamp: DateTime<Utc>,
    /// Wall time spent on this read, in milliseconds.
    pub read_time_ms: f64,
}

/// One step of a voltage sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    /// Commanded source level in volts.
    pub set_voltage: f64,
    /// Measured voltage in volts.
    pub measured_voltage: f64,
    /// Measured current in amps.
    pub measured_current: f64,
    /// Time the step was measured.
    pub timestamp: DateTime<Utc>,
}

/// Snapshot returned by `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Instrument identification string.
    pub instrument: String,
    /// Output state as reported by the instrument.
    pub output: OutputState,
    /// Source function as reported by the instrument.
    pub source_function: String,
    /// Compliance limit last applied through a setup command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliance: Option<f64>,
    /// Time the status was taken.
    pub timestamp: DateTime<Utc>,
    /// Whether the fast profile is active.
    pub fast_mode: bool,
    /// Reads since the last statistics report.
    pub read_count: u64,
    /// Failed reads since the last statistics report.
    pub error_count: u64,
    /// Connected client sessions.
    #[serde(default)]
    pub active_sessions: u64,
}

//! Stepped voltage sweep, run as one guarded operation.

use std::{fmt, time::Duration};

use smu_core::{OutputState, SweepPoint, SweepSpec};
use smu_ipc::framing::MAX_FRAME_SIZE;
use tracing::{debug, error, info};

use crate::{
    error::CommandError,
    instrument::{Instrument, SourceFunction},
    reading::parse_fields,
};

/// Upper bound on one serialized `SweepPoint`, with full-precision floats
/// and a nanosecond RFC 3339 timestamp.
const WORST_CASE_POINT_BYTES: usize = 200;
/// Room left in the frame for the response envelope and failure message.
const RESPONSE_ENVELOPE_BYTES: usize = 4 * 1024;
/// Largest sweep whose full result still fits in one response frame.
pub const MAX_STEPS: u32 =
    ((MAX_FRAME_SIZE - RESPONSE_ENVELOPE_BYTES) / WORST_CASE_POINT_BYTES) as u32;
/// Longest settle time accepted between steps.
pub const MAX_DELAY_SECS: f64 = 3_600.0;

/// Where the sweep was when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    Idle,
    ConfiguredAsVoltageSource,
    OutputEnabled,
    StepAt(u32),
    OutputDisabled,
    Done,
}

impl fmt::Display for SweepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepState::Idle => f.write_str("configuration"),
            SweepState::ConfiguredAsVoltageSource => f.write_str("output enable"),
            SweepState::OutputEnabled => f.write_str("first step"),
            SweepState::StepAt(index) => write!(f, "step {}", index + 1),
            SweepState::OutputDisabled => f.write_str("output disable"),
            SweepState::Done => f.write_str("completion"),
        }
    }
}

/// Points collected before a failure, plus the failure itself.
#[derive(Debug)]
pub struct SweepFailure {
    pub at: SweepState,
    pub error: CommandError,
    pub points: Vec<SweepPoint>,
}

impl fmt::Display for SweepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sweep aborted at {} after {} points: {}",
            self.at,
            self.points.len(),
            self.error
        )
    }
}

pub fn validate(spec: &SweepSpec) -> Result<(), CommandError> {
    let numbers = [
        ("start", spec.start),
        ("stop", spec.stop),
        ("compliance", spec.compliance),
        ("delay", spec.delay),
    ];
    if let Some((name, _)) = numbers.iter().find(|(_, value)| !value.is_finite()) {
        return Err(CommandError::Validation(format!(
            "sweep {name} must be a finite number"
        )));
    }
    if spec.steps < 2 || spec.steps > MAX_STEPS {
        return Err(CommandError::Validation(format!(
            "sweep steps must be between 2 and {MAX_STEPS}, got {}",
            spec.steps
        )));
    }
    if spec.compliance <= 0.0 {
        return Err(CommandError::Validation(
            "sweep compliance must be greater than zero".to_string(),
        ));
    }
    if !(0.0..=MAX_DELAY_SECS).contains(&spec.delay) {
        return Err(CommandError::Validation(format!(
            "sweep delay must be between 0 and {MAX_DELAY_SECS} seconds"
        )));
    }
    Ok(())
}

/// Source level of step `index`.
pub fn level(spec: &SweepSpec, index: u32) -> f64 {
    spec.start + f64::from(index) * (spec.stop - spec.start) / f64::from(spec.steps - 1)
}

/// Runs a validated sweep. Output is commanded off on every path out.
pub async fn run(
    instrument: &mut Instrument,
    spec: &SweepSpec,
) -> Result<Vec<SweepPoint>, SweepFailure> {
    let mut points = Vec::with_capacity(spec.steps as usize);
    let mut state = SweepState::Idle;
    let outcome = drive(instrument, spec, &mut state, &mut points).await;

    let disabled = instrument.write(":OUTP OFF").await;
    if disabled.is_ok() {
        instrument.state_mut().output = OutputState::Off;
    }

    match (outcome, disabled) {
        (Ok(()), Ok(())) => {
            debug!(state = %SweepState::Done, "sweep state");
            info!(points = points.len(), "sweep completed");
            Ok(points)
        }
        (Ok(()), Err(err)) => Err(SweepFailure {
            at: SweepState::OutputDisabled,
            error: err.into(),
            points,
        }),
        (Err(error), disabled) => {
            if let Err(err) = disabled {
                error!(error = %err, "failed to disable output after sweep failure");
            }
            Err(SweepFailure {
                at: state,
                error,
                points,
            })
        }
    }
}

async fn drive(
    instrument: &mut Instrument,
    spec: &SweepSpec,
    state: &mut SweepState,
    points: &mut Vec<SweepPoint>,
) -> Result<(), CommandError> {
    instrument.write(":SOUR:FUNC VOLT").await?;
    instrument.write(":SOUR:VOLT:MODE FIXED").await?;
    instrument.write(":SENS:FUNC \"CURR\"").await?;
    instrument
        .write(&format!(":SENS:CURR:PROT {}", spec.compliance))
        .await?;
    {
        let tracked = instrument.state_mut();
        tracked.source_function = SourceFunction::Voltage;
        tracked.compliance = Some(spec.compliance);
    }
    *state = SweepState::ConfiguredAsVoltageSource;

    instrument.write(":OUTP ON").await?;
    instrument.state_mut().output = OutputState::On;
    *state = SweepState::OutputEnabled;

    let settle = Duration::from_secs_f64(spec.delay);
    for index in 0..spec.steps {
        *state = SweepState::StepAt(index);
        let set_voltage = level(spec, index);
        instrument
            .write(&format!(":SOUR:VOLT {set_voltage}"))
            .await?;
        tokio::time::sleep(settle).await;

        let reply = instrument.query(":READ?").await?;
        let fields = parse_fields(":READ?", &reply)?;
        let &[measured_voltage, measured_current, ..] = fields.as_slice() else {
            return Err(CommandError::Protocol(format!(
                "sweep reading has {} fields, expected at least 2",
                fields.len()
            )));
        };
        points.push(SweepPoint {
            set_voltage,
            measured_voltage,
            measured_current,
            timestamp: smu_core::now(),
        });
    }
    *state = SweepState::OutputDisabled;
    Ok(())
}

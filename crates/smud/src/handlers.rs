use std::sync::Arc;

use smu_core::{
    Command, CurrentSourceSpec, Measurement, OutputState, Response, ResponseData, SourceRange,
    StatusReport, SweepPoint, SweepSpec, VoltageSourceSpec,
};
use smu_ipc::SessionRegistry;
use tokio::time::Instant;
use tracing::{Level, error, info, warn};

use crate::{
    error::CommandError,
    guard::InstrumentGuard,
    instrument::{Instrument, SourceFunction},
    reading::{fast_measurement, parse_fields, standard_measurement},
    stats::ReadStats,
    sweep::{self, SweepFailure},
};

/// Only every `TIMEOUT_LOG_STRIDE`th read timeout is logged.
const TIMEOUT_LOG_STRIDE: u64 = 20;

#[derive(Clone)]
pub struct Handler {
    guard: InstrumentGuard,
    stats: Arc<ReadStats>,
    sessions: SessionRegistry,
}

impl Handler {
    pub fn new(guard: InstrumentGuard, stats: Arc<ReadStats>, sessions: SessionRegistry) -> Self {
        Self {
            guard,
            stats,
            sessions,
        }
    }

    pub async fn handle(&self, command: Command) -> Response {
        let result = match command {
            Command::Write { command } => self.write(command).await,
            Command::Query { command } => self.query(command).await,
            Command::Read => self.read().await,
            Command::SetupVoltageSource(spec) => self.setup_voltage_source(spec).await,
            Command::SetupCurrentSource(spec) => self.setup_current_source(spec).await,
            Command::SetOutput { state } => self.set_output(state).await,
            Command::VoltageSweep(spec) => return self.voltage_sweep(spec).await,
            Command::GetStatus => self.status().await,
            Command::Reset => self.reset().await,
            Command::SetFastMode { enabled } => self.set_fast_mode(enabled).await,
        };

        match result {
            Ok(response) => response,
            Err(err) => to_error_response(err),
        }
    }

    async fn write(&self, command: String) -> Result<Response, CommandError> {
        let message = format!("Command '{command}' executed");
        self.guard
            .execute(move |instrument| Box::pin(write_raw(instrument, command)))
            .await?;
        Ok(Response::message(message))
    }

    async fn query(&self, command: String) -> Result<Response, CommandError> {
        let reply = self
            .guard
            .execute(move |instrument| Box::pin(query_raw(instrument, command)))
            .await?;
        Ok(Response::data(ResponseData::Text(reply)))
    }

    async fn read(&self) -> Result<Response, CommandError> {
        let stats = Arc::clone(&self.stats);
        let measurement = self
            .guard
            .execute(move |instrument| Box::pin(counted_read(instrument, stats)))
            .await?;
        Ok(Response::data(ResponseData::Measurement(measurement)))
    }

    async fn setup_voltage_source(
        &self,
        spec: VoltageSourceSpec,
    ) -> Result<Response, CommandError> {
        validate_source("voltage", spec.voltage, spec.range, spec.compliance)?;
        let message = format!(
            "Voltage source setup: {}V, compliance: {}A",
            spec.voltage, spec.compliance
        );
        let plan = SourcePlan {
            function: SourceFunction::Voltage,
            sense: "CURR",
            level: spec.voltage,
            range: spec.range,
            compliance: spec.compliance,
        };
        self.guard
            .execute(move |instrument| Box::pin(configure_source(instrument, plan)))
            .await?;
        Ok(Response::message(message))
    }

    async fn setup_current_source(
        &self,
        spec: CurrentSourceSpec,
    ) -> Result<Response, CommandError> {
        validate_source("current", spec.current, spec.range, spec.compliance)?;
        let message = format!(
            "Current source setup: {}A, compliance: {}V",
            spec.current, spec.compliance
        );
        let plan = SourcePlan {
            function: SourceFunction::Current,
            sense: "VOLT",
            level: spec.current,
            range: spec.range,
            compliance: spec.compliance,
        };
        self.guard
            .execute(move |instrument| Box::pin(configure_source(instrument, plan)))
            .await?;
        Ok(Response::message(message))
    }

    async fn set_output(&self, state: OutputState) -> Result<Response, CommandError> {
        self.guard
            .execute(move |instrument| Box::pin(switch_output(instrument, state)))
            .await?;
        Ok(Response::message(format!("Output {state}")))
    }

    async fn voltage_sweep(&self, spec: SweepSpec) -> Response {
        if let Err(err) = sweep::validate(&spec) {
            return to_error_response(err);
        }
        info!(
            start = spec.start,
            stop = spec.stop,
            steps = spec.steps,
            "starting voltage sweep"
        );

        let outcome = self
            .guard
            .execute(move |instrument| Box::pin(run_sweep(instrument, spec)))
            .await;

        match outcome {
            Ok(Ok(points)) => Response::data(ResponseData::Sweep(points)),
            Ok(Err(failure)) => {
                error!(error = %failure.error, at = %failure.at, "sweep failed");
                Response::Failure {
                    message: failure.to_string(),
                    data: Some(ResponseData::Sweep(failure.points)),
                }
            }
            Err(err) => to_error_response(err),
        }
    }

    async fn status(&self) -> Result<Response, CommandError> {
        let active_sessions = self.sessions.count().await as u64;
        let stats = Arc::clone(&self.stats);
        let report = self
            .guard
            .execute(move |instrument| {
                Box::pin(read_status(instrument, stats, active_sessions))
            })
            .await?;
        Ok(Response::data(ResponseData::Status(report)))
    }

    async fn reset(&self) -> Result<Response, CommandError> {
        self.guard
            .execute(|instrument| Box::pin(reset(instrument)))
            .await?;
        Ok(Response::message("Instrument reset"))
    }

    async fn set_fast_mode(&self, enabled: bool) -> Result<Response, CommandError> {
        self.guard
            .execute(move |instrument| Box::pin(apply_profile(instrument, enabled)))
            .await?;
        let message = if enabled {
            "Fast mode enabled"
        } else {
            "Fast mode disabled"
        };
        info!(fast_mode = enabled, "measurement profile changed");
        Ok(Response::message(message))
    }
}

async fn write_raw(instrument: &mut Instrument, command: String) -> Result<(), CommandError> {
    instrument.write(&command).await?;
    Ok(())
}

async fn query_raw(instrument: &mut Instrument, command: String) -> Result<String, CommandError> {
    Ok(instrument.query(&command).await?)
}

async fn switch_output(
    instrument: &mut Instrument,
    state: OutputState,
) -> Result<(), CommandError> {
    instrument.write(&format!(":OUTP {state}")).await?;
    instrument.state_mut().output = state;
    Ok(())
}

async fn reset(instrument: &mut Instrument) -> Result<(), CommandError> {
    instrument.reset().await?;
    Ok(())
}

async fn apply_profile(instrument: &mut Instrument, fast: bool) -> Result<(), CommandError> {
    instrument.apply_profile(fast).await?;
    Ok(())
}

async fn run_sweep(
    instrument: &mut Instrument,
    spec: SweepSpec,
) -> Result<Result<Vec<SweepPoint>, SweepFailure>, CommandError> {
    Ok(sweep::run(instrument, &spec).await)
}

async fn read_status(
    instrument: &mut Instrument,
    stats: Arc<ReadStats>,
    active_sessions: u64,
) -> Result<StatusReport, CommandError> {
    let identity = instrument.query("*IDN?").await?;
    let output = if instrument.query(":OUTP?").await? == "1" {
        OutputState::On
    } else {
        OutputState::Off
    };
    let source_function = instrument.query(":SOUR:FUNC?").await?;
    instrument.state_mut().output = output;

    let (read_count, error_count) = stats.snapshot();
    Ok(StatusReport {
        instrument: identity,
        output,
        source_function,
        compliance: instrument.state().compliance,
        timestamp: smu_core::now(),
        fast_mode: instrument.state().fast_mode,
        read_count,
        error_count,
        active_sessions,
    })
}

#[derive(Debug, Clone, Copy)]
struct SourcePlan {
    function: SourceFunction,
    sense: &'static str,
    level: f64,
    range: SourceRange,
    compliance: f64,
}

async fn configure_source(
    instrument: &mut Instrument,
    plan: SourcePlan,
) -> Result<(), CommandError> {
    let source = plan.function.keyword();
    instrument.write(&format!(":SOUR:FUNC {source}")).await?;
    instrument
        .write(&format!(":SOUR:{source}:MODE FIXED"))
        .await?;
    instrument
        .write(&format!(":SOUR:{source} {}", plan.level))
        .await?;
    if let SourceRange::Fixed(range) = plan.range {
        instrument
            .write(&format!(":SOUR:{source}:RANG {range}"))
            .await?;
    }
    instrument
        .write(&format!(":SENS:FUNC \"{}\"", plan.sense))
        .await?;
    instrument
        .write(&format!(":SENS:{}:PROT {}", plan.sense, plan.compliance))
        .await?;

    let state = instrument.state_mut();
    state.source_function = plan.function;
    state.compliance = Some(plan.compliance);
    Ok(())
}

/// One `:READ?` with counter bookkeeping and sampled failure logging.
async fn counted_read(
    instrument: &mut Instrument,
    stats: Arc<ReadStats>,
) -> Result<Measurement, CommandError> {
    let window = stats.record_read();
    let started = Instant::now();
    let result = measure(instrument, started).await;

    if let Err(err) = &result {
        let errors = stats.record_error(window);
        match read_failure_level(err.is_timeout(), errors) {
            Some(level) if level == Level::WARN => {
                warn!(error_count = errors, error = %err, "read timeout");
            }
            Some(_) => error!(error_count = errors, error = %err, "read failed"),
            None => {}
        }
    }
    result
}

/// Log level for a failed read, or `None` when a timeout falls between samples.
fn read_failure_level(is_timeout: bool, error_count: u64) -> Option<Level> {
    if !is_timeout {
        Some(Level::ERROR)
    } else if error_count % TIMEOUT_LOG_STRIDE == 1 {
        Some(Level::WARN)
    } else {
        None
    }
}

async fn measure(
    instrument: &mut Instrument,
    started: Instant,
) -> Result<Measurement, CommandError> {
    let reply = instrument.query(":READ?").await?;
    let read_time_ms = started.elapsed().as_secs_f64() * 1_000.0;
    let fields = parse_fields(":READ?", &reply)?;
    let timestamp = smu_core::now();
    if instrument.state().fast_mode {
        fast_measurement(&fields, timestamp, read_time_ms)
    } else {
        standard_measurement(&fields, timestamp, read_time_ms)
    }
}

fn validate_source(
    quantity: &str,
    level: f64,
    range: SourceRange,
    compliance: f64,
) -> Result<(), CommandError> {
    if !level.is_finite() {
        return Err(CommandError::Validation(format!(
            "{quantity} level must be a finite number"
        )));
    }
    if !compliance.is_finite() || compliance <= 0.0 {
        return Err(CommandError::Validation(
            "compliance must be a finite number greater than zero".to_string(),
        ));
    }
    if let SourceRange::Fixed(value) = range
        && (!value.is_finite() || value <= 0.0)
    {
        return Err(CommandError::Validation(format!(
            "{quantity} range must be AUTO or a positive number"
        )));
    }
    Ok(())
}

fn to_error_response(err: CommandError) -> Response {
    Response::failure(err.to_string())
}

use std::{process::ExitCode, time::Duration};

use clap::{Parser, Subcommand, ValueEnum};
use smu_core::{
    Command as SmuCommand, CurrentSourceSpec, Measurement, OutputState, Response, ResponseData,
    SourceRange, StatusReport, SweepPoint, SweepSpec, VoltageSourceSpec,
};
use smu_ipc::SmuClient;
use thiserror::Error;
use tokio::time::sleep;

/// Per-step allowance for the source write and `:READ?` of a sweep.
const SWEEP_STEP_ALLOWANCE: Duration = Duration::from_millis(250);
/// Extra time on top of a sweep's expected duration.
const SWEEP_SLACK: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "smu", about = "Source-measure unit client")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    #[arg(long, default_value_t = 8888)]
    port: u16,
    /// Per-request timeout in seconds. Sweeps wait at least as long as their
    /// steps and delays need.
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
    /// Print raw JSON responses.
    #[arg(long)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Status,
    Reset,
    Output {
        #[arg(value_enum)]
        state: Switch,
    },
    /// Take measurements; `--count 0` reads until Ctrl-C.
    Read {
        #[arg(long, default_value_t = 1)]
        count: u64,
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,
    },
    Write {
        command: String,
    },
    Query {
        command: String,
    },
    /// Configure a voltage source.
    Vsource {
        #[arg(allow_negative_numbers = true)]
        volts: f64,
        #[arg(long, default_value_t = 0.1)]
        compliance: f64,
        /// Fixed range, or AUTO.
        #[arg(long, default_value = "AUTO")]
        range: String,
    },
    /// Configure a current source.
    Isource {
        #[arg(allow_negative_numbers = true)]
        amps: f64,
        #[arg(long, default_value_t = 10.0)]
        compliance: f64,
        #[arg(long, default_value = "AUTO")]
        range: String,
    },
    Sweep {
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        start: f64,
        #[arg(long, default_value_t = 5.0, allow_negative_numbers = true)]
        stop: f64,
        #[arg(long, default_value_t = 11)]
        steps: u32,
        #[arg(long, default_value_t = 0.1)]
        compliance: f64,
        #[arg(long, default_value_t = 0.1)]
        delay: f64,
    },
    FastMode {
        #[arg(value_enum)]
        state: Switch,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

impl Switch {
    fn is_on(self) -> bool {
        matches!(self, Switch::On)
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Ipc(#[from] smu_ipc::IpcError),
    #[error("server error: {message}")]
    Server {
        message: String,
        partial: Option<Box<ResponseData>>,
    },
    #[error("invalid range '{0}': expected AUTO or a number")]
    InvalidRange(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            if let CliError::Server {
                partial: Some(data),
                ..
            } = &err
            {
                print_data(data);
            }
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let base_timeout = Duration::from_secs(cli.timeout_secs);
    let request_timeout = match &cli.command {
        Command::Sweep { steps, delay, .. } => sweep_timeout(*steps, *delay, base_timeout),
        _ => base_timeout,
    };
    let mut client = SmuClient::connect((cli.host.as_str(), cli.port))
        .await?
        .with_timeout(request_timeout);

    let command = match cli.command {
        Command::Read { count, interval_ms } => {
            return read_loop(&mut client, count, interval_ms, cli.json).await;
        }
        Command::Status => SmuCommand::GetStatus,
        Command::Reset => SmuCommand::Reset,
        Command::Output { state } => SmuCommand::SetOutput {
            state: if state.is_on() {
                OutputState::On
            } else {
                OutputState::Off
            },
        },
        Command::Write { command } => SmuCommand::Write { command },
        Command::Query { command } => SmuCommand::Query { command },
        Command::Vsource {
            volts,
            compliance,
            range,
        } => SmuCommand::SetupVoltageSource(VoltageSourceSpec {
            voltage: volts,
            range: parse_range(&range)?,
            compliance,
        }),
        Command::Isource {
            amps,
            compliance,
            range,
        } => SmuCommand::SetupCurrentSource(CurrentSourceSpec {
            current: amps,
            range: parse_range(&range)?,
            compliance,
        }),
        Command::Sweep {
            start,
            stop,
            steps,
            compliance,
            delay,
        } => SmuCommand::VoltageSweep(SweepSpec {
            start,
            stop,
            steps,
            compliance,
            delay,
        }),
        Command::FastMode { state } => SmuCommand::SetFastMode {
            enabled: state.is_on(),
        },
    };

    let response = client.call(command).await?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    }
    let (message, data) = into_result(response)?;
    if cli.json {
        return Ok(());
    }
    if let Some(message) = message {
        println!("{message}");
    }
    if let Some(data) = data {
        print_data(&data);
    }
    Ok(())
}

async fn read_loop(
    client: &mut SmuClient,
    count: u64,
    interval_ms: u64,
    json: bool,
) -> Result<(), CliError> {
    let mut taken = 0_u64;
    loop {
        let response = client.call(SmuCommand::Read).await?;
        if json {
            println!("{}", serde_json::to_string(&response)?);
        }
        match into_result(response) {
            Ok((_, Some(ResponseData::Measurement(measurement)))) if !json => {
                println!("{}", format_measurement(&measurement));
            }
            Ok(_) => {}
            Err(err) if count == 0 => eprintln!("{err}"),
            Err(err) => return Err(err),
        }

        taken += 1;
        if count != 0 && taken >= count {
            return Ok(());
        }

        tokio::select! {
            _ = sleep(Duration::from_millis(interval_ms)) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

/// Splits a response into its message and data, or a [`CliError::Server`].
fn into_result(response: Response) -> Result<(Option<String>, Option<ResponseData>), CliError> {
    match response {
        Response::Success { message, data } => Ok((message, data)),
        Response::Failure { message, data } => Err(CliError::Server {
            message,
            partial: data.map(Box::new),
        }),
    }
}

/// Time to wait for a sweep of `steps` points settling `delay` seconds each.
fn sweep_timeout(steps: u32, delay: f64, base: Duration) -> Duration {
    let per_step = Duration::try_from_secs_f64(delay.max(0.0))
        .ok()
        .and_then(|settle| settle.checked_add(SWEEP_STEP_ALLOWANCE));
    let expected = per_step
        .and_then(|step| step.checked_mul(steps))
        .and_then(|total| total.checked_add(SWEEP_SLACK));
    expected.map_or(base, |expected| expected.max(base))
}

fn parse_range(value: &str) -> Result<SourceRange, CliError> {
    if value.eq_ignore_ascii_case("auto") {
        return Ok(SourceRange::Auto);
    }
    value
        .parse::<f64>()
        .map(SourceRange::Fixed)
        .map_err(|_| CliError::InvalidRange(value.to_string()))
}

fn print_data(data: &ResponseData) {
    match data {
        ResponseData::Text(text) => println!("{text}"),
        ResponseData::Measurement(measurement) => println!("{}", format_measurement(measurement)),
        ResponseData::Status(report) => print_status(report),
        ResponseData::Sweep(points) => print_sweep(points),
    }
}

fn format_measurement(measurement: &Measurement) -> String {
    let mut line = format!(
        "V={:.6} V  I={:.6e} A",
        measurement.voltage, measurement.current
    );
    if let Some(resistance) = measurement.resistance {
        line.push_str(&format!("  R={resistance:.3e} ohm"));
    }
    if let Some(power) = measurement.power {
        line.push_str(&format!("  P={power:.6e} W"));
    }
    line.push_str(&format!("  ({:.2} ms)", measurement.read_time_ms));
    line
}

fn print_status(report: &StatusReport) {
    println!("instrument:      {}", report.instrument);
    println!("output:          {}", report.output);
    println!("source function: {}", report.source_function);
    if let Some(compliance) = report.compliance {
        println!("compliance:      {compliance}");
    }
    println!("fast mode:       {}", report.fast_mode);
    println!(
        "reads:           {} ({} errors)",
        report.read_count, report.error_count
    );
    println!("sessions:        {}", report.active_sessions);
    println!("timestamp:       {}", report.timestamp.to_rfc3339());
}

fn print_sweep(points: &[SweepPoint]) {
    println!("{:>12} {:>14} {:>14}", "set (V)", "measured (V)", "current (A)");
    for point in points {
        println!(
            "{:>12.6} {:>14.6} {:>14.6e}",
            point.set_voltage, point.measured_voltage, point.measured_current
        );
    }
}

#[cfg(test)]
mod tests {
    use super::{SWEEP_SLACK, parse_range, sweep_timeout};
    use smu_core::SourceRange;
    use std::time::Duration;

    #[test]
    fn short_sweeps_keep_the_base_timeout() {
        let base = Duration::from_secs(60);
        assert_eq!(sweep_timeout(11, 0.1, base), base);
    }

    #[test]
    fn long_sweeps_wait_for_every_step_delay() {
        let base = Duration::from_secs(60);
        let timeout = sweep_timeout(100, 2.0, base);
        assert!(timeout >= Duration::from_secs(200) + SWEEP_SLACK, "{timeout:?}");

        let timeout = sweep_timeout(5_000, 3_600.0, base);
        assert!(timeout >= Duration::from_secs(5_000 * 3_600), "{timeout:?}");
    }

    #[test]
    fn unusable_delays_fall_back_to_the_base_timeout() {
        let base = Duration::from_secs(60);
        assert_eq!(sweep_timeout(11, f64::INFINITY, base), base);
        assert_eq!(sweep_timeout(11, -5.0, base), base);
    }

    #[test]
    fn ranges_parse_auto_or_numbers() {
        assert_eq!(parse_range("auto").expect("parse should succeed"), SourceRange::Auto);
        assert_eq!(
            parse_range("2.5").expect("parse should succeed"),
            SourceRange::Fixed(2.5)
        );
        assert!(parse_range("wide").is_err());
    }
}

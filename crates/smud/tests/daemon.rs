use std::{collections::BTreeSet, net::SocketAddr, time::Duration};

use smu_core::{
    Command, Measurement, OutputState, Response, ResponseData, SourceRange, StatusReport,
    SweepPoint, SweepSpec, VoltageSourceSpec,
};
use smu_driver::{SimFault, SimHandle, SimulatedSourceMeter};
use smu_ipc::{IpcError, SmuClient};
use smud::{Instrument, ServeOptions, serve, sweep::MAX_STEPS};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

struct TestDaemon {
    addr: SocketAddr,
    sim: SimHandle,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<(), IpcError>>,
}

impl TestDaemon {
    async fn start(fast_mode: bool) -> Self {
        Self::start_with(fast_mode, ServeOptions::default()).await
    }

    async fn start_with(fast_mode: bool, options: ServeOptions) -> Self {
        let sim = SimulatedSourceMeter::new(1_000.0);
        let handle = sim.handle();
        let instrument = Instrument::initialize(Box::new(sim), fast_mode)
            .await
            .expect("instrument should initialize");
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener should bind");
        let addr = listener.local_addr().expect("listener address");
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(serve(listener, instrument, options, async move {
            let _ = stopped.await;
        }));
        Self {
            addr,
            sim: handle,
            stop,
            task,
        }
    }

    async fn client(&self) -> SmuClient {
        SmuClient::connect(self.addr)
            .await
            .expect("client should connect")
    }

    async fn shutdown(self) -> SimHandle {
        let _ = self.stop.send(());
        self.task
            .await
            .expect("server task should join")
            .expect("server should stop cleanly");
        self.sim
    }
}

async fn call(client: &mut SmuClient, command: Command) -> Response {
    client.call(command).await.expect("call should succeed")
}

fn measurement(response: Response) -> Measurement {
    match response {
        Response::Success {
            data: Some(ResponseData::Measurement(measurement)),
            ..
        } => measurement,
        other => panic!("expected a measurement, got {other:?}"),
    }
}

fn status(response: Response) -> StatusReport {
    match response {
        Response::Success {
            data: Some(ResponseData::Status(report)),
            ..
        } => report,
        other => panic!("expected a status report, got {other:?}"),
    }
}

fn sweep(start: f64, stop: f64, steps: u32) -> Command {
    Command::VoltageSweep(SweepSpec {
        start,
        stop,
        steps,
        compliance: 0.1,
        delay: 0.0,
    })
}

#[tokio::test]
async fn source_output_read_status_scenario() {
    let daemon = TestDaemon::start(true).await;
    let mut client = daemon.client().await;

    let reply = call(
        &mut client,
        Command::SetupVoltageSource(VoltageSourceSpec {
            voltage: 1.0,
            range: SourceRange::Auto,
            compliance: 0.01,
        }),
    )
    .await;
    assert_eq!(
        reply,
        Response::message("Voltage source setup: 1V, compliance: 0.01A")
    );

    let reply = call(
        &mut client,
        Command::SetOutput {
            state: OutputState::On,
        },
    )
    .await;
    assert_eq!(reply, Response::message("Output ON"));

    let reading = measurement(call(&mut client, Command::Read).await);
    assert!((reading.voltage - 1.0).abs() < 1e-6);
    assert!((reading.current - 1e-3).abs() < 1e-9);
    assert_eq!(reading.resistance, Some(reading.voltage / reading.current));
    assert_eq!(reading.power, Some(reading.voltage * reading.current));

    let reply = call(
        &mut client,
        Command::SetOutput {
            state: OutputState::Off,
        },
    )
    .await;
    assert_eq!(reply, Response::message("Output OFF"));

    let report = status(call(&mut client, Command::GetStatus).await);
    assert_eq!(report.output, OutputState::Off);
    assert_eq!(report.source_function, "VOLT");
    assert_eq!(report.compliance, Some(0.01));
    assert!(report.fast_mode);
    assert_eq!(report.read_count, 1);
    assert_eq!(report.error_count, 0);
    assert_eq!(report.active_sessions, 1);
    assert!(report.instrument.contains("SMU-2400"));

    daemon.shutdown().await;
}

#[tokio::test]
async fn sweep_calls_are_contiguous_under_concurrency() {
    let daemon = TestDaemon::start(true).await;
    let mut sweeper = daemon.client().await;
    let mut poller = daemon.client().await;

    let sweeping = tokio::spawn(async move {
        sweeper
            .call(Command::VoltageSweep(SweepSpec {
                start: 0.0,
                stop: 1.0,
                steps: 11,
                compliance: 0.1,
                delay: 0.005,
            }))
            .await
            .expect("sweep call should succeed")
    });
    let polling = tokio::spawn(async move {
        for _ in 0..5 {
            let reply = poller
                .call(Command::Query {
                    command: "*IDN?".to_string(),
                })
                .await
                .expect("query call should succeed");
            assert!(reply.is_success());
        }
    });

    let reply = sweeping.await.expect("sweep task should join");
    polling.await.expect("poll task should join");
    assert!(reply.is_success(), "sweep failed: {reply:?}");

    let log = daemon.shutdown().await.commands();
    let begin = log
        .iter()
        .position(|command| command == ":SOUR:FUNC VOLT")
        .expect("sweep configuration should be logged");
    // four configuration writes, output on, a level and a read per step, output off
    let sweep_calls = 4 + 1 + 11 * 2 + 1;
    let block = &log[begin..begin + sweep_calls];
    assert_eq!(block.last().map(String::as_str), Some(":OUTP OFF"));
    assert!(block.iter().all(|command| command != "*IDN?"));
    assert_eq!(
        block.iter().filter(|command| *command == ":READ?").count(),
        11
    );
    assert_eq!(log.iter().filter(|command| *command == "*IDN?").count(), 6);
}

#[tokio::test]
async fn sweep_levels_step_evenly() {
    let daemon = TestDaemon::start(true).await;
    let mut client = daemon.client().await;

    let points: Vec<SweepPoint> = match call(&mut client, sweep(0.0, 5.0, 11)).await {
        Response::Success {
            data: Some(ResponseData::Sweep(points)),
            ..
        } => points,
        other => panic!("expected sweep points, got {other:?}"),
    };

    assert_eq!(points.len(), 11);
    for (index, point) in points.iter().enumerate() {
        assert_eq!(point.set_voltage, index as f64 * 5.0 / 10.0);
        assert!((point.measured_voltage - point.set_voltage).abs() < 1e-6);
    }
    assert!(
        points
            .windows(2)
            .all(|pair| pair[0].set_voltage < pair[1].set_voltage)
    );
    assert!(!daemon.sim.output_on());

    daemon.shutdown().await;
}

#[tokio::test]
async fn failed_step_disables_output_and_returns_partial_points() {
    let daemon = TestDaemon::start(true).await;
    let mut client = daemon.client().await;

    // third step fails
    daemon.sim.fail_read(2, SimFault::Bus);
    let reply = call(&mut client, sweep(0.0, 5.0, 11)).await;
    match reply {
        Response::Failure {
            message,
            data: Some(ResponseData::Sweep(points)),
        } => {
            assert!(message.contains("step 3"), "{message}");
            assert_eq!(points.len(), 2);
            assert_eq!(points[1].set_voltage, 0.5);
        }
        other => panic!("expected a partial sweep failure, got {other:?}"),
    }
    assert!(!daemon.sim.output_on());
    assert_eq!(
        daemon.sim.commands().last().map(String::as_str),
        Some(":OUTP OFF")
    );

    daemon.sim.fail_read(0, SimFault::Garbage);
    let reply = call(&mut client, sweep(0.0, 5.0, 11)).await;
    match reply {
        Response::Failure {
            data: Some(ResponseData::Sweep(points)),
            ..
        } => assert!(points.is_empty()),
        other => panic!("expected an empty partial sweep, got {other:?}"),
    }
    assert!(!daemon.sim.output_on());

    daemon.shutdown().await;
}

#[tokio::test]
async fn largest_allowed_sweep_returns_every_point() {
    let daemon = TestDaemon::start(true).await;
    let mut client = daemon.client().await;

    let points = match call(&mut client, sweep(-5.0, 5.0, MAX_STEPS)).await {
        Response::Success {
            data: Some(ResponseData::Sweep(points)),
            ..
        } => points,
        other => panic!("expected sweep points, got {other:?}"),
    };
    assert_eq!(points.len(), MAX_STEPS as usize);
    assert_eq!(points.first().map(|point| point.set_voltage), Some(-5.0));
    assert_eq!(points.last().map(|point| point.set_voltage), Some(5.0));
    assert!(!daemon.sim.output_on());

    let reply = call(&mut client, sweep(0.0, 5.0, MAX_STEPS + 1)).await;
    assert!(!reply.is_success());

    let reply = call(&mut client, Command::GetStatus).await;
    assert!(reply.is_success());

    daemon.shutdown().await;
}

#[tokio::test]
async fn invalid_sweep_never_reaches_instrument() {
    let daemon = TestDaemon::start(true).await;
    let mut client = daemon.client().await;
    let before = daemon.sim.commands().len();

    let reply = call(&mut client, sweep(0.0, 5.0, 1)).await;
    match reply {
        Response::Failure { message, data } => {
            assert!(message.contains("steps"), "{message}");
            assert!(data.is_none());
        }
        other => panic!("expected a validation failure, got {other:?}"),
    }
    assert_eq!(daemon.sim.commands().len(), before);

    daemon.shutdown().await;
}

#[tokio::test]
async fn read_failures_are_counted_and_session_survives() {
    let daemon = TestDaemon::start(true).await;
    let mut client = daemon.client().await;
    call(
        &mut client,
        Command::SetOutput {
            state: OutputState::On,
        },
    )
    .await;

    daemon.sim.fail_read(1, SimFault::Bus);
    daemon.sim.fail_read(3, SimFault::Timeout);
    let mut failures = 0;
    for _ in 0..5 {
        let reply = call(&mut client, Command::Read).await;
        if !reply.is_success() {
            failures += 1;
        }
    }
    assert_eq!(failures, 2);

    let report = status(call(&mut client, Command::GetStatus).await);
    assert_eq!((report.read_count, report.error_count), (5, 2));

    daemon.shutdown().await;
}

#[tokio::test]
async fn monitor_tick_resets_counters() {
    let options = ServeOptions {
        stats_interval: Duration::from_millis(200),
        ..ServeOptions::default()
    };
    let daemon = TestDaemon::start_with(true, options).await;
    let mut client = daemon.client().await;

    for _ in 0..3 {
        measurement(call(&mut client, Command::Read).await);
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    let report = status(call(&mut client, Command::GetStatus).await);
    assert_eq!((report.read_count, report.error_count), (0, 0));

    daemon.shutdown().await;
}

#[tokio::test]
async fn fast_reading_has_exact_shape_and_standard_never_fabricates() {
    let daemon = TestDaemon::start(true).await;
    let mut client = daemon.client().await;

    let reading = measurement(call(&mut client, Command::Read).await);
    let value = serde_json::to_value(&reading).expect("measurement should encode");
    let keys: BTreeSet<&str> = value
        .as_object()
        .expect("measurement is an object")
        .keys()
        .map(String::as_str)
        .collect();
    assert_eq!(
        keys,
        BTreeSet::from([
            "voltage",
            "current",
            "resistance",
            "power",
            "timestamp",
            "read_time_ms"
        ])
    );
    // output is off, so no current flows
    assert_eq!(reading.resistance, Some(1e9));

    let reply = call(&mut client, Command::SetFastMode { enabled: false }).await;
    assert_eq!(reply, Response::message("Fast mode disabled"));
    assert!(daemon.sim.auto_zero());

    let reading = measurement(call(&mut client, Command::Read).await);
    assert!(reading.resistance.is_some());
    assert_eq!(reading.power, None);

    daemon.shutdown().await;
}

#[tokio::test]
async fn reset_in_fast_mode_restores_fast_profile() {
    let daemon = TestDaemon::start(true).await;
    let mut client = daemon.client().await;

    let reply = call(&mut client, Command::Reset).await;
    assert_eq!(reply, Response::message("Instrument reset"));

    let log = daemon.sim.commands();
    let tail: Vec<&str> = log[log.len() - 6..].iter().map(String::as_str).collect();
    assert_eq!(
        tail,
        vec![
            "*RST",
            "*CLS",
            ":SYST:AZER OFF",
            ":DISP:ENAB OFF",
            ":SENS:FUNC:CONC ON",
            ":FORM:ELEM VOLT,CURR",
        ]
    );
    assert!(!daemon.sim.auto_zero());

    daemon.shutdown().await;
}

#[tokio::test]
async fn instrument_errors_become_failures() {
    let daemon = TestDaemon::start(true).await;
    let mut client = daemon.client().await;

    let reply = call(
        &mut client,
        Command::Write {
            command: ":BOGUS 1".to_string(),
        },
    )
    .await;
    assert!(!reply.is_success());

    let reply = call(
        &mut client,
        Command::Write {
            command: ":SOUR:VOLT 2".to_string(),
        },
    )
    .await;
    assert_eq!(reply, Response::message("Command ':SOUR:VOLT 2' executed"));

    daemon.shutdown().await;
}

#[tokio::test]
async fn hung_read_times_out_and_guard_moves_on() {
    let daemon = TestDaemon::start(true).await;
    let mut client = daemon.client().await;

    daemon.sim.fail_read(0, SimFault::Hang);
    let reply = call(&mut client, Command::Read).await;
    match reply {
        Response::Failure { message, .. } => assert!(message.contains("timeout"), "{message}"),
        other => panic!("expected a timeout failure, got {other:?}"),
    }

    let reply = call(
        &mut client,
        Command::Query {
            command: "*IDN?".to_string(),
        },
    )
    .await;
    assert!(reply.is_success());

    daemon.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_sessions_and_leaves_instrument_safe() {
    let daemon = TestDaemon::start(true).await;
    let mut client = daemon.client().await;
    call(
        &mut client,
        Command::SetOutput {
            state: OutputState::On,
        },
    )
    .await;
    assert!(daemon.sim.output_on());

    let sim = daemon.shutdown().await;
    assert!(!sim.output_on());
    assert!(sim.auto_zero());
    assert!(sim.display_enabled());

    let result = client.call(Command::GetStatus).await;
    assert!(result.is_err(), "closed server must not answer: {result:?}");
}

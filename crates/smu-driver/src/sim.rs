use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;

use crate::{InstrumentError, ScpiTransport};

const IDENTITY: &str = "SIMULATED INSTRUMENTS,SMU-2400,0000001,1.0";
/// Reported resistance when no current flows, as a real SMU does.
const OVERFLOW: f64 = 9.91e37;
const DEFAULT_CURRENT_PROTECTION: f64 = 105e-6;
const DEFAULT_VOLTAGE_PROTECTION: f64 = 21.0;

/// Fault injected into an upcoming `:READ?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    /// Reply with a timeout error.
    Timeout,
    /// Reply with a bus fault.
    Bus,
    /// Never reply; the caller's timeout must fire.
    Hang,
    /// Reply with text that is not a reading.
    Garbage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Voltage,
    Current,
}

impl Function {
    fn keyword(self) -> &'static str {
        match self {
            Function::Voltage => "VOLT",
            Function::Current => "CURR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Element {
    Voltage,
    Current,
    Resistance,
}

#[derive(Debug)]
struct SimState {
    load_ohms: f64,
    function: Function,
    voltage_level: f64,
    current_level: f64,
    current_protection: f64,
    voltage_protection: f64,
    output: bool,
    auto_zero: bool,
    display: bool,
    concurrent: bool,
    elements: Vec<Element>,
    log: Vec<String>,
    reads_served: u64,
    faults: BTreeMap<u64, SimFault>,
}

impl SimState {
    fn new(load_ohms: f64) -> Self {
        Self {
            load_ohms,
            function: Function::Voltage,
            voltage_level: 0.0,
            current_level: 0.0,
            current_protection: DEFAULT_CURRENT_PROTECTION,
            voltage_protection: DEFAULT_VOLTAGE_PROTECTION,
            output: false,
            auto_zero: true,
            display: true,
            concurrent: true,
            elements: vec![Element::Voltage, Element::Current, Element::Resistance],
            log: Vec::new(),
            reads_served: 0,
            faults: BTreeMap::new(),
        }
    }

    fn reset(&mut self) {
        let fresh = SimState::new(self.load_ohms);
        self.function = fresh.function;
        self.voltage_level = fresh.voltage_level;
        self.current_level = fresh.current_level;
        self.current_protection = fresh.current_protection;
        self.voltage_protection = fresh.voltage_protection;
        self.output = fresh.output;
        self.auto_zero = fresh.auto_zero;
        self.display = fresh.display;
        self.concurrent = fresh.concurrent;
        self.elements = fresh.elements;
    }

    /// Solves the source/load pair, clamping to the compliance limit.
    fn operating_point(&self) -> (f64, f64) {
        if !self.output {
            return (0.0, 0.0);
        }
        match self.function {
            Function::Voltage => {
                let current = self.voltage_level / self.load_ohms;
                if current.abs() > self.current_protection {
                    let clamped = self.current_protection.copysign(current);
                    (clamped * self.load_ohms, clamped)
                } else {
                    (self.voltage_level, current)
                }
            }
            Function::Current => {
                let voltage = self.current_level * self.load_ohms;
                if voltage.abs() > self.voltage_protection {
                    let clamped = self.voltage_protection.copysign(voltage);
                    (clamped, clamped / self.load_ohms)
                } else {
                    (voltage, self.current_level)
                }
            }
        }
    }

    fn reading(&self) -> String {
        let (voltage, current) = self.operating_point();
        self.elements
            .iter()
            .map(|element| {
                let value = match element {
                    Element::Voltage => voltage,
                    Element::Current => current,
                    Element::Resistance if current == 0.0 => OVERFLOW,
                    Element::Resistance => voltage / current,
                };
                format!("{value:.6E}")
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Shared view of a simulator for inspection and fault injection.
#[derive(Debug, Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    /// Every command received so far, in arrival order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).log.clone()
    }

    /// Whether the simulated output relay is closed.
    pub fn output_on(&self) -> bool {
        lock(&self.state).output
    }

    /// Whether auto-zero is enabled.
    pub fn auto_zero(&self) -> bool {
        lock(&self.state).auto_zero
    }

    /// Whether the front-panel display is enabled.
    pub fn display_enabled(&self) -> bool {
        lock(&self.state).display
    }

    /// Makes the `:READ?` that is `reads_from_now` reads away fail with `fault`.
    ///
    /// `0` targets the very next read.
    pub fn fail_read(&self, reads_from_now: u64, fault: SimFault) {
        let mut state = lock(&self.state);
        let at = state.reads_served + reads_from_now;
        state.faults.insert(at, fault);
    }
}

/// In-process source-measure unit driving an ideal resistive load.
pub struct SimulatedSourceMeter {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedSourceMeter {
    pub fn new(load_ohms: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(load_ohms))),
        }
    }

    /// Returns a handle that stays valid after the simulator is moved.
    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
        }
    }
}

enum QueryOutcome {
    Reply(String),
    Fail(InstrumentError),
    Hang,
}

#[async_trait]
impl ScpiTransport for SimulatedSourceMeter {
    async fn write(&mut self, command: &str) -> Result<(), InstrumentError> {
        let mut state = lock(&self.state);
        state.log.push(command.to_string());
        apply_write(&mut state, command)
    }

    async fn query(&mut self, command: &str) -> Result<String, InstrumentError> {
        let outcome = {
            let mut state = lock(&self.state);
            state.log.push(command.to_string());
            answer_query(&mut state, command)
        };

        match outcome {
            QueryOutcome::Reply(reply) => Ok(reply),
            QueryOutcome::Fail(err) => Err(err),
            QueryOutcome::Hang => std::future::pending().await,
        }
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn split_command(command: &str) -> (String, String) {
    let trimmed = command.trim();
    let (header, argument) = trimmed.split_once(char::is_whitespace).unwrap_or((trimmed, ""));
    (
        header.trim_start_matches(':').to_ascii_uppercase(),
        argument.trim().trim_matches('"').to_ascii_uppercase(),
    )
}

fn parse_level(command: &str, argument: &str) -> Result<f64, InstrumentError> {
    argument
        .parse::<f64>()
        .map_err(|_| InstrumentError::Transport(format!("-104 data type error in '{command}'")))
}

fn parse_switch(command: &str, argument: &str) -> Result<bool, InstrumentError> {
    match argument {
        "ON" | "1" => Ok(true),
        "OFF" | "0" => Ok(false),
        _ => Err(InstrumentError::Transport(format!(
            "-224 illegal parameter value in '{command}'"
        ))),
    }
}

fn apply_write(state: &mut SimState, command: &str) -> Result<(), InstrumentError> {
    let (header, argument) = split_command(command);
    match header.as_str() {
        "*RST" => state.reset(),
        "*CLS" => {}
        "SOUR:FUNC" | "SOUR:FUNC:MODE" => {
            state.function = match argument.as_str() {
                "VOLT" => Function::Voltage,
                "CURR" => Function::Current,
                _ => {
                    return Err(InstrumentError::Transport(format!(
                        "-224 illegal parameter value in '{command}'"
                    )));
                }
            };
        }
        "SOUR:VOLT" | "SOUR:VOLT:LEV" => state.voltage_level = parse_level(command, &argument)?,
        "SOUR:CURR" | "SOUR:CURR:LEV" => state.current_level = parse_level(command, &argument)?,
        "SOUR:VOLT:RANG" | "SOUR:CURR:RANG" => {
            parse_level(command, &argument)?;
        }
        "SOUR:VOLT:MODE" | "SOUR:CURR:MODE" | "SENS:FUNC" => {}
        "SENS:CURR:PROT" => state.current_protection = parse_level(command, &argument)?.abs(),
        "SENS:VOLT:PROT" => state.voltage_protection = parse_level(command, &argument)?.abs(),
        "OUTP" => state.output = parse_switch(command, &argument)?,
        "SYST:AZER" => state.auto_zero = parse_switch(command, &argument)?,
        "DISP:ENAB" => state.display = parse_switch(command, &argument)?,
        "SENS:FUNC:CONC" => state.concurrent = parse_switch(command, &argument)?,
        "FORM:ELEM" => {
            let mut elements = Vec::new();
            for name in argument.split(',').map(str::trim) {
                elements.push(match name {
                    "VOLT" => Element::Voltage,
                    "CURR" => Element::Current,
                    "RES" => Element::Resistance,
                    _ => {
                        return Err(InstrumentError::Transport(format!(
                            "-224 illegal parameter value in '{command}'"
                        )));
                    }
                });
            }
            state.elements = elements;
        }
        _ => {
            return Err(InstrumentError::Transport(format!(
                "-113 undefined header in '{command}'"
            )));
        }
    }
    Ok(())
}

fn answer_query(state: &mut SimState, command: &str) -> QueryOutcome {
    let (header, _) = split_command(command);
    match header.as_str() {
        "*IDN?" => QueryOutcome::Reply(IDENTITY.to_string()),
        "OUTP?" => QueryOutcome::Reply(if state.output { "1" } else { "0" }.to_string()),
        "SOUR:FUNC?" => QueryOutcome::Reply(state.function.keyword().to_string()),
        "SYST:AZER?" => QueryOutcome::Reply(if state.auto_zero { "1" } else { "0" }.to_string()),
        "READ?" | "MEAS?" => {
            let index = state.reads_served;
            state.reads_served += 1;
            match state.faults.remove(&index) {
                Some(SimFault::Timeout) => QueryOutcome::Fail(InstrumentError::Timeout {
                    command: command.to_string(),
                    after_ms: 1_000,
                }),
                Some(SimFault::Bus) => {
                    QueryOutcome::Fail(InstrumentError::Transport("bus fault".to_string()))
                }
                Some(SimFault::Hang) => QueryOutcome::Hang,
                Some(SimFault::Garbage) => QueryOutcome::Reply("#@!".to_string()),
                None => QueryOutcome::Reply(state.reading()),
            }
        }
        _ => QueryOutcome::Fail(InstrumentError::Transport(format!(
            "-113 undefined header in '{command}'"
        ))),
    }
}

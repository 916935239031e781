//! Exclusive handle to the source-measure unit.
//!
//! Every transport call is bounded by the per-call timeout of the active
//! profile. The handle is only ever touched from inside the guard actor.

use std::{future::Future, time::Duration};

use smu_core::OutputState;
use smu_driver::{InstrumentError, Resource, ScpiTransport};
use tokio::time::timeout;
use tracing::{info, warn};

pub const FAST_TIMEOUT: Duration = Duration::from_secs(1);
pub const STANDARD_TIMEOUT: Duration = Duration::from_secs(5);

const FAST_PROFILE: [&str; 4] = [
    ":SYST:AZER OFF",
    ":DISP:ENAB OFF",
    ":SENS:FUNC:CONC ON",
    ":FORM:ELEM VOLT,CURR",
];
const STANDARD_PROFILE: [&str; 4] = [
    ":SYST:AZER ON",
    ":DISP:ENAB ON",
    ":SENS:FUNC:CONC OFF",
    ":FORM:ELEM VOLT,CURR,RES",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFunction {
    Voltage,
    Current,
}

impl SourceFunction {
    pub fn keyword(self) -> &'static str {
        match self {
            SourceFunction::Voltage => "VOLT",
            SourceFunction::Current => "CURR",
        }
    }
}

/// What the server believes the instrument is configured as.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentState {
    pub source_function: SourceFunction,
    pub output: OutputState,
    pub compliance: Option<f64>,
    pub fast_mode: bool,
}

impl InstrumentState {
    fn after_reset(fast_mode: bool) -> Self {
        Self {
            source_function: SourceFunction::Voltage,
            output: OutputState::Off,
            compliance: None,
            fast_mode,
        }
    }
}

pub fn call_timeout(fast_mode: bool) -> Duration {
    if fast_mode {
        FAST_TIMEOUT
    } else {
        STANDARD_TIMEOUT
    }
}

pub struct Instrument {
    transport: Box<dyn ScpiTransport>,
    state: InstrumentState,
    timeout: Duration,
}

impl Instrument {
    /// Opens `resource` and brings the instrument to a known state.
    pub async fn connect(resource: &Resource, fast_mode: bool) -> Result<Self, InstrumentError> {
        let transport = smu_driver::open(resource).await?;
        info!(%resource, "instrument transport opened");
        Self::initialize(transport, fast_mode).await
    }

    /// Identifies, resets, and clears the instrument, then applies the fast
    /// profile when requested.
    pub async fn initialize(
        transport: Box<dyn ScpiTransport>,
        fast_mode: bool,
    ) -> Result<Self, InstrumentError> {
        let mut instrument = Self {
            transport,
            state: InstrumentState::after_reset(fast_mode),
            timeout: call_timeout(fast_mode),
        };

        let identity = instrument.query("*IDN?").await?;
        info!(instrument = %identity, "connected to instrument");
        instrument.write("*RST").await?;
        instrument.write("*CLS").await?;
        if fast_mode {
            instrument.apply_profile(true).await?;
            info!("fast mode enabled");
        }
        Ok(instrument)
    }

    pub fn state(&self) -> &InstrumentState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut InstrumentState {
        &mut self.state
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn write(&mut self, command: &str) -> Result<(), InstrumentError> {
        let limit = self.timeout;
        bounded(limit, command, self.transport.write(command)).await
    }

    /// Sends `command` and returns the reply with surrounding whitespace removed.
    pub async fn query(&mut self, command: &str) -> Result<String, InstrumentError> {
        let limit = self.timeout;
        let reply = bounded(limit, command, self.transport.query(command)).await?;
        Ok(reply.trim().to_string())
    }

    /// Applies the fast or standard profile and the matching call timeout.
    pub async fn apply_profile(&mut self, fast: bool) -> Result<(), InstrumentError> {
        let commands = if fast { FAST_PROFILE } else { STANDARD_PROFILE };
        for command in commands {
            self.write(command).await?;
        }
        self.state.fast_mode = fast;
        self.timeout = call_timeout(fast);
        Ok(())
    }

    /// `*RST` and `*CLS`; in fast mode the fast profile is restored after a
    /// short settle.
    pub async fn reset(&mut self) -> Result<(), InstrumentError> {
        self.write("*RST").await?;
        self.write("*CLS").await?;
        let fast_mode = self.state.fast_mode;
        self.state = InstrumentState::after_reset(fast_mode);
        if fast_mode {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.apply_profile(true).await?;
        }
        Ok(())
    }

    /// Leaves the instrument safe: output off, front panel restored, transport
    /// closed. Every step is attempted; failures are logged.
    pub async fn safe_shutdown(&mut self) {
        match self.write(":OUTP OFF").await {
            Ok(()) => {
                self.state.output = OutputState::Off;
                info!("output disabled");
            }
            Err(err) => warn!(error = %err, "failed to disable output during shutdown"),
        }

        if self.state.fast_mode {
            for command in [":SYST:AZER ON", ":DISP:ENAB ON"] {
                if let Err(err) = self.write(command).await {
                    warn!(command, error = %err, "failed to restore instrument setting");
                }
            }
        }

        if let Err(err) = self.transport.close().await {
            warn!(error = %err, "failed to close instrument transport");
        }
        info!("instrument connection closed");
    }
}

async fn bounded<T>(
    limit: Duration,
    command: &str,
    call: impl Future<Output = Result<T, InstrumentError>>,
) -> Result<T, InstrumentError> {
    match timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(InstrumentError::Timeout {
            command: command.to_string(),
            after_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

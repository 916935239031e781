//! Instrument transports: the byte-level side of the SMU server.
//!
//! The server only needs two primitives from an instrument, `write` and
//! `query`, which [`ScpiTransport`] captures. Command text is passed through
//! untouched.

mod error;
mod resource;
mod sim;
mod socket;

use async_trait::async_trait;

pub use error::InstrumentError;
pub use resource::Resource;
pub use sim::{SimFault, SimHandle, SimulatedSourceMeter};
pub use socket::SocketTransport;

/// Text command channel to one instrument.
#[async_trait]
pub trait ScpiTransport: Send {
    /// Sends a command that produces no reply.
    async fn write(&mut self, command: &str) -> Result<(), InstrumentError>;

    /// Sends a command and returns the raw reply line.
    async fn query(&mut self, command: &str) -> Result<String, InstrumentError>;

    /// Releases the underlying connection.
    async fn close(&mut self) -> Result<(), InstrumentError> {
        Ok(())
    }
}

/// Opens a transport for a parsed resource.
pub async fn open(resource: &Resource) -> Result<Box<dyn ScpiTransport>, InstrumentError> {
    match resource {
        Resource::Simulated { load_ohms } => {
            Ok(Box::new(SimulatedSourceMeter::new(*load_ohms)))
        }
        Resource::Socket { host, port } => {
            let transport = SocketTransport::connect(host, *port).await?;
            Ok(Box::new(transport))
        }
        Resource::Visa(address) => Err(InstrumentError::Unsupported(format!(
            "{address}: no VISA bus driver is available; use a TCPIP socket resource or SIM"
        ))),
    }
}

use std::{fmt, str::FromStr};

use crate::InstrumentError;

const DEFAULT_SIM_LOAD_OHMS: f64 = 1_000.0;

/// Instrument address given on the command line.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    /// In-process simulated SMU driving an ideal resistor.
    Simulated { load_ohms: f64 },
    /// Raw SCPI over TCP, newline terminated.
    Socket { host: String, port: u16 },
    /// GPIB, USB, serial, or VXI-11 addresses that need a VISA library.
    Visa(String),
}

impl FromStr for Resource {
    type Err = InstrumentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let parts: Vec<&str> = trimmed.split("::").collect();
        let head = parts.first().map(|part| part.to_ascii_uppercase()).unwrap_or_default();

        if head == "SIM" {
            return match parts.as_slice() {
                [_] => Ok(Resource::Simulated {
                    load_ohms: DEFAULT_SIM_LOAD_OHMS,
                }),
                [_, load] => match load.parse::<f64>() {
                    Ok(load_ohms) if load_ohms.is_finite() && load_ohms > 0.0 => {
                        Ok(Resource::Simulated { load_ohms })
                    }
                    _ => Err(InstrumentError::InvalidResource(value.to_string())),
                },
                _ => Err(InstrumentError::InvalidResource(value.to_string())),
            };
        }

        if head.starts_with("TCPIP")
            && let [_, host, port, kind] = parts.as_slice()
            && kind.eq_ignore_ascii_case("SOCKET")
        {
            let port = port
                .parse::<u16>()
                .map_err(|_| InstrumentError::InvalidResource(value.to_string()))?;
            if host.is_empty() {
                return Err(InstrumentError::InvalidResource(value.to_string()));
            }
            return Ok(Resource::Socket {
                host: host.to_string(),
                port,
            });
        }

        let visa_prefixes = ["GPIB", "USB", "ASRL", "TCPIP", "VXI", "PXI"];
        if parts.len() >= 2 && visa_prefixes.iter().any(|prefix| head.starts_with(prefix)) {
            return Ok(Resource::Visa(trimmed.to_string()));
        }

        Err(InstrumentError::InvalidResource(value.to_string()))
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Simulated { load_ohms } => write!(f, "SIM::{load_ohms}"),
            Resource::Socket { host, port } => write!(f, "TCPIP0::{host}::{port}::SOCKET"),
            Resource::Visa(address) => f.write_str(address),
        }
    }
}

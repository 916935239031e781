//! Interpretation of `:READ?` replies.

use chrono::{DateTime, Utc};
use smu_core::Measurement;

use crate::error::CommandError;

/// Currents below this magnitude are treated as an open circuit.
pub const OPEN_CIRCUIT_CURRENT: f64 = 1e-12;
/// Resistance reported for an open circuit.
pub const OPEN_CIRCUIT_RESISTANCE: f64 = 1e9;

/// Splits a comma-separated reading into numbers.
pub fn parse_fields(command: &str, reply: &str) -> Result<Vec<f64>, CommandError> {
    reply
        .trim()
        .split(',')
        .map(|field| {
            field.trim().parse::<f64>().map_err(|_| {
                CommandError::Protocol(format!("malformed reply to '{command}': {reply:?}"))
            })
        })
        .collect()
}

/// Requires at least `count` fields and returns the first `count`.
fn leading(command: &str, fields: &[f64], count: usize) -> Result<Vec<f64>, CommandError> {
    if fields.len() < count {
        return Err(CommandError::Protocol(format!(
            "reply to '{command}' has {} fields, expected at least {count}",
            fields.len()
        )));
    }
    Ok(fields[..count].to_vec())
}

/// `voltage / current`, or the open-circuit sentinel when no current flows.
pub fn resistance(voltage: f64, current: f64) -> f64 {
    if current.abs() < OPEN_CIRCUIT_CURRENT {
        OPEN_CIRCUIT_RESISTANCE
    } else {
        voltage / current
    }
}

/// Fast-mode reading: voltage and current from the instrument, resistance and
/// power computed here.
pub fn fast_measurement(
    fields: &[f64],
    timestamp: DateTime<Utc>,
    read_time_ms: f64,
) -> Result<Measurement, CommandError> {
    let values = leading(":READ?", fields, 2)?;
    let (voltage, current) = (values[0], values[1]);
    Ok(Measurement {
        voltage,
        current,
        resistance: Some(resistance(voltage, current)),
        power: Some(voltage * current),
        timestamp,
        read_time_ms,
    })
}

/// Standard-mode reading: up to four fields in voltage, current, resistance,
/// power order. Missing fields stay absent.
pub fn standard_measurement(
    fields: &[f64],
    timestamp: DateTime<Utc>,
    read_time_ms: f64,
) -> Result<Measurement, CommandError> {
    let values = leading(":READ?", fields, 2)?;
    Ok(Measurement {
        voltage: values[0],
        current: values[1],
        resistance: fields.get(2).copied(),
        power: fields.get(3).copied(),
        timestamp,
        read_time_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::{
        OPEN_CIRCUIT_RESISTANCE, fast_measurement, parse_fields, resistance, standard_measurement,
    };
    use crate::error::CommandError;

    #[test]
    fn parses_scientific_fields() {
        let fields = parse_fields(":READ?", "1.000000E+00, 1.000000E-03\n").expect("parse");
        assert_eq!(fields, vec![1.0, 0.001]);
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        let err = parse_fields(":READ?", "#@!").expect_err("garbage must fail");
        assert!(matches!(err, CommandError::Protocol(_)));
    }

    #[test]
    fn open_circuit_uses_sentinel() {
        assert_eq!(resistance(1.0, 0.0), OPEN_CIRCUIT_RESISTANCE);
        assert_eq!(resistance(1.0, 5e-13), OPEN_CIRCUIT_RESISTANCE);
        assert_eq!(resistance(1.0, -5e-13), OPEN_CIRCUIT_RESISTANCE);
        assert_eq!(resistance(2.0, 1e-3), 2_000.0);
    }

    #[test]
    fn fast_measurement_computes_resistance_and_power() {
        let measurement =
            fast_measurement(&[2.0, 0.5e-3], smu_core::now(), 1.5).expect("measurement");
        let resistance = measurement.resistance.expect("fast mode computes resistance");
        let power = measurement.power.expect("fast mode computes power");
        assert!((resistance - 4_000.0).abs() < 1e-9);
        assert!((power - 1e-3).abs() < 1e-15);
    }

    #[test]
    fn fast_measurement_needs_two_fields() {
        assert!(fast_measurement(&[2.0], smu_core::now(), 1.0).is_err());
    }

    #[test]
    fn standard_measurement_never_fabricates_fields() {
        let three = standard_measurement(&[1.0, 1e-3, 1_000.0], smu_core::now(), 2.0)
            .expect("measurement");
        assert_eq!(three.resistance, Some(1_000.0));
        assert_eq!(three.power, None);

        let four = standard_measurement(&[1.0, 1e-3, 1_000.0, 1e-3, 7.0], smu_core::now(), 2.0)
            .expect("measurement");
        assert_eq!(four.power, Some(1e-3));

        let two = standard_measurement(&[1.0, 1e-3], smu_core::now(), 2.0).expect("measurement");
        assert_eq!(two.resistance, None);
        assert_eq!(two.power, None);
    }
}

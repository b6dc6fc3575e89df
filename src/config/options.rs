// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-closed-loop project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Connection options shared by the Modbus master and slave
//!
//! Both ends of the closed loop read the same [`ConnectionOptions`] shape:
//! the slave binds on `address:port` and answers for `unit_id`, the master
//! connects to `address:port` and addresses `unit_id`.

use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ModbusError;

pub const PORT_RANGE: RangeInclusive<u16> = 1..=65535;
pub const UNIT_ID_RANGE: RangeInclusive<u8> = 1..=247;
pub const REGION_SIZE_RANGE: RangeInclusive<u32> = 1..=65536;
pub const RETRIES_RANGE: RangeInclusive<u32> = 0..=10;
pub const RETRY_DELAY_MS_RANGE: RangeInclusive<u64> = 5..=2000;
pub const TIMEOUT_MS_RANGE: RangeInclusive<u64> = 50..=2000;
pub const MAX_CONNECTIONS_RANGE: RangeInclusive<u32> = 1..=100;

/// Configuration of one closed-loop Modbus TCP endpoint.
///
/// # Example
///
/// ```
/// use modbus_closed_loop::config::ConnectionOptions;
///
/// let options = ConnectionOptions {
///     port: 5020,
///     max_holding_registers: 16,
///     ..ConnectionOptions::default()
/// };
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// IP address the slave binds to and the master connects to.
    ///
    /// Must parse as an IPv4 or IPv6 address; host names are rejected.
    pub address: String,

    /// TCP port, 1-65535. Default is 502, the standard Modbus TCP port.
    pub port: u16,

    /// Modbus unit identifier, 1-247.
    pub unit_id: u8,

    /// Number of coils exposed by the slave (1-65536)
    pub max_coils: u32,

    /// Number of discrete inputs exposed by the slave (1-65536)
    pub max_discrete_inputs: u32,

    /// Number of holding registers exposed by the slave (1-65536)
    pub max_holding_registers: u32,

    /// Number of input registers exposed by the slave (1-65536)
    pub max_input_registers: u32,

    /// When set, every write function code is answered with `IllegalFunction`.
    pub read_only: bool,

    /// Additional attempts after a transient failure, 0-10.
    ///
    /// Zero selects the single-attempt policy.
    pub number_of_retries: u32,

    /// Fixed delay between attempts in milliseconds (5-2000)
    pub retry_delay_ms: u64,

    /// Bound on socket connect, in milliseconds (50-2000)
    pub send_timeout_ms: u64,

    /// Bound on waiting for a response, in milliseconds (50-2000)
    pub receive_timeout_ms: u64,

    /// Simultaneous client connections accepted by the slave (1-100)
    pub max_connections: u32,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(), // Loopback, the master and slave share a host
            port: 502,                        // Standard Modbus TCP port
            unit_id: 1,
            max_coils: 100,
            max_discrete_inputs: 100,
            max_holding_registers: 100,
            max_input_registers: 100,
            read_only: false,
            number_of_retries: 3,
            retry_delay_ms: 20,
            send_timeout_ms: 500,
            receive_timeout_ms: 500,
            max_connections: 10,
        }
    }
}

fn check_range<T>(name: &str, value: T, range: &RangeInclusive<T>) -> Result<(), ModbusError>
where
    T: PartialOrd + std::fmt::Display,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ModbusError::invalid_configuration(format!(
            "{} must be within {}..={}, got {}",
            name,
            range.start(),
            range.end(),
            value
        )))
    }
}

impl ConnectionOptions {
    /// Check every field against its declared range.
    ///
    /// Returns the first violation as [`ModbusError::InvalidConfiguration`].
    pub fn validate(&self) -> Result<(), ModbusError> {
        self.ip_address()?;
        check_range("port", self.port, &PORT_RANGE)?;
        check_range("unit_id", self.unit_id, &UNIT_ID_RANGE)?;
        check_range("max_coils", self.max_coils, &REGION_SIZE_RANGE)?;
        check_range(
            "max_discrete_inputs",
            self.max_discrete_inputs,
            &REGION_SIZE_RANGE,
        )?;
        check_range(
            "max_holding_registers",
            self.max_holding_registers,
            &REGION_SIZE_RANGE,
        )?;
        check_range(
            "max_input_registers",
            self.max_input_registers,
            &REGION_SIZE_RANGE,
        )?;
        check_range("number_of_retries", self.number_of_retries, &RETRIES_RANGE)?;
        check_range("retry_delay_ms", self.retry_delay_ms, &RETRY_DELAY_MS_RANGE)?;
        check_range("send_timeout_ms", self.send_timeout_ms, &TIMEOUT_MS_RANGE)?;
        check_range(
            "receive_timeout_ms",
            self.receive_timeout_ms,
            &TIMEOUT_MS_RANGE,
        )?;
        check_range(
            "max_connections",
            self.max_connections,
            &MAX_CONNECTIONS_RANGE,
        )?;
        Ok(())
    }

    pub fn ip_address(&self) -> Result<IpAddr, ModbusError> {
        self.address.trim().parse::<IpAddr>().map_err(|_| {
            ModbusError::invalid_configuration(format!(
                "'{}' is not a valid IP address",
                self.address
            ))
        })
    }

    /// Endpoint built from `address` and `port`, after checking both
    pub fn socket_addr(&self) -> Result<SocketAddr, ModbusError> {
        let ip = self.ip_address()?;
        check_range("port", self.port, &PORT_RANGE)?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// True when both options point at the same address, port and unit
    pub fn same_endpoint(&self, other: &ConnectionOptions) -> bool {
        self.address.trim() == other.address.trim()
            && self.port == other.port
            && self.unit_id == other.unit_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        let options = ConnectionOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.port, 502);
        assert_eq!(options.number_of_retries, 3);
        assert_eq!(options.retry_delay(), Duration::from_millis(20));
    }

    #[test]
    fn test_invalid_address_is_rejected() {
        for address in ["", "localhost", "192.168.0", "not-an-ip", "300.1.1.1"] {
            let options = ConnectionOptions {
                address: address.to_string(),
                ..ConnectionOptions::default()
            };
            assert!(
                matches!(
                    options.validate(),
                    Err(ModbusError::InvalidConfiguration { .. })
                ),
                "address {:?} should be rejected",
                address
            );
        }
    }

    #[test]
    fn test_ipv6_address_is_accepted() {
        let options = ConnectionOptions {
            address: "::1".to_string(),
            ..ConnectionOptions::default()
        };
        let addr = options.socket_addr().unwrap();
        assert!(addr.is_ipv6());
        assert_eq!(addr.port(), 502);
    }

    #[test]
    fn test_out_of_range_fields_are_rejected() {
        let cases = vec![
            ConnectionOptions {
                port: 0,
                ..ConnectionOptions::default()
            },
            ConnectionOptions {
                unit_id: 0,
                ..ConnectionOptions::default()
            },
            ConnectionOptions {
                unit_id: 248,
                ..ConnectionOptions::default()
            },
            ConnectionOptions {
                max_coils: 0,
                ..ConnectionOptions::default()
            },
            ConnectionOptions {
                max_holding_registers: 65537,
                ..ConnectionOptions::default()
            },
            ConnectionOptions {
                number_of_retries: 11,
                ..ConnectionOptions::default()
            },
            ConnectionOptions {
                retry_delay_ms: 4,
                ..ConnectionOptions::default()
            },
            ConnectionOptions {
                receive_timeout_ms: 2001,
                ..ConnectionOptions::default()
            },
            ConnectionOptions {
                max_connections: 0,
                ..ConnectionOptions::default()
            },
        ];

        for options in cases {
            let err = options.validate().unwrap_err();
            assert!(matches!(err, ModbusError::InvalidConfiguration { .. }));
        }
    }

    #[test]
    fn test_zero_retries_is_valid() {
        let options = ConnectionOptions {
            number_of_retries: 0,
            ..ConnectionOptions::default()
        };
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let options: ConnectionOptions =
            serde_yml::from_str("port: 1502\nread_only: true\n").unwrap();
        assert_eq!(options.port, 1502);
        assert!(options.read_only);
        assert_eq!(options.unit_id, 1);
        assert_eq!(options.max_input_registers, 100);
    }

    #[test]
    fn test_same_endpoint() {
        let a = ConnectionOptions::default();
        let mut b = a.clone();
        b.read_only = true;
        assert!(a.same_endpoint(&b));
        b.port = 1502;
        assert!(!a.same_endpoint(&b));
    }
}

// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-closed-loop project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Error type shared by the master, the slave and the retry engine.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio_modbus::ExceptionCode;

/// Errors raised by the closed-loop Modbus subsystem
#[derive(Error, Debug)]
pub enum ModbusError {
    /// Options failed validation. Raised before any socket is opened.
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    #[error("Modbus master is not connected")]
    NotConnected,

    /// The operation is not permitted in the current service state
    #[error("Invalid operation: {reason}")]
    InvalidOperation { reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    /// The remote device answered with a Modbus exception response
    #[error("Device returned exception response {0:?}")]
    Protocol(ExceptionCode),

    /// Framing or transaction mismatch reported by the protocol layer
    #[error("Modbus transport error: {reason}")]
    Transport { reason: String },

    #[error("Unexpected response to {operation}")]
    UnexpectedResponse { operation: String },

    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        source: Box<ModbusError>,
    },

    #[error("Failed to bind Modbus listener on {address}: {source}")]
    Bind { address: String, source: io::Error },
}

impl ModbusError {
    pub(crate) fn invalid_configuration(reason: impl Into<String>) -> Self {
        ModbusError::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_operation(reason: impl Into<String>) -> Self {
        ModbusError::InvalidOperation {
            reason: reason.into(),
        }
    }

    /// Network-level failures that may succeed on another attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, ModbusError::Io { .. } | ModbusError::Timeout { .. })
    }

    /// Exception code carried by this error, following retry wrappers
    pub fn exception_code(&self) -> Option<ExceptionCode> {
        match self {
            ModbusError::Protocol(code) => Some(*code),
            ModbusError::RetriesExhausted { source, .. } => source.exception_code(),
            _ => None,
        }
    }
}

impl From<tokio_modbus::Error> for ModbusError {
    fn from(err: tokio_modbus::Error) -> Self {
        match err {
            tokio_modbus::Error::Transport(source) => ModbusError::Io { source },
            tokio_modbus::Error::Protocol(err) => ModbusError::Transport {
                reason: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let io_err = ModbusError::from(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert!(io_err.is_transient());

        let timeout = ModbusError::Timeout {
            operation: "connect".to_string(),
            timeout: Duration::from_millis(50),
        };
        assert!(timeout.is_transient());

        assert!(!ModbusError::Protocol(ExceptionCode::IllegalDataAddress).is_transient());
        assert!(!ModbusError::NotConnected.is_transient());
        assert!(!ModbusError::invalid_configuration("bad port").is_transient());
    }

    #[test]
    fn test_exception_code_through_retry_wrapper() {
        let err = ModbusError::RetriesExhausted {
            operation: "read".to_string(),
            attempts: 2,
            source: Box::new(ModbusError::Protocol(ExceptionCode::IllegalFunction)),
        };
        assert_eq!(err.exception_code(), Some(ExceptionCode::IllegalFunction));
        assert!(err.to_string().contains("2 attempt(s)"));
    }
}

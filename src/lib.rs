// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-closed-loop project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Closed-loop Modbus TCP library
//!
//! An in-process Modbus TCP master and slave configured to talk to each
//! other, used to validate protocol round trips without external hardware.

pub mod config;
pub mod daemon;
pub mod error;
pub mod modbus;

pub use error::ModbusError;

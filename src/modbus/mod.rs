// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-closed-loop project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Modbus communication module
//!
//! This module provides an in-process Modbus TCP master and slave pair that
//! talk to each other over the network stack, along with the retry engine
//! and the reconfiguration controller driving them.
//!
//! ## Key Components
//!
//! - [`ModbusSlave`]: TCP listener, protocol session and in-memory
//!   [`DataStore`], started and stopped under one operation mutex.
//! - [`ModbusMaster`]: one client session to the configured slave, with
//!   register and coil read/write primitives.
//! - [`RetryPolicy`]: fixed-delay retry of transient failures.
//! - [`LifecycleController`]: applies configuration changes and restarts a
//!   running slave.
//!
//! ## Usage
//!
//! ```no_run
//! use modbus_closed_loop::config::ConnectionOptions;
//! use modbus_closed_loop::modbus::{ModbusMaster, ModbusSlave, StatusNotifier};
//!
//! # async fn run() -> Result<(), modbus_closed_loop::ModbusError> {
//! let options = ConnectionOptions {
//!     port: 5020,
//!     ..ConnectionOptions::default()
//! };
//! let status = StatusNotifier::new();
//! let slave = ModbusSlave::new(options.clone(), status.clone());
//! slave.start().await?;
//!
//! let master = ModbusMaster::new(options, status);
//! master.connect().await?;
//! master.write_single_register(0, 1234).await?;
//! assert_eq!(master.read_holding_registers(0, 1).await?, vec![1234]);
//!
//! master.disconnect().await;
//! slave.stop().await;
//! # Ok(())
//! # }
//! ```

mod connection;
pub mod data_store;
pub mod lifecycle;
pub mod master;
pub mod modbus_server;
pub mod retry;
pub mod slave;
pub mod status;

pub use data_store::{DataStore, Region};
pub use lifecycle::{LifecycleController, ReconfigureOutcome};
pub use master::{MasterStatistics, ModbusMaster, SessionState};
pub use modbus_server::{ClosedLoopService, DiagnosticsSnapshot};
pub use retry::{RetryPolicy, RetryStrategy};
pub use slave::{ModbusSlave, ServiceState};
pub use status::{ClientEvent, StatusEvent, StatusNotifier};

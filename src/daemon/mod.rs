// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-closed-loop project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! # Daemon Module
//!
//! Long-running closed loop: the slave, a connected master, the lifecycle
//! controller and the background tasks feeding it.
//!
//! * **Launch Daemon**: starting, monitoring, and gracefully shutting down
//!   the closed loop and its tasks
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use modbus_closed_loop::{config::{Config, SharedConfig}, daemon::Daemon};
//!
//! async fn run() -> anyhow::Result<()> {
//!     let config = Config::from_file("config.yaml")?;
//!     let shared = SharedConfig::with_file(config, "config.yaml");
//!
//!     let mut daemon = Daemon::new();
//!     daemon
//!         .launch(shared, Some("config.yaml".into()), Duration::from_secs(1))
//!         .await?;
//!
//!     // Wait for shutdown signal (e.g., Ctrl+C)
//!     tokio::signal::ctrl_c().await?;
//!
//!     daemon.shutdown().await;
//!     daemon.join().await?;
//!     Ok(())
//! }
//! ```

pub mod launch_daemon;

pub use launch_daemon::Daemon;

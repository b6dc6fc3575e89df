// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-closed-loop project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

// Main entry point for the closed-loop Modbus harness
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use serde::Serialize;

use modbus_closed_loop::config::{output_config_schema, Config, ConfigProvider, SharedConfig};
use modbus_closed_loop::daemon::Daemon;
use modbus_closed_loop::modbus::{
    DiagnosticsSnapshot, MasterStatistics, ModbusMaster, ModbusSlave, StatusNotifier,
};
use modbus_closed_loop::ModbusError;
use tokio_modbus::ExceptionCode;

/// In-process Modbus TCP master and slave exercising each other
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (YAML), created with defaults when missing
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print the configuration JSON schema and exit
    #[arg(long)]
    show_config_schema: bool,

    /// Slave address, overrides the configuration file
    #[arg(short, long)]
    address: Option<String>,

    /// Slave port, overrides the configuration file
    #[arg(short, long)]
    port: Option<u16>,

    /// Unit identifier, overrides the configuration file
    #[arg(short, long)]
    unit_id: Option<u8>,

    /// Start the slave read-only
    #[arg(long)]
    read_only: bool,

    /// Number of write/read round trips to run
    #[arg(long, default_value_t = 10)]
    cycles: u16,

    /// Keep running and follow configuration file changes until Ctrl-C
    #[arg(long)]
    daemon: bool,

    /// Configuration file polling interval in daemon mode
    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,
}

/// Result of the round-trip run, printed as JSON
#[derive(Debug, Serialize)]
struct CycleReport {
    cycles: u16,
    passed: u16,
    failed: u16,
    read_only: bool,
    slave: DiagnosticsSnapshot,
    master: MasterStatistics,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    let args = Args::parse();

    if args.show_config_schema {
        return output_config_schema();
    }

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;
    config.apply_args(
        args.address.clone(),
        args.port,
        args.unit_id,
        args.read_only,
    );
    // Command line overrides go through the same checks as the file
    modbus_closed_loop::config::utils::validate_specific_rules(&config)?;

    let shared = SharedConfig::with_file(config, &args.config);

    if args.daemon {
        run_daemon(shared, &args).await
    } else {
        run_cycles(shared, args.cycles).await
    }
}

async fn run_daemon(shared: SharedConfig, args: &Args) -> Result<()> {
    let mut daemon = Daemon::new();
    daemon
        .launch(
            shared,
            Some(args.config.clone()),
            Duration::from_millis(args.poll_interval_ms),
        )
        .await?;
    info!("Closed loop running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Ctrl-C received");

    if let Some(slave) = daemon.slave() {
        println!("{}", serde_json::to_string_pretty(&slave.diagnostics())?);
    }
    daemon.shutdown().await;
    daemon.join().await
}

async fn run_cycles(shared: SharedConfig, cycles: u16) -> Result<()> {
    let options = shared.current();
    let status = StatusNotifier::new();

    let slave = ModbusSlave::new(options.clone(), status.clone());
    slave.start().await.context("Failed to start the Modbus slave")?;

    let master = ModbusMaster::new(options.clone(), status);
    if let Err(e) = master.connect().await {
        slave.stop().await;
        return Err(e).context("Failed to connect the Modbus master");
    }

    let mut passed = 0;
    for cycle in 0..cycles {
        match run_cycle(&master, cycle, options.read_only).await {
            Ok(()) => passed += 1,
            Err(e) => error!("Cycle {} failed: {:#}", cycle, e),
        }
    }

    let report = CycleReport {
        cycles,
        passed,
        failed: cycles - passed,
        read_only: options.read_only,
        slave: slave.diagnostics(),
        master: master.statistics(),
    };

    master.disconnect().await;
    slave.stop().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.failed > 0 {
        anyhow::bail!("{} of {} cycle(s) failed", report.failed, cycles);
    }
    Ok(())
}

/// Write a pattern, read it back and compare
async fn run_cycle(master: &ModbusMaster, cycle: u16, read_only: bool) -> Result<()> {
    let options = master.options();
    let register_span = options.max_holding_registers.min(8) as u16;
    let coil_span = options.max_coils.min(8) as u16;
    let address = cycle % register_span;
    let value = cycle.wrapping_mul(257).wrapping_add(1);

    if read_only {
        // Writes must be refused and leave the register untouched
        let before = master.read_holding_registers(address, 1).await?;
        match master.write_single_register(address, value).await {
            Err(ModbusError::Protocol(ExceptionCode::IllegalFunction)) => {}
            Ok(()) => anyhow::bail!("read-only slave accepted a write"),
            Err(e) => return Err(e.into()),
        }
        let after = master.read_holding_registers(address, 1).await?;
        anyhow::ensure!(before == after, "read-only register changed");
        return Ok(());
    }

    master.write_single_register(address, value).await?;
    let read = master.read_holding_registers(address, 1).await?;
    anyhow::ensure!(read == [value], "register {} read {:?}, wrote {}", address, read, value);

    let block: Vec<u16> = (0..register_span).map(|i| value ^ i).collect();
    master.write_multiple_registers(0, &block).await?;
    let read = master.read_holding_registers(0, register_span).await?;
    anyhow::ensure!(read == block, "register block mismatch");

    let coils: Vec<bool> = (0..coil_span).map(|i| (cycle + i) % 2 == 0).collect();
    master.write_multiple_coils(0, &coils).await?;
    let read = master.read_coils(0, coil_span).await?;
    anyhow::ensure!(read == coils, "coil block mismatch");

    let toggled = !coils[0];
    master.write_single_coil(0, toggled).await?;
    let read = master.read_coils(0, 1).await?;
    anyhow::ensure!(read == [toggled], "coil 0 mismatch");

    if cycle == 0 {
        // Discrete and input regions are local to the slave, only readable
        let inputs = master.read_input_registers(0, 1).await?;
        let bits = master.read_discrete_inputs(0, 1).await?;
        if inputs != [0] || bits != [false] {
            warn!("Read-only regions not zero: {:?} {:?}", inputs, bits);
        }
    }
    Ok(())
}

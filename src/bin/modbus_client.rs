// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-closed-loop project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Read any region of a Modbus TCP slave through the closed-loop master

use anyhow::Result;
use clap::{Parser, ValueEnum};
use serde::Serialize;

use modbus_closed_loop::config::ConnectionOptions;
use modbus_closed_loop::modbus::{ModbusMaster, StatusNotifier};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Region {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

/// Read a block of coils or registers from a Modbus TCP slave
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Modbus server address
    #[clap(long, default_value = "127.0.0.1")]
    address: String,

    /// Modbus server port
    #[clap(long, default_value = "502")]
    port: u16,

    /// Unit identifier
    #[clap(long, default_value = "1")]
    unit_id: u8,

    /// Region to read
    #[clap(long, value_enum, default_value = "holding-registers")]
    region: Region,

    /// Starting address
    #[clap(long, default_value = "0")]
    start: u16,

    /// Number of values to read
    #[clap(long, default_value = "6")]
    quantity: u16,

    /// Additional attempts after a transient failure
    #[clap(long, default_value = "3")]
    retries: u32,

    /// Print the values as JSON
    #[clap(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Values {
    Bits(Vec<bool>),
    Words(Vec<u16>),
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let args = Args::parse();

    let options = ConnectionOptions {
        address: args.address.clone(),
        port: args.port,
        unit_id: args.unit_id,
        number_of_retries: args.retries,
        ..ConnectionOptions::default()
    };
    options.validate()?;

    let master = ModbusMaster::new(options, StatusNotifier::new());
    println!(
        "Connecting to Modbus server at {}:{} (unit {})",
        args.address, args.port, args.unit_id
    );
    master.connect().await?;

    let result = match args.region {
        Region::Coils => master
            .read_coils(args.start, args.quantity)
            .await
            .map(Values::Bits),
        Region::DiscreteInputs => master
            .read_discrete_inputs(args.start, args.quantity)
            .await
            .map(Values::Bits),
        Region::HoldingRegisters => master
            .read_holding_registers(args.start, args.quantity)
            .await
            .map(Values::Words),
        Region::InputRegisters => master
            .read_input_registers(args.start, args.quantity)
            .await
            .map(Values::Words),
    };
    master.disconnect().await;
    let values = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&values)?);
        return Ok(());
    }

    match values {
        Values::Bits(bits) => {
            for (i, bit) in bits.iter().enumerate() {
                println!("{:?} {}: {}", args.region, args.start as usize + i, bit);
            }
        }
        Values::Words(words) => {
            for (i, word) in words.iter().enumerate() {
                println!(
                    "{:?} {}: {} (0x{:04X})",
                    args.region,
                    args.start as usize + i,
                    word,
                    word
                );
            }
        }
    }
    Ok(())
}

// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-closed-loop project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use anyhow::Result;
use modbus_closed_loop::config;

#[test]
fn test_config_schema_output() -> Result<()> {
    // Output goes to stdout; only check that the embedded schema parses
    config::output_config_schema()?;
    Ok(())
}

#[test]
fn test_schema_accepts_saved_defaults() -> Result<()> {
    let yaml = serde_yml::to_string(&config::Config::default())?;
    let reloaded = config::Config::from_yaml_str(&yaml)?;
    assert_eq!(reloaded, config::Config::default());
    Ok(())
}

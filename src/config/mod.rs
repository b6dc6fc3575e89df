// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-closed-loop project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Configuration management for the closed-loop Modbus harness
//!
//! This module provides functionality for loading, validating, and applying
//! configuration settings. The configuration is backed by a YAML file and
//! validated against a JSON schema before the range checks of
//! [`ConnectionOptions::validate`] run.
//!
//! ## Configuration Structure
//!
//! - `closed_loop`: Options shared by the Modbus master and slave
//!
//! ## Usage
//!
//! ```no_run
//! use modbus_closed_loop::config::Config;
//! use std::path::Path;
//!
//! // Load config from file, creates a default if not found
//! let mut config = Config::from_file(Path::new("config.yaml")).unwrap();
//!
//! // Apply command line overrides if needed
//! config.apply_args(
//!     Some("127.0.0.1".to_string()), // Address
//!     Some(5020),                     // Port
//!     None,                           // Unit id
//!     false,                          // Read-only
//! );
//!
//! println!("Slave endpoint: {}:{}", config.closed_loop.address, config.closed_loop.port);
//! ```

pub mod options;
pub mod provider;
pub mod utils;

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, error};
use serde::{Deserialize, Serialize};

pub use options::ConnectionOptions;
pub use provider::{ConfigProvider, SharedConfig};
pub use utils::output_config_schema;

/// Root configuration structure.
///
/// Deserialized from and serialized to YAML. A missing section falls back
/// to its default values, so an empty file is a valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Options of the in-process master/slave pair.
    #[serde(default)]
    pub closed_loop: ConnectionOptions,
}

impl Config {
    /// Helper method to create a sample config file when validation fails
    fn create_sample_config<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        let sample_path = path.with_extension("sample.yaml");
        debug!("Original path: {:?}, Sample path: {:?}", path, sample_path);

        if let Some(parent) = sample_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                debug!("Creating parent directory: {:?}", parent);
                fs::create_dir_all(parent).with_context(|| {
                    format!(
                        "Failed to create parent directory for sample config at {:?}",
                        parent
                    )
                })?;
            }
        }

        Self::default()
            .save_to_file(&sample_path)
            .with_context(|| format!("Failed to save sample config to {:?}", sample_path))?;

        error!(
            "Sample configuration file created at {:?}\nPlease edit and rename it",
            sample_path
        );
        Ok(())
    }

    /// Load configuration from a file
    ///
    /// A missing file is created with default values. A file that fails the
    /// schema or the range checks produces an error and a `*.sample.yaml`
    /// file next to it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(
                "Configuration file not found at {:?}, creating default",
                path
            );
            let default_config = Self::default();
            default_config.save_to_file(path)?;
            return Ok(default_config);
        }

        debug!("Loading configuration from {:?}", path);
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file at {:?}", path))?;

        Self::from_yaml_str(&contents).inspect_err(|err| {
            error!("Configuration error in {}: {:#}", path.display(), err);
            if let Err(e) = Self::create_sample_config(path) {
                error!("Failed to create sample config: {:#}", e);
            }
        })
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        // An empty document is a null value, which means "all defaults"
        let yaml_value: serde_yml::Value = match serde_yml::from_str(contents)
            .context("Failed to parse YAML configuration")?
        {
            serde_yml::Value::Null => serde_yml::Value::Mapping(Default::default()),
            value => value,
        };

        let json_value = serde_json::to_value(&yaml_value)
            .context("Failed to convert YAML to JSON for validation")?;

        let schema_str = include_str!("../../resources/config.schema.json");
        let schema: serde_json::Value =
            serde_json::from_str(schema_str).context("Failed to parse JSON schema")?;

        let validator = jsonschema::draft202012::options()
            .should_validate_formats(true)
            .build(&schema)?;

        debug!("Validating configuration against schema");
        if let Err(error) = validator.validate(&json_value) {
            anyhow::bail!("Configuration validation failed: {}", error);
        }

        debug!("Schema validation passed, deserializing into Config structure");
        let config: Config = serde_yml::from_value(yaml_value)
            .context("Failed to deserialize configuration")?;

        utils::validate_specific_rules(&config)?;

        Ok(config)
    }

    /// Save the configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml =
            serde_yml::to_string(self).context("Failed to serialize configuration to YAML")?;

        let mut file = File::create(path.as_ref())
            .with_context(|| format!("Failed to create config file at {:?}", path.as_ref()))?;

        file.write_all(yaml.as_bytes())
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Apply command line arguments to override configuration values.
    ///
    /// Only values explicitly provided override the existing configuration.
    /// `read_only` can only switch the flag on.
    pub fn apply_args(
        &mut self,
        address: Option<String>,
        port: Option<u16>,
        unit_id: Option<u8>,
        read_only: bool,
    ) {
        if let Some(address) = address {
            debug!("Overriding address from command line: {}", address);
            self.closed_loop.address = address;
        }
        if let Some(port) = port {
            debug!("Overriding port from command line: {}", port);
            self.closed_loop.port = port;
        }
        if let Some(unit_id) = unit_id {
            debug!("Overriding unit id from command line: {}", unit_id);
            self.closed_loop.unit_id = unit_id;
        }
        if read_only {
            debug!("Enabling read-only slave from command line");
            self.closed_loop.read_only = true;
        }
    }
}

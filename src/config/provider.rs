// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-closed-loop project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Configuration read access and change notification
//!
//! The closed-loop services never read configuration files themselves. They
//! consume a [`ConfigProvider`]: a read accessor for the current options and
//! a broadcast channel that delivers a fresh copy whenever the options are
//! updated. [`SharedConfig`] is the in-process implementation used by the
//! runner binary and the tests.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use log::debug;
use tokio::sync::broadcast;

use super::{Config, ConnectionOptions};

/// Depth of the change notification channel
const CHANGE_CHANNEL_CAPACITY: usize = 16;

/// Source of closed-loop configuration
#[cfg_attr(test, mockall::automock)]
pub trait ConfigProvider: Send + Sync {
    /// Snapshot of the options currently in effect at the provider
    fn current(&self) -> ConnectionOptions;

    /// Receiver for options published after this call
    fn subscribe(&self) -> broadcast::Receiver<ConnectionOptions>;
}

/// Shared, updatable configuration with change notifications.
///
/// Cloning a `SharedConfig` yields another handle on the same options and
/// the same notification channel.
#[derive(Clone)]
pub struct SharedConfig {
    options: Arc<RwLock<ConnectionOptions>>,
    changes: broadcast::Sender<ConnectionOptions>,
    path: Option<PathBuf>,
}

impl SharedConfig {
    pub fn new(options: ConnectionOptions) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            options: Arc::new(RwLock::new(options)),
            changes,
            path: None,
        }
    }

    /// Provider backed by a YAML configuration file
    ///
    /// [`SharedConfig::update_and_persist`] writes back to `path`.
    pub fn with_file(config: Config, path: impl Into<PathBuf>) -> Self {
        let mut shared = Self::new(config.closed_loop);
        shared.path = Some(path.into());
        shared
    }

    /// Replace the current options and notify subscribers.
    ///
    /// Returns the number of subscribers that received the change. The
    /// options are not validated here; consumers validate on receipt.
    pub fn update(&self, options: ConnectionOptions) -> usize {
        {
            let mut current = self
                .options
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *current = options.clone();
        }
        match self.changes.send(options) {
            Ok(receivers) => {
                debug!("Configuration change delivered to {} subscriber(s)", receivers);
                receivers
            }
            Err(_) => {
                debug!("Configuration changed with no subscriber");
                0
            }
        }
    }

    /// Save the options to the backing file, then publish them
    pub fn update_and_persist(&self, options: ConnectionOptions) -> Result<usize> {
        let path = self
            .path
            .as_ref()
            .context("Shared configuration has no backing file")?;
        let config = Config {
            closed_loop: options.clone(),
        };
        config
            .save_to_file(path)
            .with_context(|| format!("Failed to persist configuration to {:?}", path))?;
        Ok(self.update(options))
    }
}

impl ConfigProvider for SharedConfig {
    fn current(&self) -> ConnectionOptions {
        self.options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionOptions> {
        self.changes.subscribe()
    }
}

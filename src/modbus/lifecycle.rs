// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-closed-loop project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Reconfiguration of a running closed loop
//!
//! The [`LifecycleController`] owns a background task subscribed to the
//! configuration provider. Change notifications are only messages: the
//! stop/start cycle they trigger runs on the controller task, never on the
//! publisher's side, so publishing a change never waits on the slave's
//! operation mutex.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::master::ModbusMaster;
use super::slave::ModbusSlave;
use crate::config::{ConfigProvider, ConnectionOptions};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// What the controller did with the last configuration change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReconfigureOutcome {
    /// No change processed yet
    Idle,
    /// Same options as the ones in effect
    Unchanged,
    /// Invalid options, previous ones kept
    Rejected,
    /// Stored for the next start, the slave was not running
    Applied,
    /// Running slave stopped and started again with the new options
    Restarted,
    /// Restart failed, the slave is faulted
    Faulted,
}

pub struct LifecycleController {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
    outcome: watch::Receiver<ReconfigureOutcome>,
}

impl LifecycleController {
    /// Subscribe to `provider` and start the controller task.
    ///
    /// The subscription is taken before this returns, so no change published
    /// afterwards is missed.
    pub fn spawn(
        provider: Arc<dyn ConfigProvider>,
        master: Arc<ModbusMaster>,
        slave: ModbusSlave,
    ) -> Self {
        let token = CancellationToken::new();
        let (outcome_tx, outcome) = watch::channel(ReconfigureOutcome::Idle);
        let changes = provider.subscribe();

        let task = tokio::spawn(run(
            provider,
            changes,
            master,
            slave,
            outcome_tx,
            token.clone(),
        ));

        Self {
            token,
            task: Some(task),
            outcome,
        }
    }

    pub fn last_outcome(&self) -> ReconfigureOutcome {
        *self.outcome.borrow()
    }

    /// Receiver notified after every processed change
    pub fn subscribe_outcomes(&self) -> watch::Receiver<ReconfigureOutcome> {
        self.outcome.clone()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Cancel the controller task and wait for it.
    ///
    /// A reconfiguration in progress is allowed to finish.
    pub async fn shutdown(&mut self) {
        self.token.cancel();
        let Some(mut task) = self.task.take() else {
            return;
        };
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await {
            Ok(Ok(())) => debug!("Lifecycle controller stopped"),
            Ok(Err(e)) => error!("Lifecycle controller task failed: {}", e),
            Err(_) => {
                warn!("Lifecycle controller did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run(
    provider: Arc<dyn ConfigProvider>,
    mut changes: broadcast::Receiver<ConnectionOptions>,
    master: Arc<ModbusMaster>,
    slave: ModbusSlave,
    outcome: watch::Sender<ReconfigureOutcome>,
    token: CancellationToken,
) {
    info!("Lifecycle controller started");
    loop {
        let options = tokio::select! {
            _ = token.cancelled() => break,
            received = changes.recv() => match received {
                Ok(options) => options,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Missed {} configuration change(s), using the provider's current options",
                        skipped
                    );
                    provider.current()
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Configuration provider closed, lifecycle controller exiting");
                    break;
                }
            },
        };

        let result = reconfigure(&master, &slave, options).await;
        outcome.send_replace(result);
    }
    info!("Lifecycle controller stopped");
}

async fn reconfigure(
    master: &ModbusMaster,
    slave: &ModbusSlave,
    options: ConnectionOptions,
) -> ReconfigureOutcome {
    if let Err(e) = options.validate() {
        warn!("Ignoring configuration change: {}", e);
        return ReconfigureOutcome::Rejected;
    }

    let previous = slave.options();
    if previous == options && master.options() == options {
        debug!("Configuration change carries the options already in effect");
        return ReconfigureOutcome::Unchanged;
    }

    let slave_running = slave.is_running();
    let master_connected = master.is_connected();
    // A restart drops every client session, so a connected master has to
    // reopen its own even when the endpoint stays the same
    let reconnect = master_connected && (slave_running || !previous.same_endpoint(&options));

    if reconnect {
        master.disconnect().await;
    }

    // Already validated, both components apply the same rules
    if let Err(e) = master.apply_options(options.clone()) {
        error!("Master rejected validated options: {}", e);
        return ReconfigureOutcome::Rejected;
    }
    if let Err(e) = slave.apply_options(options) {
        error!("Slave rejected validated options: {}", e);
        return ReconfigureOutcome::Rejected;
    }

    let outcome = if slave_running {
        info!("Configuration changed while running, restarting Modbus slave");
        match slave.restart().await {
            Ok(()) => ReconfigureOutcome::Restarted,
            Err(e) => {
                error!("Modbus slave restart failed: {}", e);
                slave.mark_faulted().await;
                ReconfigureOutcome::Faulted
            }
        }
    } else {
        info!("Configuration updated, effective at the next start");
        ReconfigureOutcome::Applied
    };

    if reconnect && outcome != ReconfigureOutcome::Faulted {
        if let Err(e) = master.connect().await {
            warn!("Modbus master could not reconnect after reconfiguration: {}", e);
        }
    }

    outcome
}

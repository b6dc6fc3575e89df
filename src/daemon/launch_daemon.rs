// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-closed-loop project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ConfigProvider, ConnectionOptions, SharedConfig};
use crate::modbus::{LifecycleController, ModbusMaster, ModbusSlave, StatusEvent, StatusNotifier};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Runs the closed loop and its background tasks until shut down
pub struct Daemon {
    tasks: Vec<JoinHandle<Result<()>>>,
    token: CancellationToken,
    status: StatusNotifier,
    slave: Option<ModbusSlave>,
    master: Option<Arc<ModbusMaster>>,
    controller: Option<LifecycleController>,
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

impl Daemon {
    /// Create a new daemon instance
    pub fn new() -> Self {
        Daemon {
            tasks: Vec::new(),
            token: CancellationToken::new(),
            status: StatusNotifier::new(),
            slave: None,
            master: None,
            controller: None,
        }
    }

    pub fn slave(&self) -> Option<&ModbusSlave> {
        self.slave.as_ref()
    }

    pub fn master(&self) -> Option<&Arc<ModbusMaster>> {
        self.master.as_ref()
    }

    pub fn status(&self) -> &StatusNotifier {
        &self.status
    }

    /// Start the slave, connect the master and launch the background tasks.
    ///
    /// When `config_path` is set, the file is polled every `poll_interval`
    /// and valid changes are pushed into `shared`.
    pub async fn launch(
        &mut self,
        shared: SharedConfig,
        config_path: Option<PathBuf>,
        poll_interval: Duration,
    ) -> Result<()> {
        let options = shared.current();

        self.start_status_logger();

        let slave = ModbusSlave::new(options.clone(), self.status.clone());
        if let Err(e) = slave.start().await {
            self.token.cancel();
            return Err(e).context("Failed to start the Modbus slave");
        }
        self.slave = Some(slave.clone());

        let master = Arc::new(ModbusMaster::new(options, self.status.clone()));
        if let Err(e) = master.connect().await {
            slave.stop().await;
            self.token.cancel();
            return Err(e).context("Failed to connect the Modbus master");
        }
        self.master = Some(master.clone());

        self.controller = Some(LifecycleController::spawn(
            Arc::new(shared.clone()),
            master,
            slave,
        ));

        if let Some(path) = config_path {
            self.start_config_watcher(shared, path, poll_interval);
        }

        self.start_heartbeat();
        Ok(())
    }

    /// Log every status event
    fn start_status_logger(&mut self) {
        let mut events = self.status.subscribe();
        let token = self.token.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(StatusEvent::ServiceRunning(running)) => {
                            info!("Modbus slave running: {}", running)
                        }
                        Ok(StatusEvent::MasterConnected(connected)) => {
                            info!("Modbus master connected: {}", connected)
                        }
                        Ok(StatusEvent::Client(client)) => debug!(
                            "Client {} {} ({})",
                            client.client_id,
                            if client.connected { "connected" } else { "disconnected" },
                            client.peer
                        ),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Status logger skipped {} event(s)", n)
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            Ok(())
        });
        self.tasks.push(task);
    }

    /// Poll the configuration file and publish valid changes
    fn start_config_watcher(&mut self, shared: SharedConfig, path: PathBuf, interval: Duration) {
        info!(
            "Watching {:?} for configuration changes every {:?}",
            path, interval
        );

        let token = self.token.clone();
        let task = tokio::spawn(async move {
            let mut last_seen = shared.current();
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match read_options(&path) {
                    Ok(options) if options != last_seen => {
                        info!("Configuration file {:?} changed", path);
                        shared.update(options.clone());
                        last_seen = options;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Ignoring unreadable configuration file: {:#}", e),
                }
            }
            Ok(())
        });
        self.tasks.push(task);
    }

    /// Start a heartbeat task that logs the slave diagnostics periodically
    fn start_heartbeat(&mut self) {
        debug!("Starting heartbeat monitor");

        let token = self.token.clone();
        let slave = self.slave.clone();
        let master = self.master.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = time::sleep(HEARTBEAT_INTERVAL) => {}
                }
                if let Some(slave) = &slave {
                    debug!(
                        "Daemon heartbeat: slave {}, {:?}",
                        slave.state(),
                        slave.diagnostics()
                    );
                }
                if let Some(master) = &master {
                    debug!(
                        "Daemon heartbeat: master {:?}, {:?}",
                        master.state(),
                        master.statistics()
                    );
                }
            }
            Ok(())
        });
        self.tasks.push(task);
    }

    /// Stop the background tasks, then the master, then the slave
    pub async fn shutdown(&mut self) {
        info!("Shutting down daemon tasks");
        self.token.cancel();
        if let Some(mut controller) = self.controller.take() {
            controller.shutdown().await;
        }
        if let Some(master) = &self.master {
            master.disconnect().await;
        }
        if let Some(slave) = &self.slave {
            slave.stop().await;
        }
    }

    /// Wait for all tasks to complete
    pub async fn join(self) -> Result<()> {
        for task in self.tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Task failed: {:#}", e),
                Err(e) => error!("Task panicked: {}", e),
            }
        }
        Ok(())
    }
}

/// Closed-loop options of the configuration file, validated
fn read_options(path: &Path) -> Result<ConnectionOptions> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {:?}", path))?;
    let config = Config::from_yaml_str(&contents)?;
    Ok(config.closed_loop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::ServiceState;
    use tempfile::tempdir;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_launch_and_shutdown() {
        let options = ConnectionOptions {
            port: free_port(),
            ..ConnectionOptions::default()
        };
        let mut daemon = Daemon::new();
        daemon
            .launch(SharedConfig::new(options), None, Duration::from_millis(50))
            .await
            .unwrap();

        let master = daemon.master().unwrap().clone();
        master.write_single_register(3, 99).await.unwrap();
        assert_eq!(master.read_holding_registers(3, 1).await.unwrap(), vec![99]);

        daemon.shutdown().await;
        assert_eq!(daemon.slave().unwrap().state(), ServiceState::Stopped);
        assert!(!master.is_connected());
        daemon.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_launch_stops_started_tasks() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let options = ConnectionOptions {
            port: occupied.local_addr().unwrap().port(),
            ..ConnectionOptions::default()
        };
        let mut daemon = Daemon::new();
        let err = daemon
            .launch(SharedConfig::new(options), None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to start the Modbus slave"));
        assert!(daemon.slave().is_none());
        assert!(daemon.master().is_none());

        // The status logger was already running and must end on its own
        let joined = time::timeout(Duration::from_secs(5), daemon.join()).await;
        assert!(joined.is_ok(), "daemon tasks still running after a failed launch");
        drop(occupied);
    }

    #[tokio::test]
    async fn test_file_change_restarts_slave() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut config = Config::default();
        config.closed_loop.port = free_port();
        config.save_to_file(&path).unwrap();

        let shared = SharedConfig::with_file(config.clone(), &path);
        let mut daemon = Daemon::new();
        daemon
            .launch(shared, Some(path.clone()), Duration::from_millis(20))
            .await
            .unwrap();

        let new_port = free_port();
        config.closed_loop.port = new_port;
        config.save_to_file(&path).unwrap();

        let slave = daemon.slave().unwrap().clone();
        let deadline = time::Instant::now() + Duration::from_secs(10);
        loop {
            if slave.local_addr().await.map(|a| a.port()) == Some(new_port) {
                break;
            }
            assert!(time::Instant::now() < deadline, "slave never moved to the new port");
            time::sleep(Duration::from_millis(20)).await;
        }

        // The master followed the slave to its new endpoint
        let master = daemon.master().unwrap().clone();
        let connected = time::timeout(Duration::from_secs(5), async {
            while !master.is_connected() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(connected.is_ok());
        assert_eq!(master.read_coils(0, 4).await.unwrap(), vec![false; 4]);

        daemon.shutdown().await;
        daemon.join().await.unwrap();
    }
}

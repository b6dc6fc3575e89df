// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-closed-loop project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! # Modbus slave server
//!
//! [`ModbusSlave`] owns the TCP listener, the protocol session bound to the
//! configured unit identifier, and the [`DataStore`]. The accept/serve loop
//! runs as a background task; start, stop, restart and data-store resets are
//! serialized by one operation mutex that is only held while the server is
//! being set up or torn down.
//!
//! ## State machine
//!
//! ```text
//! Stopped -> Starting -> Running -> Stopping -> Stopped
//! Starting -> Stopped                       (start failed, rolled back)
//! Running -> Stopping -> Starting -> Running (restart)
//! any -> Faulted                            (restart failed)
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use modbus_closed_loop::config::ConnectionOptions;
//! use modbus_closed_loop::modbus::{ModbusSlave, StatusNotifier};
//!
//! async fn example() -> Result<(), modbus_closed_loop::ModbusError> {
//!     let slave = ModbusSlave::new(ConnectionOptions::default(), StatusNotifier::new());
//!     slave.start().await?;
//!     slave.write_holding_registers(0, &[1, 2, 3])?;
//!     slave.stop().await;
//!     Ok(())
//! }
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_modbus::server::tcp::{accept_tcp_connection, Server};
use tokio_util::sync::CancellationToken;

use super::connection::{ConnectionTracker, TrackedStream};
use super::data_store::DataStore;
use super::modbus_server::{ClosedLoopService, Diagnostics, DiagnosticsSnapshot};
use super::status::{StatusEvent, StatusNotifier};
use crate::config::ConnectionOptions;
use crate::error::ModbusError;

/// Bound on waiting for the accept loop to stop
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on waiting for the accept loop to report it is serving
const STARTUP_TIMEOUT: Duration = Duration::from_secs(1);
/// Bound on waiting for accepted connections to close after cancellation
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const LISTEN_BACKLOG: u32 = 128;

/// Lifecycle state of a slave instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Faulted,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Resources of one start/stop cycle
struct ServerRuntime {
    generation: u64,
    token: CancellationToken,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

struct SlaveInner {
    options: RwLock<ConnectionOptions>,
    /// Operation mutex; `Some` while a server runtime exists
    runtime: Mutex<Option<ServerRuntime>>,
    state: watch::Sender<ServiceState>,
    store: RwLock<Option<Arc<DataStore>>>,
    active_connections: Arc<AtomicUsize>,
    next_client_id: Arc<AtomicU64>,
    generation: AtomicU64,
    diagnostics: Arc<Diagnostics>,
    status: StatusNotifier,
}

/// Closed-loop Modbus TCP slave.
///
/// Cloning yields another handle on the same server.
#[derive(Clone)]
pub struct ModbusSlave {
    inner: Arc<SlaveInner>,
}

impl ModbusSlave {
    /// Create a stopped slave. Options are validated on [`ModbusSlave::start`].
    pub fn new(options: ConnectionOptions, status: StatusNotifier) -> Self {
        let (state, _) = watch::channel(ServiceState::Stopped);
        Self {
            inner: Arc::new(SlaveInner {
                options: RwLock::new(options),
                runtime: Mutex::new(None),
                state,
                store: RwLock::new(None),
                active_connections: Arc::new(AtomicUsize::new(0)),
                next_client_id: Arc::new(AtomicU64::new(0)),
                generation: AtomicU64::new(0),
                diagnostics: Arc::new(Diagnostics::default()),
                status,
            }),
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.inner.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    pub fn options(&self) -> ConnectionOptions {
        self.inner
            .options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the options used by the next start.
    ///
    /// Invalid options are rejected and the previous ones stay in effect.
    pub fn apply_options(&self, options: ConnectionOptions) -> Result<(), ModbusError> {
        options.validate()?;
        let mut current = self
            .inner
            .options
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *current = options;
        Ok(())
    }

    pub fn status(&self) -> &StatusNotifier {
        &self.inner.status
    }

    /// Address the listener is bound to while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .runtime
            .lock()
            .await
            .as_ref()
            .map(|runtime| runtime.local_addr)
    }

    /// Number of client connections currently open
    pub fn connection_count(&self) -> usize {
        self.inner.active_connections.load(Ordering::SeqCst)
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.inner.diagnostics.snapshot(self.connection_count())
    }

    /// Start serving.
    ///
    /// No-op when already running. On failure every resource acquired so far
    /// is released before the error is returned, and the state is `Stopped`.
    pub async fn start(&self) -> Result<(), ModbusError> {
        let mut runtime = self.inner.runtime.lock().await;
        self.start_locked(&mut runtime).await
    }

    /// Stop serving. No-op when nothing is running.
    pub async fn stop(&self) {
        let mut runtime = self.inner.runtime.lock().await;
        self.stop_locked(&mut runtime).await;
    }

    /// Stop then start under a single hold of the operation mutex
    pub async fn restart(&self) -> Result<(), ModbusError> {
        let mut runtime = self.inner.runtime.lock().await;
        if let Some(current) = runtime.take() {
            info!("Restarting Modbus slave");
            self.set_state(ServiceState::Stopping);
            self.teardown(current).await;
            self.inner.diagnostics.record_stop();
            self.inner.status.publish(StatusEvent::ServiceRunning(false));
        }
        self.start_locked(&mut runtime).await
    }

    /// Mark the service as faulted after a failed reconfiguration
    pub async fn mark_faulted(&self) {
        let mut runtime = self.inner.runtime.lock().await;
        if let Some(current) = runtime.take() {
            self.teardown(current).await;
        }
        error!("Modbus slave marked as faulted");
        self.set_state(ServiceState::Faulted);
        self.inner.status.publish(StatusEvent::ServiceRunning(false));
    }

    /// Replace the data store with a zero-filled one.
    ///
    /// Only allowed while no server is running; live data goes through the
    /// per-region write path instead.
    pub async fn reset_data_store(&self) -> Result<(), ModbusError> {
        let runtime = self.inner.runtime.lock().await;
        let state = self.state();
        if runtime.is_some() || !matches!(state, ServiceState::Stopped | ServiceState::Faulted) {
            return Err(ModbusError::invalid_operation(format!(
                "cannot reset the data store while the slave is {}",
                state
            )));
        }
        let options = self.options();
        self.replace_store(Some(Arc::new(DataStore::new(&options))));
        info!("Modbus slave data store reset");
        Ok(())
    }

    fn set_state(&self, state: ServiceState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!("Modbus slave state {} -> {}", previous, state);
        }
    }

    fn replace_store(&self, store: Option<Arc<DataStore>>) {
        let mut current = self
            .inner
            .store
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *current = store;
    }

    async fn start_locked(&self, runtime: &mut Option<ServerRuntime>) -> Result<(), ModbusError> {
        if runtime.is_some() && self.state() == ServiceState::Running {
            debug!("Modbus slave already running");
            return Ok(());
        }

        let options = self.options();
        options.validate()?;

        // Leftovers of a run that did not end cleanly
        if let Some(stale) = runtime.take() {
            self.teardown(stale).await;
        }

        self.set_state(ServiceState::Starting);
        info!(
            "Starting Modbus slave on {}:{} (unit {})",
            options.address, options.port, options.unit_id
        );

        match self.launch(&options).await {
            Ok(started) => {
                info!("Modbus slave listening on {}", started.local_addr);
                *runtime = Some(started);
                self.inner.diagnostics.record_start();
                self.set_state(ServiceState::Running);
                self.inner.status.publish(StatusEvent::ServiceRunning(true));
                Ok(())
            }
            Err(err) => {
                error!("Failed to start Modbus slave: {}", err);
                self.set_state(ServiceState::Stopped);
                Err(err)
            }
        }
    }

    async fn stop_locked(&self, runtime: &mut Option<ServerRuntime>) {
        let Some(current) = runtime.take() else {
            debug!("Modbus slave not running, nothing to stop");
            return;
        };

        info!("Stopping Modbus slave on {}", current.local_addr);
        self.set_state(ServiceState::Stopping);
        self.teardown(current).await;
        self.inner.diagnostics.record_stop();
        self.set_state(ServiceState::Stopped);
        self.inner.status.publish(StatusEvent::ServiceRunning(false));
    }

    /// Acquire every resource of a run, rolling back on the first failure
    async fn launch(&self, options: &ConnectionOptions) -> Result<ServerRuntime, ModbusError> {
        let socket_addr = options.socket_addr()?;

        // (1) Fresh zero-filled data store
        let store = Arc::new(DataStore::new(options));
        self.replace_store(Some(store.clone()));

        // (2) Protocol session bound to the unit identifier
        let service = ClosedLoopService::new(
            options.unit_id,
            options.read_only,
            store,
            self.inner.diagnostics.clone(),
        );

        // (3) Listener with address reuse
        let listener = match bind_listener(socket_addr) {
            Ok(listener) => listener,
            Err(err) => {
                self.replace_store(None);
                return Err(err);
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(source) => {
                self.replace_store(None);
                return Err(ModbusError::Io { source });
            }
        };

        // (4) Session attached to the listener
        let server = Server::new(listener);
        let tracker = ConnectionTracker::new(
            self.inner.active_connections.clone(),
            self.inner.next_client_id.clone(),
            options.max_connections as usize,
            self.inner.status.clone(),
            self.inner.diagnostics.clone(),
        );

        // (5) Background accept loop with its own cancellation token
        let token = CancellationToken::new();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(serve(
            server,
            service,
            tracker,
            token.clone(),
            ready_tx,
            Arc::downgrade(&self.inner),
            generation,
        ));

        let runtime = ServerRuntime {
            generation,
            token,
            task,
            local_addr,
        };

        match time::timeout(STARTUP_TIMEOUT, ready_rx).await {
            Ok(Ok(())) => Ok(runtime),
            _ => {
                self.teardown(runtime).await;
                Err(ModbusError::invalid_operation(
                    "Modbus accept loop did not start",
                ))
            }
        }
    }

    /// Cancel the run, wait for the accept loop and the accepted
    /// connections, then drop the data store
    async fn teardown(&self, runtime: ServerRuntime) {
        let ServerRuntime {
            generation,
            token,
            mut task,
            ..
        } = runtime;

        token.cancel();

        match time::timeout(SHUTDOWN_TIMEOUT, &mut task).await {
            Ok(Ok(())) => debug!("Accept loop {} finished", generation),
            Ok(Err(e)) => error!("Accept loop {} panicked: {}", generation, e),
            Err(_) => {
                warn!(
                    "Accept loop {} did not stop within {:?}, aborting it",
                    generation, SHUTDOWN_TIMEOUT
                );
                task.abort();
            }
        }

        let deadline = time::Instant::now() + DRAIN_TIMEOUT;
        while self.connection_count() > 0 && time::Instant::now() < deadline {
            time::sleep(Duration::from_millis(10)).await;
        }
        if self.connection_count() > 0 {
            warn!(
                "{} client connection(s) still open after shutdown",
                self.connection_count()
            );
        }

        self.replace_store(None);
    }

    /// Self-stop requested by the accept loop of `generation`
    async fn stop_after_failure(&self, generation: u64) {
        let mut runtime = self.inner.runtime.lock().await;
        let current = runtime.as_ref().map(|runtime| runtime.generation);
        if current != Some(generation) || self.state() != ServiceState::Running {
            debug!(
                "Ignoring stop request from stale accept loop {}",
                generation
            );
            return;
        }
        warn!("Stopping Modbus slave after accept loop failure");
        self.stop_locked(&mut runtime).await;
    }

    fn store(&self) -> Result<Arc<DataStore>, ModbusError> {
        self.inner
            .store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                ModbusError::invalid_operation(format!(
                    "no data store while the slave is {}",
                    self.state()
                ))
            })
    }

    pub fn read_coils(&self, address: u16, count: u16) -> Result<Vec<bool>, ModbusError> {
        self.store()?
            .coils
            .read(address, count)
            .map_err(ModbusError::Protocol)
    }

    pub fn write_coils(&self, address: u16, values: &[bool]) -> Result<(), ModbusError> {
        self.store()?
            .coils
            .write(address, values)
            .map_err(ModbusError::Protocol)
    }

    pub fn fill_coils(&self, value: bool) -> Result<(), ModbusError> {
        self.store()?.coils.fill(value);
        Ok(())
    }

    pub fn read_discrete_inputs(&self, address: u16, count: u16) -> Result<Vec<bool>, ModbusError> {
        self.store()?
            .discrete_inputs
            .read(address, count)
            .map_err(ModbusError::Protocol)
    }

    /// Set discrete inputs; the wire only reads them
    pub fn write_discrete_inputs(&self, address: u16, values: &[bool]) -> Result<(), ModbusError> {
        self.store()?
            .discrete_inputs
            .write(address, values)
            .map_err(ModbusError::Protocol)
    }

    pub fn read_holding_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, ModbusError> {
        self.store()?
            .holding_registers
            .read(address, count)
            .map_err(ModbusError::Protocol)
    }

    pub fn write_holding_registers(&self, address: u16, values: &[u16]) -> Result<(), ModbusError> {
        self.store()?
            .holding_registers
            .write(address, values)
            .map_err(ModbusError::Protocol)
    }

    pub fn fill_holding_registers(&self, value: u16) -> Result<(), ModbusError> {
        self.store()?.holding_registers.fill(value);
        Ok(())
    }

    pub fn read_input_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, ModbusError> {
        self.store()?
            .input_registers
            .read(address, count)
            .map_err(ModbusError::Protocol)
    }

    /// Set input registers; the wire only reads them
    pub fn write_input_registers(&self, address: u16, values: &[u16]) -> Result<(), ModbusError> {
        self.store()?
            .input_registers
            .write(address, values)
            .map_err(ModbusError::Protocol)
    }
}

fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ModbusError> {
    let bind_error = |source: io::Error| ModbusError::Bind {
        address: addr.to_string(),
        source,
    };

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_error)?;
    socket.set_reuseaddr(true).map_err(bind_error)?;
    socket.bind(addr).map_err(bind_error)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_error)
}

/// Accept/serve loop of one run.
///
/// Cancellation ends the loop silently. Any other termination while the
/// slave is running schedules a stop of that same run.
async fn serve(
    server: Server,
    service: ClosedLoopService,
    tracker: ConnectionTracker,
    token: CancellationToken,
    ready: oneshot::Sender<()>,
    slave: Weak<SlaveInner>,
    generation: u64,
) {
    let connection_token = token.clone();
    let on_connected = move |stream: TcpStream, socket_addr: SocketAddr| {
        let service = service.clone();
        let tracker = tracker.clone();
        let token = connection_token.clone();
        async move {
            let Some(guard) = tracker.admit(socket_addr) else {
                // Dropping the stream closes the refused connection
                return Ok(None);
            };
            accept_tcp_connection(stream, socket_addr, move |_socket_addr| {
                Ok(Some(service.clone()))
            })
            .map(|accepted| {
                accepted.map(|(service, stream)| (service, TrackedStream::new(stream, token, guard)))
            })
        }
    };

    let on_process_error = |err| {
        error!("Modbus slave connection error: {err}");
    };

    if ready.send(()).is_err() {
        debug!("Accept loop {} abandoned before start", generation);
        return;
    }

    let outcome = tokio::select! {
        _ = token.cancelled() => None,
        result = server.serve(&on_connected, on_process_error) => Some(result),
    };

    match outcome {
        None => debug!("Accept loop {} cancelled", generation),
        Some(result) => {
            match result {
                Ok(()) => warn!("Accept loop {} ended unexpectedly", generation),
                Err(e) => error!("Accept loop {} failed: {}", generation, e),
            }
            if let Some(inner) = slave.upgrade() {
                let slave = ModbusSlave { inner };
                tokio::spawn(async move {
                    slave.stop_after_failure(generation).await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn options(port: u16) -> ConnectionOptions {
        ConnectionOptions {
            port,
            max_coils: 16,
            max_discrete_inputs: 16,
            max_holding_registers: 16,
            max_input_registers: 16,
            ..ConnectionOptions::default()
        }
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let slave = ModbusSlave::new(options(free_port()), StatusNotifier::new());
        assert_eq!(slave.state(), ServiceState::Stopped);

        slave.start().await.unwrap();
        assert_eq!(slave.state(), ServiceState::Running);
        assert!(slave.local_addr().await.is_some());
        assert_eq!(slave.read_holding_registers(0, 16).unwrap(), vec![0; 16]);

        slave.stop().await;
        assert_eq!(slave.state(), ServiceState::Stopped);
        assert!(slave.local_addr().await.is_none());
        assert!(matches!(
            slave.read_holding_registers(0, 1),
            Err(ModbusError::InvalidOperation { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let slave = ModbusSlave::new(options(free_port()), StatusNotifier::new());
        slave.start().await.unwrap();
        slave.write_holding_registers(3, &[99]).unwrap();
        let addr = slave.local_addr().await;

        slave.start().await.unwrap();
        assert_eq!(slave.state(), ServiceState::Running);
        assert_eq!(slave.local_addr().await, addr);
        // Same store, data preserved
        assert_eq!(slave.read_holding_registers(3, 1).unwrap(), vec![99]);
        assert_eq!(slave.diagnostics().starts, 1);

        slave.stop().await;
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let slave = ModbusSlave::new(options(free_port()), StatusNotifier::new());
        slave.stop().await;
        slave.stop().await;
        assert_eq!(slave.state(), ServiceState::Stopped);
        assert_eq!(slave.diagnostics().stops, 0);
    }

    #[tokio::test]
    async fn test_invalid_options_fail_before_binding() {
        let mut bad = options(free_port());
        bad.address = "not-an-ip".to_string();
        let slave = ModbusSlave::new(bad, StatusNotifier::new());

        let err = slave.start().await.unwrap_err();
        assert!(matches!(err, ModbusError::InvalidConfiguration { .. }));
        assert_eq!(slave.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_bind_failure_rolls_back() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let slave = ModbusSlave::new(options(port), StatusNotifier::new());
        let err = slave.start().await.unwrap_err();
        assert!(matches!(err, ModbusError::Bind { .. }));
        assert_eq!(slave.state(), ServiceState::Stopped);
        assert!(slave.local_addr().await.is_none());
        assert!(slave.read_coils(0, 1).is_err());

        // Once the port is free the same instance starts
        drop(occupied);
        slave.start().await.unwrap();
        assert!(slave.is_running());
        slave.stop().await;
    }

    #[tokio::test]
    async fn test_reset_rejected_while_running() {
        let slave = ModbusSlave::new(options(free_port()), StatusNotifier::new());
        slave.start().await.unwrap();
        slave.write_coils(0, &[true]).unwrap();

        let err = slave.reset_data_store().await.unwrap_err();
        assert!(matches!(err, ModbusError::InvalidOperation { .. }));
        assert_eq!(slave.read_coils(0, 1).unwrap(), vec![true]);

        slave.stop().await;
        slave.reset_data_store().await.unwrap();
        assert_eq!(slave.read_coils(0, 1).unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn test_restart_applies_new_options() {
        let status = StatusNotifier::new();
        let slave = ModbusSlave::new(options(free_port()), status.clone());
        slave.start().await.unwrap();

        let new_port = free_port();
        let mut updated = options(new_port);
        updated.max_holding_registers = 4;
        slave.apply_options(updated).unwrap();

        let mut events = status.subscribe();
        slave.restart().await.unwrap();

        assert_eq!(events.recv().await.unwrap(), StatusEvent::ServiceRunning(false));
        assert_eq!(events.recv().await.unwrap(), StatusEvent::ServiceRunning(true));
        assert_eq!(slave.local_addr().await.unwrap().port(), new_port);
        assert!(slave.read_holding_registers(3, 1).is_ok());
        assert!(slave.read_holding_registers(4, 1).is_err());

        let diagnostics = slave.diagnostics();
        assert_eq!(diagnostics.starts, 2);
        assert_eq!(diagnostics.stops, 1);
        slave.stop().await;
    }

    #[tokio::test]
    async fn test_apply_invalid_options_keeps_previous() {
        let slave = ModbusSlave::new(options(1502), StatusNotifier::new());
        let mut bad = options(1503);
        bad.unit_id = 0;
        assert!(slave.apply_options(bad).is_err());
        assert_eq!(slave.options().port, 1502);
    }

    #[tokio::test]
    async fn test_mark_faulted_then_start() {
        let slave = ModbusSlave::new(options(free_port()), StatusNotifier::new());
        slave.mark_faulted().await;
        assert_eq!(slave.state(), ServiceState::Faulted);

        slave.start().await.unwrap();
        assert_eq!(slave.state(), ServiceState::Running);
        slave.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_client_connections() {
        let slave = ModbusSlave::new(options(free_port()), StatusNotifier::new());
        slave.start().await.unwrap();
        let addr = slave.local_addr().await.unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let deadline = time::Instant::now() + Duration::from_secs(2);
        while slave.connection_count() == 0 && time::Instant::now() < deadline {
            time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(slave.connection_count(), 1);

        slave.stop().await;
        assert_eq!(slave.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_accept_loop_stops_only_its_own_run() {
        let status = StatusNotifier::new();
        let mut events = status.subscribe();
        let slave = ModbusSlave::new(options(free_port()), status);
        slave.start().await.unwrap();
        let addr = slave.local_addr().await.unwrap();
        let mut states = slave.subscribe_state();
        assert_eq!(*states.borrow_and_update(), ServiceState::Running);
        assert!(matches!(
            events.try_recv(),
            Ok(StatusEvent::ServiceRunning(true))
        ));

        let generation = slave.inner.generation.load(Ordering::SeqCst);
        slave.stop_after_failure(generation - 1).await;
        assert_eq!(slave.state(), ServiceState::Running);
        assert!(!states.has_changed().unwrap());
        assert_eq!(slave.local_addr().await, Some(addr));

        slave.stop_after_failure(generation).await;
        assert_eq!(slave.state(), ServiceState::Stopped);
        assert_eq!(*states.borrow_and_update(), ServiceState::Stopped);
        assert!(matches!(
            events.try_recv(),
            Ok(StatusEvent::ServiceRunning(false))
        ));
        assert_eq!(slave.diagnostics().stops, 1);
        assert!(slave.local_addr().await.is_none());
        // Port released
        drop(std::net::TcpListener::bind(addr).unwrap());

        // A request from the finished run is ignored once stopped
        slave.stop_after_failure(generation).await;
        assert_eq!(slave.diagnostics().stops, 1);
    }
}

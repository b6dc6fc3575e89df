// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-closed-loop project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Modbus master session manager
//!
//! [`ModbusMaster`] owns at most one TCP session to the configured slave.
//! `connect` and `disconnect` are serialized by a dedicated connection
//! mutex; requests share the session behind a second lock so a disconnect
//! waits for the request in flight before closing the socket.
//!
//! Connect attempts and request/response exchanges each run under their own
//! [`RetryPolicy`]. Exception responses from the slave are final and are
//! returned as [`ModbusError::Protocol`].
//!
//! A transport failure or a response timeout discards the session and marks
//! the master disconnected. The remaining attempts of the same request open a
//! fresh session, unless `disconnect` ran in the meantime.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;

use super::retry::{is_retryable_connect_error, is_retryable_request_error, RetryPolicy};
use super::status::{StatusEvent, StatusNotifier};
use crate::config::ConnectionOptions;
use crate::error::ModbusError;

/// Connection state of the master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
struct Policies {
    connect: RetryPolicy,
    request: RetryPolicy,
}

impl Policies {
    fn from_options(options: &ConnectionOptions) -> Self {
        Self {
            connect: RetryPolicy::from_options(options, is_retryable_connect_error),
            request: RetryPolicy::from_options(options, is_retryable_request_error),
        }
    }
}

#[derive(Debug, Default)]
struct Statistics {
    requests: AtomicU64,
    failed_requests: AtomicU64,
    response_time_us: AtomicU64,
}

/// Request counters of the master
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MasterStatistics {
    pub requests: u64,
    pub failed_requests: u64,
    /// Mean duration of successful requests, retries included
    pub avg_response_time_ms: f64,
}

/// An open protocol context, identified so a failed exchange only discards
/// the session it ran on
struct Session {
    id: u64,
    context: Context,
}

/// Closed-loop Modbus TCP master
pub struct ModbusMaster {
    options: RwLock<ConnectionOptions>,
    policies: RwLock<Policies>,
    connection_lock: Mutex<()>,
    session: Mutex<Option<Session>>,
    next_session_id: AtomicU64,
    /// Bumped by every `disconnect`
    epoch: AtomicU64,
    state: watch::Sender<SessionState>,
    statistics: Statistics,
    status: StatusNotifier,
}

impl ModbusMaster {
    pub fn new(options: ConnectionOptions, status: StatusNotifier) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            policies: RwLock::new(Policies::from_options(&options)),
            options: RwLock::new(options),
            connection_lock: Mutex::new(()),
            session: Mutex::new(None),
            next_session_id: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            state,
            statistics: Statistics::default(),
            status,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn options(&self) -> ConnectionOptions {
        self.options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Store new options and rebuild both retry policies.
    ///
    /// An open session keeps its endpoint until the next connect.
    pub fn apply_options(&self, options: ConnectionOptions) -> Result<(), ModbusError> {
        options.validate()?;
        let policies = Policies::from_options(&options);
        debug!(
            "Master retry policies: connect {:?}, request {:?}",
            policies.connect.strategy(),
            policies.request.strategy()
        );
        *self
            .policies
            .write()
            .unwrap_or_else(PoisonError::into_inner) = policies;
        *self
            .options
            .write()
            .unwrap_or_else(PoisonError::into_inner) = options;
        Ok(())
    }

    pub fn statistics(&self) -> MasterStatistics {
        let requests = self.statistics.requests.load(Ordering::Relaxed);
        let failed_requests = self.statistics.failed_requests.load(Ordering::Relaxed);
        let succeeded = requests.saturating_sub(failed_requests);
        let avg_response_time_ms = if succeeded == 0 {
            0.0
        } else {
            self.statistics.response_time_us.load(Ordering::Relaxed) as f64
                / succeeded as f64
                / 1000.0
        };
        MasterStatistics {
            requests,
            failed_requests,
            avg_response_time_ms,
        }
    }

    fn policies(&self) -> Policies {
        self.policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Modbus master state {:?} -> {:?}", previous, state);
        }
    }

    /// Open a session to the configured slave.
    ///
    /// Returns immediately when already connected. Every attempt uses a new
    /// socket; a failed attempt leaves nothing behind.
    pub async fn connect(&self) -> Result<(), ModbusError> {
        let options = self.options();
        let socket_addr = options.socket_addr()?;

        if self.is_connected() {
            return Ok(());
        }

        let _guard = self.connection_lock.lock().await;
        if self.is_connected() {
            debug!("Modbus master connected by a concurrent caller");
            return Ok(());
        }

        self.set_state(SessionState::Connecting);
        if let Some(stale) = self.session.lock().await.take() {
            debug!("Discarding stale Modbus session {}", stale.id);
            close_context(stale.context).await;
        }

        info!(
            "Connecting Modbus master to {} (unit {})",
            socket_addr, options.unit_id
        );
        let policy = self.policies().connect;
        let unit_id = options.unit_id;
        let connect_timeout = options.send_timeout();
        let result = policy
            .execute("connect", || open_session(socket_addr, unit_id, connect_timeout))
            .await;

        match result {
            Ok(context) => {
                self.install_session(context).await;
                self.set_state(SessionState::Connected);
                self.status.publish(StatusEvent::MasterConnected(true));
                info!("Modbus master connected to {}", socket_addr);
                Ok(())
            }
            Err(err) => {
                self.set_state(SessionState::Disconnected);
                error!("Modbus master failed to connect to {}: {}", socket_addr, err);
                Err(err)
            }
        }
    }

    /// Close the session. No-op when disconnected.
    pub async fn disconnect(&self) {
        // Requests in flight must not reopen what is being closed
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if self.state() == SessionState::Disconnected && self.session.lock().await.is_none() {
            return;
        }

        let _guard = self.connection_lock.lock().await;
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            close_context(session.context).await;
            info!("Modbus master disconnected");
            self.status.publish(StatusEvent::MasterConnected(false));
        }
        self.set_state(SessionState::Disconnected);
    }

    async fn request(
        &self,
        operation: &'static str,
        request: Request<'static>,
    ) -> Result<Response, ModbusError> {
        if !self.is_connected() {
            return Err(ModbusError::NotConnected);
        }

        let policy = self.policies().request;
        let response_timeout = self.options().receive_timeout();
        let epoch = self.epoch.load(Ordering::SeqCst);
        let started = Instant::now();

        let result = policy
            .execute(operation, || {
                self.exchange(operation, request.clone(), response_timeout, epoch)
            })
            .await;

        self.statistics.requests.fetch_add(1, Ordering::Relaxed);
        match &result {
            Ok(_) => {
                self.statistics
                    .response_time_us
                    .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
            }
            Err(err) => {
                self.statistics
                    .failed_requests
                    .fetch_add(1, Ordering::Relaxed);
                debug!("{} failed: {}", operation, err);
            }
        }
        result
    }

    /// One request/response exchange on the current session, reopening it
    /// first if a previous attempt discarded it
    async fn exchange(
        &self,
        operation: &'static str,
        request: Request<'static>,
        response_timeout: Duration,
        epoch: u64,
    ) -> Result<Response, ModbusError> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            drop(guard);
            self.reopen(epoch).await?;
            guard = self.session.lock().await;
        }
        let session = guard.as_mut().ok_or(ModbusError::NotConnected)?;
        let id = session.id;
        let result = match time::timeout(response_timeout, session.context.call(request)).await {
            Err(_) => Err(ModbusError::Timeout {
                operation: operation.to_string(),
                timeout: response_timeout,
            }),
            Ok(Err(err)) => Err(ModbusError::from(err)),
            Ok(Ok(Err(code))) => Err(ModbusError::Protocol(code)),
            Ok(Ok(Ok(response))) => Ok(response),
        };
        drop(guard);

        if let Err(err) = &result {
            if breaks_session(err) {
                self.discard_session(id, err).await;
            }
        }
        result
    }

    /// Drop session `id` after a failed exchange. A session opened since
    /// then is left alone.
    async fn discard_session(&self, id: u64, err: &ModbusError) {
        let _guard = self.connection_lock.lock().await;
        let mut session = self.session.lock().await;
        if !matches!(session.as_ref(), Some(current) if current.id == id) {
            return;
        }
        if let Some(broken) = session.take() {
            warn!("Dropping Modbus session {} after: {}", broken.id, err);
            drop(broken);
        }
        drop(session);
        self.set_state(SessionState::Disconnected);
        self.status.publish(StatusEvent::MasterConnected(false));
    }

    /// Open a fresh session for a request started in `epoch`
    async fn reopen(&self, epoch: u64) -> Result<(), ModbusError> {
        let _guard = self.connection_lock.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return Err(ModbusError::NotConnected);
        }
        if self.session.lock().await.is_some() {
            return Ok(());
        }

        let options = self.options();
        let socket_addr = options.socket_addr()?;
        self.set_state(SessionState::Connecting);
        debug!("Reopening Modbus session to {}", socket_addr);
        match open_session(socket_addr, options.unit_id, options.send_timeout()).await {
            Ok(context) => {
                self.install_session(context).await;
                self.set_state(SessionState::Connected);
                self.status.publish(StatusEvent::MasterConnected(true));
                info!("Modbus master reconnected to {}", socket_addr);
                Ok(())
            }
            Err(err) => {
                self.set_state(SessionState::Disconnected);
                Err(err)
            }
        }
    }

    async fn install_session(&self, context: Context) {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        *self.session.lock().await = Some(Session { id, context });
    }

    pub async fn read_coils(&self, address: u16, count: u16) -> Result<Vec<bool>, ModbusError> {
        match self
            .request("read_coils", Request::ReadCoils(address, count))
            .await?
        {
            Response::ReadCoils(mut values) => {
                // Bits arrive padded to whole bytes
                values.truncate(usize::from(count));
                Ok(values)
            }
            _ => Err(unexpected("read_coils")),
        }
    }

    pub async fn read_discrete_inputs(
        &self,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, ModbusError> {
        match self
            .request(
                "read_discrete_inputs",
                Request::ReadDiscreteInputs(address, count),
            )
            .await?
        {
            Response::ReadDiscreteInputs(mut values) => {
                values.truncate(usize::from(count));
                Ok(values)
            }
            _ => Err(unexpected("read_discrete_inputs")),
        }
    }

    pub async fn read_holding_registers(
        &self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        match self
            .request(
                "read_holding_registers",
                Request::ReadHoldingRegisters(address, count),
            )
            .await?
        {
            Response::ReadHoldingRegisters(values) => Ok(values),
            _ => Err(unexpected("read_holding_registers")),
        }
    }

    pub async fn read_input_registers(
        &self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        match self
            .request(
                "read_input_registers",
                Request::ReadInputRegisters(address, count),
            )
            .await?
        {
            Response::ReadInputRegisters(values) => Ok(values),
            _ => Err(unexpected("read_input_registers")),
        }
    }

    pub async fn write_single_coil(&self, address: u16, value: bool) -> Result<(), ModbusError> {
        match self
            .request("write_single_coil", Request::WriteSingleCoil(address, value))
            .await?
        {
            Response::WriteSingleCoil(addr, echoed) if addr == address && echoed == value => Ok(()),
            _ => Err(unexpected("write_single_coil")),
        }
    }

    pub async fn write_multiple_coils(
        &self,
        address: u16,
        values: &[bool],
    ) -> Result<(), ModbusError> {
        let count = values.len();
        match self
            .request(
                "write_multiple_coils",
                Request::WriteMultipleCoils(address, Cow::Owned(values.to_vec())),
            )
            .await?
        {
            Response::WriteMultipleCoils(addr, written)
                if addr == address && usize::from(written) == count =>
            {
                Ok(())
            }
            _ => Err(unexpected("write_multiple_coils")),
        }
    }

    pub async fn write_single_register(&self, address: u16, value: u16) -> Result<(), ModbusError> {
        match self
            .request(
                "write_single_register",
                Request::WriteSingleRegister(address, value),
            )
            .await?
        {
            Response::WriteSingleRegister(addr, echoed) if addr == address && echoed == value => {
                Ok(())
            }
            _ => Err(unexpected("write_single_register")),
        }
    }

    pub async fn write_multiple_registers(
        &self,
        address: u16,
        values: &[u16],
    ) -> Result<(), ModbusError> {
        let count = values.len();
        match self
            .request(
                "write_multiple_registers",
                Request::WriteMultipleRegisters(address, Cow::Owned(values.to_vec())),
            )
            .await?
        {
            Response::WriteMultipleRegisters(addr, written)
                if addr == address && usize::from(written) == count =>
            {
                Ok(())
            }
            _ => Err(unexpected("write_multiple_registers")),
        }
    }
}

/// Failures after which the socket cannot be trusted. A late response to a
/// timed-out request would be read as the answer to the next one.
fn breaks_session(err: &ModbusError) -> bool {
    matches!(
        err,
        ModbusError::Io { .. } | ModbusError::Transport { .. } | ModbusError::Timeout { .. }
    )
}

fn unexpected(operation: &str) -> ModbusError {
    ModbusError::UnexpectedResponse {
        operation: operation.to_string(),
    }
}

/// One connect attempt: a fresh socket and a protocol context bound to `unit_id`
async fn open_session(
    socket_addr: SocketAddr,
    unit_id: u8,
    connect_timeout: Duration,
) -> Result<Context, ModbusError> {
    let stream = time::timeout(connect_timeout, TcpStream::connect(socket_addr))
        .await
        .map_err(|_| ModbusError::Timeout {
            operation: format!("connect to {}", socket_addr),
            timeout: connect_timeout,
        })??;
    stream.set_nodelay(true)?;
    Ok(tcp::attach_slave(stream, Slave(unit_id)))
}

async fn close_context(mut context: Context) {
    if let Err(e) = context.disconnect().await {
        warn!("Error while closing Modbus session: {}", e);
    }
}

// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-closed-loop project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Modbus request handling for the closed-loop slave
//!
//! [`ClosedLoopService`] is the per-connection protocol session: it answers
//! requests addressed to its unit identifier from the shared
//! [`DataStore`](super::data_store::DataStore).
//!
//! ## Supported function codes
//!
//! | Code | Function | Region |
//! |------|----------|--------|
//! | 0x01 | Read Coils | coils |
//! | 0x02 | Read Discrete Inputs | discrete inputs |
//! | 0x03 | Read Holding Registers | holding registers |
//! | 0x04 | Read Input Registers | input registers |
//! | 0x05 | Write Single Coil | coils |
//! | 0x06 | Write Single Register | holding registers |
//! | 0x0F | Write Multiple Coils | coils |
//! | 0x10 | Write Multiple Registers | holding registers |
//!
//! ## Exception responses
//!
//! - `IllegalFunction`: any other function code, or any write while the
//!   slave is read-only
//! - `IllegalDataAddress`: the address range leaves the region
//! - `IllegalDataValue`: zero quantity or more than the protocol allows in
//!   one frame
//! - `GatewayTargetDevice`: the request targets another unit identifier

use std::future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use serde::Serialize;
use tokio_modbus::{ExceptionCode, Request, Response, SlaveRequest};

use super::data_store::DataStore;

/// Largest bit count in one read coils/discrete inputs frame
pub const MAX_READ_BITS: u16 = 2000;
/// Largest register count in one read frame
pub const MAX_READ_REGISTERS: u16 = 125;
/// Largest coil count in one write multiple coils frame
pub const MAX_WRITE_BITS: u16 = 1968;
/// Largest register count in one write multiple registers frame
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Counters shared by every connection of one slave run
#[derive(Debug, Default)]
pub struct Diagnostics {
    total_requests: AtomicU64,
    exception_responses: AtomicU64,
    foreign_unit_requests: AtomicU64,
    refused_connections: AtomicU64,
    starts: AtomicU64,
    stops: AtomicU64,
}

/// Point-in-time copy of the slave counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub total_requests: u64,
    pub exception_responses: u64,
    pub foreign_unit_requests: u64,
    pub refused_connections: u64,
    pub active_connections: usize,
    pub starts: u64,
    pub stops: u64,
}

impl Diagnostics {
    pub(crate) fn record_refused_connection(&self) {
        self.refused_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_start(&self) {
        self.starts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stop(&self) {
        self.stops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active_connections: usize) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            exception_responses: self.exception_responses.load(Ordering::Relaxed),
            foreign_unit_requests: self.foreign_unit_requests.load(Ordering::Relaxed),
            refused_connections: self.refused_connections.load(Ordering::Relaxed),
            active_connections,
            starts: self.starts.load(Ordering::Relaxed),
            stops: self.stops.load(Ordering::Relaxed),
        }
    }
}

/// Protocol session of the closed-loop slave.
///
/// One instance is created per accepted connection; all of them share the
/// same data store and diagnostics.
#[derive(Debug, Clone)]
pub struct ClosedLoopService {
    unit_id: u8,
    read_only: bool,
    store: Arc<DataStore>,
    diagnostics: Arc<Diagnostics>,
}

impl tokio_modbus::server::Service for ClosedLoopService {
    type Request = SlaveRequest<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let SlaveRequest { slave, request } = req;

        if slave != self.unit_id {
            debug!(
                "Rejecting request for unit {} on unit {}: {:?}",
                slave, self.unit_id, request
            );
            self.diagnostics
                .foreign_unit_requests
                .fetch_add(1, Ordering::Relaxed);
            return future::ready(Err(ExceptionCode::GatewayTargetDevice));
        }

        future::ready(self.handle(request))
    }
}

fn check_quantity(quantity: usize, max: u16) -> Result<(), ExceptionCode> {
    if quantity == 0 || quantity > usize::from(max) {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok(())
}

impl ClosedLoopService {
    pub fn new(
        unit_id: u8,
        read_only: bool,
        store: Arc<DataStore>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            unit_id,
            read_only,
            store,
            diagnostics,
        }
    }

    /// Answer one request addressed to this unit
    pub fn handle(&self, request: Request<'_>) -> Result<Response, ExceptionCode> {
        self.diagnostics
            .total_requests
            .fetch_add(1, Ordering::Relaxed);

        let res = self.dispatch(request);
        if let Err(code) = &res {
            self.diagnostics
                .exception_responses
                .fetch_add(1, Ordering::Relaxed);
            warn!("Answering with exception {:?}", code);
        }
        res
    }

    fn ensure_writable(&self) -> Result<(), ExceptionCode> {
        if self.read_only {
            debug!("Write rejected, slave is read-only");
            return Err(ExceptionCode::IllegalFunction);
        }
        Ok(())
    }

    fn dispatch(&self, request: Request<'_>) -> Result<Response, ExceptionCode> {
        match request {
            Request::ReadCoils(addr, cnt) => {
                debug!("Reading {} coils starting from address {}", cnt, addr);
                check_quantity(usize::from(cnt), MAX_READ_BITS)?;
                self.store.coils.read(addr, cnt).map(Response::ReadCoils)
            }
            Request::ReadDiscreteInputs(addr, cnt) => {
                debug!(
                    "Reading {} discrete inputs starting from address {}",
                    cnt, addr
                );
                check_quantity(usize::from(cnt), MAX_READ_BITS)?;
                self.store
                    .discrete_inputs
                    .read(addr, cnt)
                    .map(Response::ReadDiscreteInputs)
            }
            Request::ReadHoldingRegisters(addr, cnt) => {
                debug!(
                    "Reading {} holding registers starting from address {}",
                    cnt, addr
                );
                check_quantity(usize::from(cnt), MAX_READ_REGISTERS)?;
                self.store
                    .holding_registers
                    .read(addr, cnt)
                    .map(Response::ReadHoldingRegisters)
            }
            Request::ReadInputRegisters(addr, cnt) => {
                debug!(
                    "Reading {} input registers starting from address {}",
                    cnt, addr
                );
                check_quantity(usize::from(cnt), MAX_READ_REGISTERS)?;
                self.store
                    .input_registers
                    .read(addr, cnt)
                    .map(Response::ReadInputRegisters)
            }
            Request::WriteSingleCoil(addr, value) => {
                debug!("Writing {} to coil {}", value, addr);
                self.ensure_writable()?;
                self.store
                    .coils
                    .write(addr, std::slice::from_ref(&value))
                    .map(|_| Response::WriteSingleCoil(addr, value))
            }
            Request::WriteMultipleCoils(addr, values) => {
                debug!(
                    "Writing {} coils starting from address {}",
                    values.len(),
                    addr
                );
                self.ensure_writable()?;
                check_quantity(values.len(), MAX_WRITE_BITS)?;
                self.store
                    .coils
                    .write(addr, &values)
                    .map(|_| Response::WriteMultipleCoils(addr, values.len() as u16))
            }
            Request::WriteSingleRegister(addr, value) => {
                debug!("Writing value {} to holding register {}", value, addr);
                self.ensure_writable()?;
                self.store
                    .holding_registers
                    .write(addr, std::slice::from_ref(&value))
                    .map(|_| Response::WriteSingleRegister(addr, value))
            }
            Request::WriteMultipleRegisters(addr, values) => {
                debug!(
                    "Writing {} values to holding registers starting from address {}",
                    values.len(),
                    addr
                );
                self.ensure_writable()?;
                check_quantity(values.len(), MAX_WRITE_REGISTERS)?;
                self.store
                    .holding_registers
                    .write(addr, &values)
                    .map(|_| Response::WriteMultipleRegisters(addr, values.len() as u16))
            }
            other => {
                debug!("Unsupported function in request: {:?}", other);
                Err(ExceptionCode::IllegalFunction)
            }
        }
    }
}

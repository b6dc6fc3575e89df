// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-closed-loop project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! In-memory Modbus data store
//!
//! The slave exposes four regions:
//!
//! | Region | Cell | Access from the wire |
//! |--------|------|----------------------|
//! | Coils | bit | read / write |
//! | Discrete inputs | bit | read only |
//! | Holding registers | 16-bit word | read / write |
//! | Input registers | 16-bit word | read only |
//!
//! Each region is a fixed-length vector behind its own `RwLock`. Readers of
//! one region never wait on writers of another, and a multi-cell write is
//! applied under a single write guard so no reader can observe it halfway.
//! Region lengths are fixed at construction; a different size means a new
//! store.

use std::ops::Range;
use std::sync::{PoisonError, RwLock};

use log::debug;
use tokio_modbus::ExceptionCode;

use crate::config::ConnectionOptions;

/// One fixed-size region of the data store
#[derive(Debug)]
pub struct Region<T> {
    name: &'static str,
    len: usize,
    cells: RwLock<Vec<T>>,
}

impl<T: Copy + Default> Region<T> {
    fn new(name: &'static str, len: usize) -> Self {
        Self {
            name,
            len,
            cells: RwLock::new(vec![T::default(); len]),
        }
    }

    /// Number of cells, fixed for the lifetime of the region
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn bounds(&self, address: u16, count: usize) -> Result<Range<usize>, ExceptionCode> {
        if count == 0 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let start = usize::from(address);
        let end = start + count;
        if end > self.len {
            debug!(
                "{}: range {}..{} outside region of {} cells",
                self.name, start, end, self.len
            );
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Ok(start..end)
    }

    /// Read `count` cells starting at `address`
    pub fn read(&self, address: u16, count: u16) -> Result<Vec<T>, ExceptionCode> {
        let range = self.bounds(address, usize::from(count))?;
        let cells = self.cells.read().unwrap_or_else(PoisonError::into_inner);
        Ok(cells[range].to_vec())
    }

    /// Write `values` starting at `address`, all or nothing
    pub fn write(&self, address: u16, values: &[T]) -> Result<(), ExceptionCode> {
        let range = self.bounds(address, values.len())?;
        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        cells[range].copy_from_slice(values);
        Ok(())
    }

    /// Set every cell to `value`
    pub fn fill(&self, value: T) {
        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        cells.fill(value);
    }
}

/// The four regions served by one slave
#[derive(Debug)]
pub struct DataStore {
    pub coils: Region<bool>,
    pub discrete_inputs: Region<bool>,
    pub holding_registers: Region<u16>,
    pub input_registers: Region<u16>,
}

impl DataStore {
    /// Zero-filled store sized from the region capacities in `options`
    pub fn new(options: &ConnectionOptions) -> Self {
        Self::with_sizes(
            options.max_coils as usize,
            options.max_discrete_inputs as usize,
            options.max_holding_registers as usize,
            options.max_input_registers as usize,
        )
    }

    pub fn with_sizes(
        coils: usize,
        discrete_inputs: usize,
        holding_registers: usize,
        input_registers: usize,
    ) -> Self {
        debug!(
            "Creating data store: {} coils, {} discrete inputs, {} holding registers, {} input registers",
            coils, discrete_inputs, holding_registers, input_registers
        );
        Self {
            coils: Region::new("coils", coils),
            discrete_inputs: Region::new("discrete inputs", discrete_inputs),
            holding_registers: Region::new("holding registers", holding_registers),
            input_registers: Region::new("input registers", input_registers),
        }
    }
}

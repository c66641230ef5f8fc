// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Synchronous Modbus context access
//!
//! Each call blocks the current thread on a private single-threaded
//! runtime that drives the asynchronous context.

#[cfg(feature = "rtu")]
pub mod rtu;

#[cfg(feature = "tcp")]
pub mod tcp;

use std::{io, time::Duration};

use tokio::runtime::Runtime;

use super::{
    Client as AsyncClient, Context as AsyncContext, Reader as AsyncReader,
    SignedReader as AsyncSignedReader, SlaveContext, Writer as AsyncWriter,
};

use crate::{frame::*, slave::*, Result};

fn new_runtime() -> io::Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

/// A transport independent synchronous client trait.
pub trait Client: SlaveContext {
    fn call(&mut self, req: Request<'_>) -> Result<Response>;

    fn set_timeout(&mut self, timeout: Duration);
}

/// A transport independent synchronous reader trait.
pub trait Reader: Client {
    fn read_coils(&mut self, _: Address, _: Quantity) -> Result<Vec<Coil>>;
    fn read_discrete_inputs(&mut self, _: Address, _: Quantity) -> Result<Vec<Coil>>;
    fn read_input_registers(&mut self, _: Address, _: Quantity) -> Result<Vec<Word>>;
    fn read_holding_registers(&mut self, _: Address, _: Quantity) -> Result<Vec<Word>>;
    fn read_input_registers_signed(&mut self, _: Address, _: Quantity) -> Result<Vec<i16>>;
    fn read_holding_registers_signed(&mut self, _: Address, _: Quantity) -> Result<Vec<i16>>;
}

/// A transport independent synchronous writer trait.
pub trait Writer: Client {
    fn write_single_coil(&mut self, _: Address, _: Coil) -> Result<()>;
    fn write_multiple_coils(&mut self, _: Address, _: &[Coil]) -> Result<()>;
    fn write_single_register(&mut self, _: Address, _: Word) -> Result<()>;
    fn write_multiple_registers(&mut self, _: Address, _: &[Word]) -> Result<()>;
}

/// A synchronous Modbus client context.
#[derive(Debug)]
pub struct Context {
    runtime: Runtime,
    async_ctx: AsyncContext,
}

impl Context {
    fn new(runtime: Runtime, async_ctx: AsyncContext) -> Self {
        Self { runtime, async_ctx }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.async_ctx.timeout()
    }

    /// Shuts down the underlying stream.
    pub fn disconnect(&mut self) -> io::Result<()> {
        self.runtime.block_on(self.async_ctx.disconnect())
    }
}

impl Client for Context {
    fn call(&mut self, req: Request<'_>) -> Result<Response> {
        self.runtime.block_on(self.async_ctx.call(req))
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.async_ctx.set_timeout(timeout);
    }
}

impl SlaveContext for Context {
    fn set_slave(&mut self, slave: Slave) {
        self.async_ctx.set_slave(slave);
    }
}

impl Reader for Context {
    fn read_coils(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<Coil>> {
        self.runtime.block_on(self.async_ctx.read_coils(addr, cnt))
    }

    fn read_discrete_inputs(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<Coil>> {
        self.runtime
            .block_on(self.async_ctx.read_discrete_inputs(addr, cnt))
    }

    fn read_input_registers(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<Word>> {
        self.runtime
            .block_on(self.async_ctx.read_input_registers(addr, cnt))
    }

    fn read_holding_registers(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<Word>> {
        self.runtime
            .block_on(self.async_ctx.read_holding_registers(addr, cnt))
    }

    fn read_input_registers_signed(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<i16>> {
        self.runtime
            .block_on(self.async_ctx.read_input_registers_signed(addr, cnt))
    }

    fn read_holding_registers_signed(
        &mut self,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<i16>> {
        self.runtime
            .block_on(self.async_ctx.read_holding_registers_signed(addr, cnt))
    }
}

impl Writer for Context {
    fn write_single_register(&mut self, addr: Address, data: Word) -> Result<()> {
        self.runtime
            .block_on(self.async_ctx.write_single_register(addr, data))
    }

    fn write_multiple_registers(&mut self, addr: Address, data: &[Word]) -> Result<()> {
        self.runtime
            .block_on(self.async_ctx.write_multiple_registers(addr, data))
    }

    fn write_single_coil(&mut self, addr: Address, coil: Coil) -> Result<()> {
        self.runtime
            .block_on(self.async_ctx.write_single_coil(addr, coil))
    }

    fn write_multiple_coils(&mut self, addr: Address, coils: &[Coil]) -> Result<()> {
        self.runtime
            .block_on(self.async_ctx.write_multiple_coils(addr, coils))
    }
}

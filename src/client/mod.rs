// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus clients

use std::{borrow::Cow, fmt::Debug, io, time::Duration};

use async_trait::async_trait;

use crate::{codec, frame::*, slave::*, Error, ProtocolError, Result};

#[cfg(feature = "rtu")]
pub mod rtu;

#[cfg(feature = "tcp")]
pub mod tcp;

#[cfg(feature = "sync")]
pub mod sync;

/// Response timeout of a [`Context`] unless the transport suggests
/// another one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport independent asynchronous client trait
#[async_trait]
pub trait Client: SlaveContext + Send + Debug {
    /// Invokes a _Modbus_ function.
    async fn call(&mut self, request: Request<'_>) -> Result<Response>;

    /// Disconnects the client.
    ///
    /// Permanently disconnects the client by shutting down the
    /// underlying stream in a graceful manner (`AsyncDrop`).
    ///
    /// Dropping the client without explicitly disconnecting it
    /// beforehand should also work and free all resources.
    async fn disconnect(&mut self) -> io::Result<()>;
}

/// Asynchronous _Modbus_ reader
#[async_trait]
pub trait Reader: Client {
    /// Read multiple coils (0x01)
    async fn read_coils(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<Coil>>;

    /// Read multiple discrete inputs (0x02)
    async fn read_discrete_inputs(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<Coil>>;

    /// Read multiple holding registers (0x03)
    async fn read_holding_registers(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<Word>>;

    /// Read multiple input registers (0x04)
    async fn read_input_registers(&mut self, addr: Address, cnt: Quantity) -> Result<Vec<Word>>;
}

/// Asynchronous Modbus writer
///
/// A write only succeeds if the response echoes the request, otherwise
/// [`Error::Integrity`] is returned.
#[async_trait]
pub trait Writer: Client {
    /// Write a single coil (0x05)
    async fn write_single_coil(&mut self, addr: Address, coil: Coil) -> Result<()>;

    /// Write a single holding register (0x06)
    async fn write_single_register(&mut self, addr: Address, word: Word) -> Result<()>;

    /// Write multiple coils (0x0F)
    async fn write_multiple_coils(&mut self, addr: Address, coils: &'_ [Coil]) -> Result<()>;

    /// Write multiple holding registers (0x10)
    async fn write_multiple_registers(&mut self, addr: Address, words: &[Word]) -> Result<()>;
}

/// Reads registers as two's complement values.
#[async_trait]
pub trait SignedReader: Reader {
    async fn read_holding_registers_signed(
        &mut self,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<i16>> {
        self.read_holding_registers(addr, cnt)
            .await
            .map(|result| result.map(|words| codec::to_signed(&words)))
    }

    async fn read_input_registers_signed(
        &mut self,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<i16>> {
        self.read_input_registers(addr, cnt)
            .await
            .map(|result| result.map(|words| codec::to_signed(&words)))
    }
}

impl<T: Reader> SignedReader for T {}

/// Asynchronous Modbus client context
///
/// Every call is bounded by the context's timeout.
#[derive(Debug)]
pub struct Context {
    client: Box<dyn Client>,
    timeout: Duration,
}

impl Context {
    pub(crate) fn new(client: Box<dyn Client>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Limits how long each subsequent call waits for its response.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn invoke(&mut self, request: Request<'_>) -> Result<Response> {
        let echo = request.function_code().is_write().then(|| request.clone());
        let result = tokio::time::timeout(self.timeout, self.client.call(request))
            .await
            .map_err(|_| {
                log::debug!("No response within {:?}", self.timeout);
                Error::Timeout(self.timeout)
            })??;
        if let (Some(request), Ok(response)) = (echo, &result) {
            codec::verify_write_echo(&request, response)?;
        }
        Ok(result)
    }
}

impl From<Box<dyn Client>> for Context {
    fn from(client: Box<dyn Client>) -> Self {
        Self::new(client, DEFAULT_TIMEOUT)
    }
}

impl From<Context> for Box<dyn Client> {
    fn from(val: Context) -> Self {
        val.client
    }
}

#[async_trait]
impl Client for Context {
    async fn call(&mut self, request: Request<'_>) -> Result<Response> {
        self.invoke(request).await
    }

    async fn disconnect(&mut self) -> io::Result<()> {
        self.client.disconnect().await
    }
}

impl SlaveContext for Context {
    fn set_slave(&mut self, slave: Slave) {
        self.client.set_slave(slave);
    }
}

fn unexpected<T>(request: FunctionCode, response: Response) -> Result<T> {
    Err(ProtocolError::FunctionCodeMismatch {
        request,
        result: Ok(response),
    }
    .into())
}

#[async_trait]
impl Reader for Context {
    async fn read_coils<'a>(&'a mut self, addr: Address, cnt: Quantity) -> Result<Vec<Coil>> {
        match self.invoke(Request::ReadCoils(addr, cnt)).await? {
            Ok(Response::ReadCoils(mut coils)) => {
                // The protocol always transfers entire bytes.
                coils.truncate(cnt.into());
                Ok(Ok(coils))
            }
            Ok(response) => unexpected(FunctionCode::ReadCoils, response),
            Err(exception) => Ok(Err(exception)),
        }
    }

    async fn read_discrete_inputs<'a>(
        &'a mut self,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<Coil>> {
        match self.invoke(Request::ReadDiscreteInputs(addr, cnt)).await? {
            Ok(Response::ReadDiscreteInputs(mut inputs)) => {
                inputs.truncate(cnt.into());
                Ok(Ok(inputs))
            }
            Ok(response) => unexpected(FunctionCode::ReadDiscreteInputs, response),
            Err(exception) => Ok(Err(exception)),
        }
    }

    async fn read_input_registers<'a>(
        &'a mut self,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<Word>> {
        match self.invoke(Request::ReadInputRegisters(addr, cnt)).await? {
            Ok(Response::ReadInputRegisters(words)) => {
                debug_assert_eq!(words.len(), cnt.into());
                Ok(Ok(words))
            }
            Ok(response) => unexpected(FunctionCode::ReadInputRegisters, response),
            Err(exception) => Ok(Err(exception)),
        }
    }

    async fn read_holding_registers<'a>(
        &'a mut self,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<Word>> {
        match self.invoke(Request::ReadHoldingRegisters(addr, cnt)).await? {
            Ok(Response::ReadHoldingRegisters(words)) => {
                debug_assert_eq!(words.len(), cnt.into());
                Ok(Ok(words))
            }
            Ok(response) => unexpected(FunctionCode::ReadHoldingRegisters, response),
            Err(exception) => Ok(Err(exception)),
        }
    }
}

#[async_trait]
impl Writer for Context {
    async fn write_single_coil<'a>(&'a mut self, addr: Address, coil: Coil) -> Result<()> {
        self.invoke(Request::WriteSingleCoil(addr, coil))
            .await
            .map(|result| result.map(drop))
    }

    async fn write_multiple_coils<'a>(&'a mut self, addr: Address, coils: &[Coil]) -> Result<()> {
        self.invoke(Request::WriteMultipleCoils(addr, Cow::Borrowed(coils)))
            .await
            .map(|result| result.map(drop))
    }

    async fn write_single_register<'a>(&'a mut self, addr: Address, word: Word) -> Result<()> {
        self.invoke(Request::WriteSingleRegister(addr, word))
            .await
            .map(|result| result.map(drop))
    }

    async fn write_multiple_registers<'a>(
        &'a mut self,
        addr: Address,
        data: &[Word],
    ) -> Result<()> {
        self.invoke(Request::WriteMultipleRegisters(addr, Cow::Borrowed(data)))
            .await
            .map(|result| result.map(drop))
    }
}

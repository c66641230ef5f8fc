// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [Modbus](https://en.wikipedia.org/wiki/Modbus) RTU and TCP devices and
//! hosts based on [tokio](https://tokio.rs).
//!
//! A device answers requests from a [`store::Store`] that holds the
//! coils, discrete inputs, holding registers and input registers it
//! exposes. Entries of the store may carry callbacks that run when they
//! are read or written from the wire.
//!
//! A host sends requests through a [`client::Context`] and receives the
//! response, a _Modbus_ exception or an [`Error`].
//!
//! Every role is available with an asynchronous API and, behind the
//! `sync` features, a blocking one.
//!
//! ## Installation
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! modbus-device = "*"
//! ```

pub mod prelude;

pub mod client;

pub mod codec;

#[cfg(feature = "rtu")]
pub mod rtu;

#[cfg(feature = "server")]
pub mod server;

pub mod store;

mod error;
pub use self::error::{ConfigError, EchoMismatch, Error, ProtocolError};

mod frame;
pub use self::frame::{
    Address, Coil, ExceptionCode, ExceptionResponse, FunctionCode, Quantity, Request, Response,
    Word,
};

mod service;

mod slave;
pub use self::slave::{Slave, SlaveContext, SlaveId, UnitFilter};

/// Specialized [`std::result::Result`] type for type-checked responses of the _Modbus_ client API.
///
/// The payload is generic over the response type.
///
/// This [`Result`] type contains 2 layers of errors.
///
/// 1. [`Error`]: An unexpected protocol or network error that occurred during client/server communication.
/// 2. [`ExceptionCode`]: An error occurred on the _Modbus_ server.
pub type Result<T> = std::result::Result<std::result::Result<T, ExceptionCode>, Error>;

// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types.

use std::{io, time::Duration};

use thiserror::Error;

use crate::{frame::*, store::RegisterClass};

/// _Modbus_ protocol error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The received response header doesn't match the request.
    ///
    /// The error message contains details about the mismatch.
    ///
    /// The result received from the server is included for further analysis
    /// and handling.
    #[error("mismatching headers: {message} {result:?}")]
    HeaderMismatch {
        message: String,
        result: Result<Response, ExceptionResponse>,
    },

    /// The received response function code doesn't match the request.
    ///
    /// The result received from the server is included for further analysis
    /// and handling.
    #[error("mismatching function codes: {request} {result:?}")]
    FunctionCodeMismatch {
        request: FunctionCode,
        result: Result<Response, ExceptionResponse>,
    },
}

/// A write response that does not echo what has been written.
///
/// The peer did answer, but inconsistently. This is not a _Modbus_
/// exception.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("function {function}: expected echo {expected:?}, received {actual:?}")]
pub struct EchoMismatch {
    pub function: FunctionCode,
    pub expected: Response,
    pub actual: Response,
}

/// Setup or lifecycle misuse, detected before any I/O happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("device is not bound to a transport")]
    NotBound,

    #[error("device is serving, close it first")]
    Serving,

    #[error("{class} {name:?} is empty")]
    EmptyRegister { class: RegisterClass, name: String },

    #[error("{class} {name:?} overlaps at address {address}")]
    OverlappingRegisters {
        class: RegisterClass,
        name: String,
        address: Address,
    },

    #[error("{class} {name:?} exceeds the address space")]
    AddressOverflow { class: RegisterClass, name: String },

    #[error("{class} {name:?} has {actual} default values instead of {expected}")]
    DefaultLength {
        class: RegisterClass,
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid serial settings: {0}")]
    Serial(String),
}

/// _Modbus_ transport, protocol, timeout, integrity or setup error.
#[derive(Debug, Error)]
pub enum Error {
    /// _Modbus_ protocol error.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// I/O and framing errors.
    ///
    /// Malformed frames and CRC mismatches are reported with
    /// [`io::ErrorKind::InvalidData`].
    #[error(transparent)]
    Transport(#[from] io::Error),

    /// No response arrived in time.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// A write response did not echo the request.
    #[error(transparent)]
    Integrity(#[from] EchoMismatch),

    /// Invalid configuration or lifecycle transition.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

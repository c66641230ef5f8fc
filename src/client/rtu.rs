// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Connecting a Modbus RTU context
//!
//! The response timeout defaults to 40 inter-frame silences of the
//! serial line.

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

use super::*;

use crate::{
    error::ConfigError,
    rtu::{DirectionControl, Framer, SerialConfig},
    service,
};

/// Attach a new client context to a transport with a connected slave
/// device.
pub fn attach_slave<T>(
    transport: T,
    config: &SerialConfig,
    slave: Slave,
) -> std::result::Result<Context, ConfigError>
where
    T: AsyncRead + AsyncWrite + fmt::Debug + Unpin + Send + 'static,
{
    config.validate()?;
    let framer = Framer::new(transport, config.timing());
    Ok(context(framer, config, slave))
}

/// Like [`attach_slave()`] on a half-duplex line whose transceiver is
/// switched by `direction`.
pub fn attach_slave_with_direction_control<T>(
    transport: T,
    config: &SerialConfig,
    slave: Slave,
    direction: impl DirectionControl + 'static,
) -> std::result::Result<Context, ConfigError>
where
    T: AsyncRead + AsyncWrite + fmt::Debug + Unpin + Send + 'static,
{
    config.validate()?;
    let framer = Framer::new(transport, config.timing()).with_direction_control(Box::new(direction));
    Ok(context(framer, config, slave))
}

fn context<T>(framer: Framer<T>, config: &SerialConfig, slave: Slave) -> Context
where
    T: AsyncRead + AsyncWrite + fmt::Debug + Unpin + Send + 'static,
{
    log::debug!("Attaching to {slave} at {} baud", config.baud_rate);
    let client = service::rtu::Client::new(framer, slave);
    Context::new(Box::new(client), config.timing().response_timeout())
}

/// Open a serial port and attach a client context to it.
#[cfg(feature = "rtu-serial")]
pub fn connect_slave(
    path: &str,
    config: &SerialConfig,
    slave: Slave,
) -> std::result::Result<Context, Error> {
    let builder = config.serial_port_builder(path)?;
    let port = tokio_serial::SerialStream::open(&builder).map_err(io::Error::from)?;
    Ok(attach_slave(port, config, slave)?)
}

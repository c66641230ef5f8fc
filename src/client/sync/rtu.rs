// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

use super::{new_runtime, Context};

use crate::{client::rtu as async_rtu, rtu::SerialConfig, slave::Slave, Error};

/// Attach a blocking client context to a serial transport.
pub fn attach_slave<T>(transport: T, config: &SerialConfig, slave: Slave) -> Result<Context, Error>
where
    T: AsyncRead + AsyncWrite + fmt::Debug + Unpin + Send + 'static,
{
    let runtime = new_runtime()?;
    let async_ctx = async_rtu::attach_slave(transport, config, slave)?;
    Ok(Context::new(runtime, async_ctx))
}

/// Open a serial port and connect to the given slave device.
#[cfg(feature = "rtu-serial")]
pub fn connect_slave(path: &str, config: &SerialConfig, slave: Slave) -> Result<Context, Error> {
    let runtime = new_runtime()?;
    // The serial stream registers with the runtime that is current when
    // it is opened.
    let async_ctx = {
        let _guard = runtime.enter();
        async_rtu::connect_slave(path, config, slave)?
    };
    Ok(Context::new(runtime, async_ctx))
}

// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{io, net::SocketAddr};

use super::{new_runtime, Context};

use crate::{client::tcp::connect_slave as async_connect_slave, slave::Slave};

/// Establish a direct connection to a Modbus TCP coupler.
pub fn connect(socket_addr: SocketAddr) -> io::Result<Context> {
    connect_slave(socket_addr, Slave::tcp_device())
}

/// Connect to any kind of Modbus slave device, probably through a Modbus TCP/RTU
/// gateway that is forwarding messages to/from the corresponding unit identified
/// by the slave parameter.
pub fn connect_slave(socket_addr: SocketAddr, slave: Slave) -> io::Result<Context> {
    let runtime = new_runtime()?;
    let async_ctx = runtime.block_on(async_connect_slave(socket_addr, slave))?;
    Ok(Context::new(runtime, async_ctx))
}

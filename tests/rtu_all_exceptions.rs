// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Execute this test only if `rtu-server` feature is selected.

#![cfg(feature = "rtu-server")]

mod exception;

use std::time::Duration;

use exception::check_client_context;
use modbus_device::{client, rtu::SerialConfig, server::rtu::Device, server::Terminated, Slave};

#[tokio::test]
async fn all_exceptions() -> anyhow::Result<()> {
    let config = SerialConfig::new(115_200);
    let (host_line, device_line) = tokio::io::duplex(1024);

    let mut device = Device::new(exception::store(), Slave(1));
    device.bind(device_line, &config)?;
    let server = tokio::spawn(async move { device.serve().await });

    let mut ctx = client::rtu::attach_slave(host_line, &config, Slave(1))?;
    ctx.set_timeout(Duration::from_secs(1));
    check_client_context(ctx).await;

    // The serial line ends with the host.
    assert!(matches!(server.await?, Ok(Terminated::Finished)));
    Ok(())
}

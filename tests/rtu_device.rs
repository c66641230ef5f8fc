// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

#![cfg(feature = "rtu-server")]

use std::time::Duration;

use tokio::{
    io::{duplex, AsyncReadExt as _, AsyncWriteExt as _},
    time::timeout,
};

use modbus_device::{
    prelude::*,
    rtu::SerialConfig,
    server::{rtu::Device, State},
    Error,
};

fn store() -> Store {
    Store::with_definitions(
        &Definitions::new()
            .with(
                RegisterClass::HoldingRegister,
                "EXAMPLE_HREG",
                Definition::new(93).with_default(19u16),
            )
            .with(
                RegisterClass::Coil,
                "EXAMPLE_COILS",
                Definition::new(0).with_len(10).with_default(false),
            ),
        false,
    )
    .unwrap()
}

#[tokio::test]
async fn foreign_unit_gets_no_response() -> anyhow::Result<()> {
    let config = SerialConfig::new(9600);
    let (mut host, line) = duplex(256);
    let mut device = Device::new(store(), Slave(1));
    device.bind(line, &config)?;

    // read holding register 93 of unit 2
    host.write_all(&[0x02, 0x03, 0x00, 0x5D, 0x00, 0x01, 0x15, 0xEB])
        .await?;
    assert!(!device.process(Some(Duration::from_millis(100))).await?);

    let mut buf = [0; 8];
    let silence = config.timing().silence();
    assert!(timeout(silence, host.read(&mut buf)).await.is_err());
    Ok(())
}

#[tokio::test]
async fn drop_frame_with_invalid_crc() -> anyhow::Result<()> {
    let config = SerialConfig::new(115_200);
    let (mut host, line) = duplex(256);
    let store = store();
    let mut device = Device::new(store.clone(), Slave(1));
    device.bind(line, &config)?;

    // write single register 93 = 44, last CRC byte flipped
    host.write_all(&[0x01, 0x06, 0x00, 0x5D, 0x00, 0x2C, 0x19, 0xC4])
        .await?;
    assert!(!device.process(Some(Duration::from_millis(100))).await?);
    assert_eq!(store.holding_register(93), Ok(19));
    Ok(())
}

#[tokio::test]
async fn host_recovers_after_timeout() -> anyhow::Result<()> {
    let config = SerialConfig::new(115_200);
    let (host_line, device_line) = duplex(256);
    let mut device = Device::new(store(), Slave(1));
    device.bind(device_line, &config)?;
    let close = device.close_handle();
    let serving = tokio::spawn(async move { device.serve().await });

    let mut ctx = rtu::attach_slave(host_line, &config, Slave(2))?;
    ctx.set_timeout(Duration::from_millis(200));
    let err = ctx.read_holding_registers(93, 1).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    ctx.set_slave(Slave(1));
    ctx.set_timeout(Duration::from_secs(1));
    assert_eq!(ctx.read_holding_registers(93, 1).await?, Ok(vec![19]));

    close.close();
    assert!(matches!(serving.await?, Ok(Terminated::Closed)));
    Ok(())
}

#[tokio::test]
async fn broadcast_write_is_executed_silently() -> anyhow::Result<()> {
    let config = SerialConfig::new(115_200);
    let (host_line, device_line) = duplex(256);
    let store = store();
    let mut device = Device::new(store.clone(), vec![Slave(1), Slave(7)]);
    device.bind(device_line, &config)?;
    let serving = tokio::spawn(async move { device.serve().await });

    let mut ctx = rtu::attach_slave(host_line, &config, Slave::broadcast())?;
    ctx.set_timeout(Duration::from_millis(200));
    let err = ctx
        .write_multiple_coils(2, &[true, false, true])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(store.coils(0, 6), Ok(vec![false, false, true, false, true, false]));

    ctx.set_slave(Slave(7));
    ctx.set_timeout(Duration::from_secs(1));
    assert_eq!(ctx.read_coils(2, 3).await?, Ok(vec![true, false, true]));

    drop(ctx);
    assert!(matches!(serving.await?, Ok(Terminated::Finished)));
    Ok(())
}

#[tokio::test]
async fn rebind_after_close() -> anyhow::Result<()> {
    let config = SerialConfig::new(115_200);
    let mut device = Device::new(store(), Slave(1));
    let (_, line) = duplex(256);
    device.bind(line, &config)?;
    device.close();
    assert_eq!(device.state(), State::Closed);

    let (host_line, line) = duplex(256);
    device.bind(line, &config)?;
    assert_eq!(device.state(), State::Bound);
    let serving = tokio::spawn(async move { device.serve().await });

    let mut ctx = rtu::attach_slave(host_line, &config, Slave(1))?;
    ctx.set_timeout(Duration::from_secs(1));
    assert_eq!(ctx.read_holding_registers(93, 1).await?, Ok(vec![19]));
    drop(ctx);
    assert!(matches!(serving.await?, Ok(Terminated::Finished)));
    Ok(())
}

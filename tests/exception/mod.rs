// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use modbus_device::{
    client::{Context, Reader as _, Writer as _},
    store::{Definition, Definitions, RegisterClass, Store, Values},
    ExceptionCode,
};

/// Holding register 0 only accepts values up to 100.
fn reject_above_100(_: RegisterClass, _: u16, values: &Values) -> bool {
    values.clone().into_words().iter().any(|word| *word > 100)
}

pub fn store() -> Store {
    let definitions = Definitions::new()
        .with(
            RegisterClass::Coil,
            "COILS",
            Definition::new(0).with_len(8).with_default(false),
        )
        .with(
            RegisterClass::DiscreteInput,
            "INPUTS",
            Definition::new(0).with_len(8).with_default(true),
        )
        .with(
            RegisterClass::HoldingRegister,
            "SETPOINT",
            Definition::new(0)
                .with_default(50u16)
                .on_pre_set(reject_above_100),
        )
        .with(
            RegisterClass::HoldingRegister,
            "PARAMETERS",
            Definition::new(1).with_len(3).with_default(vec![1u16, 2, 3]),
        )
        .with(
            RegisterClass::InputRegister,
            "MEASUREMENTS",
            Definition::new(0).with_len(2).with_default(7u16),
        );
    Store::with_definitions(&definitions, false).unwrap()
}

pub async fn check_client_context(mut ctx: Context) {
    let response = ctx.read_coils(0x1000, 1).await.expect("communication failed");
    assert!(matches!(response, Err(ExceptionCode::IllegalDataAddress)));

    // one beyond the entry
    let response = ctx
        .read_discrete_inputs(0x00, 9)
        .await
        .expect("communication failed");
    assert!(matches!(response, Err(ExceptionCode::IllegalDataAddress)));

    let response = ctx
        .write_single_coil(100, true)
        .await
        .expect("communication failed");
    assert!(matches!(response, Err(ExceptionCode::IllegalDataAddress)));

    let response = ctx
        .write_multiple_coils(0x00, &[true; 9])
        .await
        .expect("communication failed");
    assert!(matches!(response, Err(ExceptionCode::IllegalDataAddress)));

    let response = ctx
        .read_input_registers(0x00, 126)
        .await
        .expect("communication failed");
    assert!(matches!(response, Err(ExceptionCode::IllegalDataValue)));

    let response = ctx
        .read_holding_registers(0x00, 0)
        .await
        .expect("communication failed");
    assert!(matches!(response, Err(ExceptionCode::IllegalDataValue)));

    let response = ctx
        .write_single_register(0x00, 101)
        .await
        .expect("communication failed");
    assert!(matches!(response, Err(ExceptionCode::IllegalDataValue)));

    let response = ctx
        .write_multiple_registers(0xFFFF, &[1, 2])
        .await
        .expect("communication failed");
    assert!(matches!(response, Err(ExceptionCode::IllegalDataAddress)));

    // The rejected write has not changed anything.
    let response = ctx
        .read_holding_registers(0x00, 4)
        .await
        .expect("communication failed");
    assert_eq!(response, Ok(vec![50, 1, 2, 3]));

    let response = ctx
        .write_single_register(0x00, 100)
        .await
        .expect("communication failed");
    assert_eq!(response, Ok(()));

    let response = ctx
        .read_holding_registers(0x00, 1)
        .await
        .expect("communication failed");
    assert_eq!(response, Ok(vec![100]));
}

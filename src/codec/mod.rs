// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{
    convert::TryFrom,
    io::{self, BufRead as _, Cursor, Error, ErrorKind},
};

use byteorder::{BigEndian, ReadBytesExt as _};
use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};

use crate::{
    error::EchoMismatch,
    frame::{Coil, ResponsePdu, Word},
    Address, ExceptionCode, ExceptionResponse, FunctionCode, Quantity, Request, Response,
};

#[cfg(feature = "rtu")]
pub(crate) mod rtu;

#[cfg(feature = "tcp")]
pub(crate) mod tcp;

/// Maximum request/response PDU size.
///
/// As defined by the Modbus application protocol for both RTU and TCP.
pub(crate) const MAX_PDU_SIZE: usize = 253;

/// Maximum number of coils or discrete inputs per read request.
pub(crate) const MAX_READ_BITS: Quantity = 2000;

/// Maximum number of registers per read request.
pub(crate) const MAX_READ_REGISTERS: Quantity = 125;

/// Maximum number of coils per write request.
pub(crate) const MAX_WRITE_BITS: Quantity = 1968;

/// Maximum number of registers per write request.
pub(crate) const MAX_WRITE_REGISTERS: Quantity = 123;

#[allow(clippy::cast_possible_truncation)]
pub(crate) fn u16_len(len: usize) -> u16 {
    // This type conversion should always be safe, because either
    // the caller is responsible to pass a valid usize or the
    // possible values are limited by the protocol.
    debug_assert!(len <= u16::MAX.into());
    len as u16
}

#[allow(clippy::cast_possible_truncation)]
fn u8_len(len: usize) -> u8 {
    // This type conversion should always be safe, because either
    // the caller is responsible to pass a valid usize or the
    // possible values are limited by the protocol.
    debug_assert!(len <= u8::MAX.into());
    len as u8
}

pub(crate) fn encode_request_pdu(buf: &mut BytesMut, request: &Request<'_>) {
    use crate::frame::Request::*;
    buf.put_u8(request.function_code().value());
    match request {
        ReadCoils(address, quantity)
        | ReadDiscreteInputs(address, quantity)
        | ReadInputRegisters(address, quantity)
        | ReadHoldingRegisters(address, quantity) => {
            buf.put_u16(*address);
            buf.put_u16(*quantity);
        }
        WriteSingleCoil(address, state) => {
            buf.put_u16(*address);
            buf.put_u16(bool_to_coil(*state));
        }
        WriteMultipleCoils(address, coils) => {
            buf.put_u16(*address);
            buf.put_u16(u16_len(coils.len()));
            buf.put_u8(u8_len(packed_coils_size(coils)));
            encode_packed_coils(buf, coils);
        }
        WriteSingleRegister(address, word) => {
            buf.put_u16(*address);
            buf.put_u16(*word);
        }
        WriteMultipleRegisters(address, words) => {
            buf.put_u16(*address);
            let len = words.len();
            buf.put_u16(u16_len(len));
            buf.put_u8(u8_len(len * 2));
            for w in words.as_ref() {
                buf.put_u16(*w);
            }
        }
    }
}

pub(crate) fn encode_response_pdu(buf: &mut BytesMut, response: &Response) {
    use crate::frame::Response::*;
    buf.put_u8(response.function_code().value());
    match response {
        ReadCoils(coils) | ReadDiscreteInputs(coils) => {
            buf.put_u8(u8_len(packed_coils_size(coils)));
            encode_packed_coils(buf, coils);
        }
        ReadInputRegisters(registers) | ReadHoldingRegisters(registers) => {
            buf.put_u8(u8_len(registers.len() * 2));
            for r in registers {
                buf.put_u16(*r);
            }
        }
        WriteSingleCoil(address, state) => {
            buf.put_u16(*address);
            buf.put_u16(bool_to_coil(*state));
        }
        WriteMultipleCoils(address, quantity) | WriteMultipleRegisters(address, quantity) => {
            buf.put_u16(*address);
            buf.put_u16(*quantity);
        }
        WriteSingleRegister(address, word) => {
            buf.put_u16(*address);
            buf.put_u16(*word);
        }
    }
}

pub(crate) fn encode_exception_response_pdu(buf: &mut BytesMut, response: ExceptionResponse) {
    debug_assert!(response.function.value() < 0x80);
    buf.put_u8(response.function.value() + 0x80);
    buf.put_u8(response.exception.into());
}

pub(crate) fn encode_response_result_pdu(
    buf: &mut BytesMut,
    result: &Result<Response, ExceptionResponse>,
) {
    match result {
        Ok(response) => encode_response_pdu(buf, response),
        Err(exception) => encode_exception_response_pdu(buf, *exception),
    }
}

fn read_u16_be(reader: &mut impl io::Read) -> io::Result<u16> {
    reader.read_u16::<BigEndian>()
}

fn read_word(rdr: &mut Cursor<&[u8]>) -> Result<Word, ExceptionCode> {
    read_u16_be(rdr).map_err(|_| ExceptionCode::IllegalDataValue)
}

fn read_byte(rdr: &mut Cursor<&[u8]>) -> Result<u8, ExceptionCode> {
    rdr.read_u8().map_err(|_| ExceptionCode::IllegalDataValue)
}

fn check_quantity(address: Address, quantity: Quantity, max: Quantity) -> Result<(), ExceptionCode> {
    if quantity == 0 || quantity > max {
        return Err(ExceptionCode::IllegalDataValue);
    }
    if u32::from(address) + u32::from(quantity) > 0x1_0000 {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(())
}

/// Parses the data following the function code of a request PDU.
fn parse_request(function: FunctionCode, data: &[u8]) -> Result<Request<'static>, ExceptionCode> {
    use crate::frame::Request::*;

    let rdr = &mut Cursor::new(data);
    let req = match function {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            let address = read_word(rdr)?;
            let quantity = read_word(rdr)?;
            check_quantity(address, quantity, MAX_READ_BITS)?;
            if function == FunctionCode::ReadCoils {
                ReadCoils(address, quantity)
            } else {
                ReadDiscreteInputs(address, quantity)
            }
        }
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            let address = read_word(rdr)?;
            let quantity = read_word(rdr)?;
            check_quantity(address, quantity, MAX_READ_REGISTERS)?;
            if function == FunctionCode::ReadHoldingRegisters {
                ReadHoldingRegisters(address, quantity)
            } else {
                ReadInputRegisters(address, quantity)
            }
        }
        FunctionCode::WriteSingleCoil => {
            let address = read_word(rdr)?;
            let coil = coil_to_bool(read_word(rdr)?).map_err(|_| ExceptionCode::IllegalDataValue)?;
            WriteSingleCoil(address, coil)
        }
        FunctionCode::WriteSingleRegister => {
            let address = read_word(rdr)?;
            let word = read_word(rdr)?;
            WriteSingleRegister(address, word)
        }
        FunctionCode::WriteMultipleCoils => {
            let address = read_word(rdr)?;
            let quantity = read_word(rdr)?;
            let byte_count = usize::from(read_byte(rdr)?);
            check_quantity(address, quantity, MAX_WRITE_BITS)?;
            if byte_count != (usize::from(quantity) + 7) / 8 || data.len() < 5 + byte_count {
                return Err(ExceptionCode::IllegalDataValue);
            }
            let packed_coils = &data[5..5 + byte_count];
            rdr.consume(byte_count);
            WriteMultipleCoils(address, decode_packed_coils(packed_coils, quantity).into())
        }
        FunctionCode::WriteMultipleRegisters => {
            let address = read_word(rdr)?;
            let quantity = read_word(rdr)?;
            let byte_count = read_byte(rdr)?;
            check_quantity(address, quantity, MAX_WRITE_REGISTERS)?;
            if u16::from(byte_count) != quantity * 2 {
                return Err(ExceptionCode::IllegalDataValue);
            }
            let mut words = Vec::with_capacity(quantity.into());
            for _ in 0..quantity {
                words.push(read_word(rdr)?);
            }
            WriteMultipleRegisters(address, words.into())
        }
        FunctionCode::Unsupported(_) => return Err(ExceptionCode::IllegalFunction),
    };
    // Verify that all data has been consumed and decoded.
    if rdr.has_remaining() {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok(req)
}

/// Decodes a request PDU received by a device.
///
/// The outer error means the PDU cannot be answered at all and must be
/// dropped. The inner error is the exception response the device has to
/// send instead of dispatching the request.
pub(crate) fn decode_request_pdu(
    pdu: &[u8],
) -> io::Result<Result<Request<'static>, ExceptionResponse>> {
    let Some((&fn_code, data)) = pdu.split_first() else {
        return Err(Error::new(ErrorKind::InvalidData, "empty request PDU"));
    };
    if fn_code >= 0x80 {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("invalid function code: 0x{fn_code:02X}"),
        ));
    }
    if pdu.len() > MAX_PDU_SIZE {
        return Err(Error::new(
            ErrorKind::InvalidData,
            "request PDU size exceeded",
        ));
    }
    let function = FunctionCode::new(fn_code);
    Ok(parse_request(function, data).map_err(|exception| ExceptionResponse {
        function,
        exception,
    }))
}

fn read_packed_bits(rdr: &mut Cursor<&Bytes>, bytes: &Bytes) -> io::Result<Vec<Coil>> {
    let byte_count = usize::from(rdr.read_u8()?);
    if bytes.len() < 2 + byte_count {
        return Err(Error::new(ErrorKind::InvalidData, "too short"));
    }
    let packed_coils = &bytes[2..2 + byte_count];
    rdr.consume(byte_count);
    // Here we have no information about the exact requested quantity so we just
    // unpack the whole byte.
    Ok(decode_packed_coils(packed_coils, u16_len(byte_count * 8)))
}

fn read_words(rdr: &mut Cursor<&Bytes>) -> io::Result<Vec<Word>> {
    let byte_count = rdr.read_u8()?;
    if byte_count % 2 != 0 {
        return Err(Error::new(ErrorKind::InvalidData, "invalid quantity"));
    }
    let quantity = byte_count / 2;
    let mut data = Vec::with_capacity(quantity.into());
    for _ in 0..quantity {
        data.push(read_u16_be(rdr)?);
    }
    Ok(data)
}

impl TryFrom<Bytes> for Response {
    type Error = Error;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        use crate::frame::Response::*;
        if bytes.len() > MAX_PDU_SIZE {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "response PDU size exceeded",
            ));
        }
        let rdr = &mut Cursor::new(&bytes);
        let fn_code = rdr.read_u8()?;
        let rsp = match FunctionCode::new(fn_code) {
            FunctionCode::ReadCoils => ReadCoils(read_packed_bits(rdr, &bytes)?),
            FunctionCode::ReadDiscreteInputs => ReadDiscreteInputs(read_packed_bits(rdr, &bytes)?),
            FunctionCode::WriteSingleCoil => {
                WriteSingleCoil(read_u16_be(rdr)?, coil_to_bool(read_u16_be(rdr)?)?)
            }
            FunctionCode::WriteMultipleCoils => {
                WriteMultipleCoils(read_u16_be(rdr)?, read_u16_be(rdr)?)
            }
            FunctionCode::ReadInputRegisters => ReadInputRegisters(read_words(rdr)?),
            FunctionCode::ReadHoldingRegisters => ReadHoldingRegisters(read_words(rdr)?),
            FunctionCode::WriteSingleRegister => {
                WriteSingleRegister(read_u16_be(rdr)?, read_u16_be(rdr)?)
            }
            FunctionCode::WriteMultipleRegisters => {
                WriteMultipleRegisters(read_u16_be(rdr)?, read_u16_be(rdr)?)
            }
            FunctionCode::Unsupported(code) => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("unsupported function code: 0x{code:02X}"),
                ));
            }
        };
        // Verify that all data has been consumed and decoded.
        if rdr.has_remaining() {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "undecoded response data",
            ));
        }
        Ok(rsp)
    }
}

impl TryFrom<Bytes> for ExceptionResponse {
    type Error = Error;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        let mut rdr = Cursor::new(&bytes);
        let fn_err_code = rdr.read_u8()?;
        if fn_err_code < 0x80 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "Invalid exception function code",
            ));
        }
        let function = fn_err_code - 0x80;
        let exception = ExceptionCode::new(rdr.read_u8()?);
        if rdr.has_remaining() {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "undecoded exception data",
            ));
        }
        Ok(ExceptionResponse {
            function: FunctionCode::new(function),
            exception,
        })
    }
}

impl TryFrom<Bytes> for ResponsePdu {
    type Error = Error;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        let fn_code = Cursor::new(&bytes).read_u8()?;
        let pdu = if fn_code < 0x80 {
            Response::try_from(bytes)?.into()
        } else {
            ExceptionResponse::try_from(bytes)?.into()
        };
        Ok(pdu)
    }
}

fn bool_to_coil(state: bool) -> u16 {
    if state {
        0xFF00
    } else {
        0x0000
    }
}

fn coil_to_bool(coil: u16) -> io::Result<bool> {
    match coil {
        0xFF00 => Ok(true),
        0x0000 => Ok(false),
        _ => Err(Error::new(
            ErrorKind::InvalidData,
            format!("Invalid coil value: 0x{coil:04X}"),
        )),
    }
}

fn packed_coils_size(coils: &[Coil]) -> usize {
    (coils.len() + 7) / 8
}

/// Packs coil `i` into bit `7 - i % 8` of byte `i / 8`, most significant
/// bit first.
fn encode_packed_coils(buf: &mut BytesMut, coils: &[Coil]) -> usize {
    let packed_coils_size = packed_coils_size(coils);
    let offset = buf.len();
    buf.resize(offset + packed_coils_size, 0);
    let buf = &mut buf[offset..];
    for (i, b) in coils.iter().enumerate() {
        let v = u8::from(*b); // 0 or 1
        buf[i / 8] |= v << (7 - i % 8);
    }
    packed_coils_size
}

fn decode_packed_coils(bytes: &[u8], count: u16) -> Vec<Coil> {
    let mut res = Vec::with_capacity(count.into());
    for i in 0usize..count.into() {
        res.push((bytes[i / 8] >> (7 - i % 8)) & 0b1 > 0);
    }
    res
}

pub(crate) fn request_pdu_size(request: &Request<'_>) -> io::Result<usize> {
    use crate::frame::Request::*;
    let size = match request {
        ReadCoils(_, _)
        | ReadDiscreteInputs(_, _)
        | ReadInputRegisters(_, _)
        | ReadHoldingRegisters(_, _)
        | WriteSingleRegister(_, _)
        | WriteSingleCoil(_, _) => 5,
        WriteMultipleCoils(_, coils) => 6 + packed_coils_size(coils),
        WriteMultipleRegisters(_, data) => 6 + data.len() * 2,
    };
    if size > MAX_PDU_SIZE {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            "request PDU size exceeded",
        ));
    }
    Ok(size)
}

pub(crate) fn response_pdu_size(response: &Response) -> io::Result<usize> {
    use crate::frame::Response::*;
    let size = match response {
        ReadCoils(coils) | ReadDiscreteInputs(coils) => 2 + packed_coils_size(coils),
        WriteSingleCoil(_, _)
        | WriteMultipleCoils(_, _)
        | WriteMultipleRegisters(_, _)
        | WriteSingleRegister(_, _) => 5,
        ReadInputRegisters(data) | ReadHoldingRegisters(data) => 2 + data.len() * 2,
    };
    if size > MAX_PDU_SIZE {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            "response PDU size exceeded",
        ));
    }
    Ok(size)
}

pub(crate) fn response_result_pdu_size(
    result: &Result<Response, ExceptionResponse>,
) -> io::Result<usize> {
    match result {
        Ok(response) => response_pdu_size(response),
        Err(_) => Ok(2),
    }
}

/// Checks that a write response echoes the request it answers.
///
/// Read requests are not checked here.
pub(crate) fn verify_write_echo(
    request: &Request<'_>,
    response: &Response,
) -> Result<(), EchoMismatch> {
    use crate::frame::Request::*;
    let expected = match request {
        WriteSingleCoil(address, coil) => Response::WriteSingleCoil(*address, *coil),
        WriteSingleRegister(address, word) => Response::WriteSingleRegister(*address, *word),
        WriteMultipleCoils(address, coils) => {
            Response::WriteMultipleCoils(*address, u16_len(coils.len()))
        }
        WriteMultipleRegisters(address, words) => {
            Response::WriteMultipleRegisters(*address, u16_len(words.len()))
        }
        ReadCoils(_, _)
        | ReadDiscreteInputs(_, _)
        | ReadInputRegisters(_, _)
        | ReadHoldingRegisters(_, _) => return Ok(()),
    };
    if &expected == response {
        return Ok(());
    }
    Err(EchoMismatch {
        function: request.function_code(),
        expected,
        actual: response.clone(),
    })
}

/// Reinterprets register words as two's complement values.
#[must_use]
pub fn to_signed(words: &[Word]) -> Vec<i16> {
    words
        .iter()
        .map(|word| i16::from_be_bytes(word.to_be_bytes()))
        .collect()
}

/// Converts signed values into the register words transmitted on the wire.
#[must_use]
pub fn to_unsigned(values: &[i16]) -> Vec<Word> {
    values
        .iter()
        .map(|value| u16::from_be_bytes(value.to_be_bytes()))
        .collect()
}

// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::io::{Error, ErrorKind, Result};

use bytes::{BufMut as _, Bytes, BytesMut};

use crate::{
    frame::rtu::*,
    frame::{ExceptionResponse, RequestPdu, Response, ResponsePdu},
    slave::Slave,
};

use super::*;

/// Address, function code and the two CRC bytes.
const MIN_FRAME_LEN: usize = 4;

/// The shortest request of any supported function code.
pub(crate) const MIN_REQUEST_FRAME_LEN: usize = 8;

// [Modbus over Serial Line Specification and Implementation Guide V1.02](http://modbus.org/docs/Modbus_over_serial_line_V1_02.pdf), page 13
// "The maximum size of a Modbus RTU frame is 256 bytes."
pub(crate) const MAX_FRAME_LEN: usize = 256;

#[allow(clippy::cast_possible_truncation)]
const fn crc_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x0001 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC_TABLE: [u16; 256] = crc_table();

/// CRC-16/MODBUS, transmitted low byte first.
pub(crate) fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFF, |crc, byte| {
        (crc >> 8) ^ CRC_TABLE[usize::from((crc ^ u16::from(*byte)) & 0x00FF)]
    })
}

fn check_crc(frame: &[u8]) -> Result<()> {
    let (data, crc) = frame.split_at(frame.len() - 2);
    let actual = u16::from_le_bytes([crc[0], crc[1]]);
    let expected = crc16(data);
    if expected != actual {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("Invalid CRC: expected = 0x{expected:0>4X}, actual = 0x{actual:0>4X}"),
        ));
    }
    Ok(())
}

fn finish_frame(buf: &mut BytesMut, start: usize) {
    let crc = crc16(&buf[start..]);
    buf.put_u16_le(crc);
}

pub(crate) fn encode_request_adu(buf: &mut BytesMut, adu: &RequestAdu<'_>) -> Result<()> {
    let RequestAdu {
        hdr,
        pdu: RequestPdu(request),
    } = adu;
    let pdu_len = request_pdu_size(request)?;
    buf.reserve(pdu_len + 3);
    let start = buf.len();
    buf.put_u8(hdr.slave.into());
    encode_request_pdu(buf, request);
    finish_frame(buf, start);
    Ok(())
}

pub(crate) fn encode_response(
    buf: &mut BytesMut,
    slave: Slave,
    result: &std::result::Result<Response, ExceptionResponse>,
) -> Result<()> {
    let pdu_len = response_result_pdu_size(result)?;
    buf.reserve(pdu_len + 3);
    let start = buf.len();
    buf.put_u8(slave.into());
    encode_response_result_pdu(buf, result);
    finish_frame(buf, start);
    Ok(())
}

/// Splits a received request frame into unit address and PDU.
///
/// The caller has already checked the minimum length and the unit
/// address.
pub(crate) fn decode_request_frame(frame: &[u8]) -> Result<(Slave, Bytes)> {
    if frame.len() < MIN_REQUEST_FRAME_LEN {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("request frame too short: {} bytes", frame.len()),
        ));
    }
    check_crc(frame)?;
    let slave = Slave(frame[0]);
    let pdu = Bytes::copy_from_slice(&frame[1..frame.len() - 2]);
    Ok((slave, pdu))
}

/// Length of the response frame at the start of `buf`, once it is
/// complete.
///
/// Exception responses have a fixed size, read responses carry their
/// byte count and all other responses echo address and value.
pub(crate) fn response_frame_len(buf: &[u8]) -> Option<usize> {
    let fn_code = *buf.get(1)?;
    let len = match fn_code {
        0x80..=0xFF => 5,
        0x01..=0x04 => 3 + usize::from(*buf.get(2)?) + 2,
        _ => 8,
    };
    (buf.len() >= len).then_some(len)
}

pub(crate) fn decode_response_adu(frame: &[u8]) -> Result<ResponseAdu> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("response frame too short: {} bytes", frame.len()),
        ));
    }
    check_crc(frame)?;
    let hdr = Header {
        slave: Slave(frame[0]),
    };
    let pdu = ResponsePdu::try_from(Bytes::copy_from_slice(&frame[1..frame.len() - 2]))?;
    Ok(ResponseAdu { hdr, pdu })
}

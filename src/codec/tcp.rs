// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::io::{Error, ErrorKind, Result};

use byteorder::{BigEndian, ByteOrder as _};
use bytes::{BufMut as _, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{tcp::*, RequestPdu, ResponsePdu};

use super::*;

const HEADER_LEN: usize = 7;

const PROTOCOL_ID: u16 = 0x0000; // TCP

/// Unit id plus the shortest and the longest possible PDU.
const MIN_LENGTH_FIELD: usize = 2;
const MAX_LENGTH_FIELD: usize = MAX_PDU_SIZE + 1;

/// Splits the next complete MBAP frame off `buf`.
///
/// A protocol id other than zero or an impossible length field cannot be
/// resynchronized and is reported as an error.
fn decode_frame(buf: &mut BytesMut) -> Result<Option<(Header, Bytes)>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let protocol_id = BigEndian::read_u16(&buf[2..4]);
    if protocol_id != PROTOCOL_ID {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("Invalid protocol identifier: expected = {PROTOCOL_ID}, actual = {protocol_id}"),
        ));
    }

    // len = bytes of PDU + one byte (unit ID)
    let len = usize::from(BigEndian::read_u16(&buf[4..6]));
    if !(MIN_LENGTH_FIELD..=MAX_LENGTH_FIELD).contains(&len) {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("Invalid length field: {len}"),
        ));
    }

    let frame_len = HEADER_LEN - 1 + len;
    if buf.len() < frame_len {
        buf.reserve(frame_len - buf.len());
        return Ok(None);
    }

    let header_data = buf.split_to(HEADER_LEN);
    let pdu = buf.split_to(len - 1).freeze();
    let hdr = Header {
        transaction_id: BigEndian::read_u16(&header_data[0..2]),
        unit_id: header_data[6],
    };
    Ok(Some((hdr, pdu)))
}

fn put_header(buf: &mut BytesMut, hdr: Header, pdu_len: usize) {
    buf.reserve(HEADER_LEN + pdu_len);
    buf.put_u16(hdr.transaction_id);
    buf.put_u16(PROTOCOL_ID);
    buf.put_u16(u16_len(pdu_len + 1));
    buf.put_u8(hdr.unit_id);
}

/// Host side: encodes requests, decodes responses.
#[derive(Debug, Default)]
pub(crate) struct ClientCodec;

impl Decoder for ClientCodec {
    type Item = ResponseAdu;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ResponseAdu>> {
        let Some((hdr, pdu_data)) = decode_frame(buf)? else {
            return Ok(None);
        };
        let pdu = ResponsePdu::try_from(pdu_data)?;
        Ok(Some(ResponseAdu { hdr, pdu }))
    }
}

impl<'a> Encoder<RequestAdu<'a>> for ClientCodec {
    type Error = Error;

    fn encode(&mut self, adu: RequestAdu<'a>, buf: &mut BytesMut) -> Result<()> {
        let RequestAdu {
            hdr,
            pdu: RequestPdu(request),
        } = adu;
        let pdu_len = request_pdu_size(&request)?;
        put_header(buf, hdr, pdu_len);
        encode_request_pdu(buf, &request);
        Ok(())
    }
}

/// Device side: decodes request frames, encodes responses.
///
/// The PDU of a request is left encoded so that the unit id can be
/// checked first.
#[derive(Debug, Default)]
pub(crate) struct ServerCodec;

impl Decoder for ServerCodec {
    type Item = RequestFrame;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RequestFrame>> {
        let frame = decode_frame(buf)?.map(|(hdr, pdu)| RequestFrame { hdr, pdu });
        Ok(frame)
    }
}

impl Encoder<ResponseAdu> for ServerCodec {
    type Error = Error;

    fn encode(&mut self, adu: ResponseAdu, buf: &mut BytesMut) -> Result<()> {
        let ResponseAdu {
            hdr,
            pdu: ResponsePdu(result),
        } = adu;
        let pdu_len = response_result_pdu_size(&result)?;
        put_header(buf, hdr, pdu_len);
        encode_response_result_pdu(buf, &result);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::frame::{ExceptionCode, ExceptionResponse, FunctionCode, Request, Response};

    mod client {

        use super::*;

        #[test]
        fn decode_header_fragment() {
            let mut codec = ClientCodec;
            let mut buf = BytesMut::from(&[0x00, 0x11, 0x00, 0x00, 0x00, 0x00][..]);
            let res = codec.decode(&mut buf).unwrap();
            assert!(res.is_none());
            assert_eq!(buf.len(), 6);
        }

        #[test]
        fn decode_partly_received_message() {
            let mut codec = ClientCodec;
            let mut buf = BytesMut::from(
                &[
                    0x00, // transaction id HI
                    0x11, // transaction id LO
                    0x00, // protocol id HI
                    0x00, // protocol id LO
                    0x00, // length HI
                    0x03, // length LO
                    0x66, // unit id
                    0x02, // function code
                ][..],
            );
            let res = codec.decode(&mut buf).unwrap();
            assert!(res.is_none());
            assert_eq!(buf.len(), 8);
        }

        #[test]
        fn decode_exception_message() {
            let mut codec = ClientCodec;
            let mut buf = BytesMut::from(
                &[
                    0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x66, 0x82, // exception = 0x80 + 0x02
                    0x03, //
                    0x00, // next frame
                ][..],
            );
            let ResponseAdu { hdr, pdu } = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(buf.len(), 1);
            assert_eq!(
                hdr,
                Header {
                    transaction_id: 0,
                    unit_id: 0x66,
                }
            );
            assert_eq!(
                pdu,
                ResponsePdu(Err(ExceptionResponse {
                    function: FunctionCode::ReadDiscreteInputs,
                    exception: ExceptionCode::IllegalDataValue,
                }))
            );
        }

        #[test]
        fn decode_with_invalid_protocol_id() {
            let mut codec = ClientCodec;
            let mut buf = BytesMut::from(
                &[
                    0x00, 0x00, //
                    0x33, // protocol id HI
                    0x12, // protocol id LO
                    0x00, // length HI
                    0x03, // length LO
                    0x66, // unit id
                    0x82, 0x03,
                ][..],
            );
            let err = codec.decode(&mut buf).err().unwrap();
            assert_eq!(err.kind(), ErrorKind::InvalidData);
            assert_eq!(
                err.to_string(),
                "Invalid protocol identifier: expected = 0, actual = 13074"
            );
        }

        #[test]
        fn decode_with_invalid_length() {
            let mut codec = ClientCodec;
            let mut buf = BytesMut::from(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x66][..]);
            let err = codec.decode(&mut buf).err().unwrap();
            assert_eq!(err.kind(), ErrorKind::InvalidData);

            let mut buf = BytesMut::from(&[0x00, 0x00, 0x00, 0x00, 0x00, 0xFF, 0x66][..]);
            assert!(codec.decode(&mut buf).is_err());
        }

        #[test]
        fn encode_read_request() {
            let mut codec = ClientCodec;
            let mut buf = BytesMut::new();
            let req = Request::ReadInputRegisters(0x23, 5);
            let adu = RequestAdu {
                hdr: Header {
                    transaction_id: 0x1234,
                    unit_id: 0x01,
                },
                pdu: req.into(),
            };
            codec.encode(adu, &mut buf).unwrap();
            assert_eq!(
                &buf[..],
                &[0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x01, 0x04, 0x00, 0x23, 0x00, 0x05]
            );
        }

        #[test]
        fn encode_oversized_request() {
            let mut codec = ClientCodec;
            let mut buf = BytesMut::new();
            let words = vec![0; 124];
            let adu = RequestAdu {
                hdr: Header {
                    transaction_id: 0,
                    unit_id: 0x01,
                },
                pdu: Request::WriteMultipleRegisters(0, words.into()).into(),
            };
            assert!(codec.encode(adu, &mut buf).is_err());
            assert!(buf.is_empty());
        }
    }

    mod server {

        use super::*;

        #[test]
        fn decode_request_frame() {
            let mut codec = ServerCodec;
            let mut buf = BytesMut::from(
                &[
                    0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x5D, 0x00, 0x2C,
                ][..],
            );
            let frame = codec.decode(&mut buf).unwrap().unwrap();
            assert!(buf.is_empty());
            assert_eq!(
                frame.hdr,
                Header {
                    transaction_id: 7,
                    unit_id: 1,
                }
            );
            assert_eq!(&frame.pdu[..], &[0x06, 0x00, 0x5D, 0x00, 0x2C]);
        }

        #[test]
        fn decode_two_frames_from_one_read() {
            let mut codec = ServerCodec;
            let mut buf = BytesMut::from(
                &[
                    0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01, //
                    0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x01, 0x00, 0x01,
                ][..],
            );
            let first = codec.decode(&mut buf).unwrap().unwrap();
            let second = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(first.hdr.transaction_id, 1);
            assert_eq!(second.hdr.transaction_id, 2);
            assert!(codec.decode(&mut buf).unwrap().is_none());
        }

        #[test]
        fn encode_response() {
            let mut codec = ServerCodec;
            let mut buf = BytesMut::new();
            let adu = ResponseAdu {
                hdr: Header {
                    transaction_id: 0xABCD,
                    unit_id: 0x01,
                },
                pdu: Response::ReadHoldingRegisters(vec![44]).into(),
            };
            codec.encode(adu, &mut buf).unwrap();
            assert_eq!(
                &buf[..],
                &[0xAB, 0xCD, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x2C]
            );
        }

        #[test]
        fn encode_exception_response() {
            let mut codec = ServerCodec;
            let mut buf = BytesMut::new();
            let adu = ResponseAdu {
                hdr: Header {
                    transaction_id: 0x0001,
                    unit_id: 0xFF,
                },
                pdu: ExceptionResponse {
                    function: FunctionCode::Unsupported(0x2B),
                    exception: ExceptionCode::IllegalFunction,
                }
                .into(),
            };
            codec.encode(adu, &mut buf).unwrap();
            assert_eq!(
                &buf[..],
                &[0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0xFF, 0xAB, 0x01]
            );
        }
    }
}

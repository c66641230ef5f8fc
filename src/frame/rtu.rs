// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::*;

use crate::{ProtocolError, Result, Slave};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Header {
    pub(crate) slave: Slave,
}

#[derive(Debug, Clone)]
pub(crate) struct RequestAdu<'a> {
    pub(crate) hdr: Header,
    pub(crate) pdu: RequestPdu<'a>,
}

impl RequestAdu<'_> {
    pub(crate) fn context(&self) -> RequestContext {
        RequestContext {
            function_code: self.pdu.0.function_code(),
            header: self.hdr,
        }
    }
}

/// What is needed to match a response with its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RequestContext {
    pub(crate) function_code: FunctionCode,
    pub(crate) header: Header,
}

#[derive(Debug, Clone)]
pub(crate) struct ResponseAdu {
    pub(crate) hdr: Header,
    pub(crate) pdu: ResponsePdu,
}

impl ResponseAdu {
    pub(crate) fn try_into_response(self, request_context: RequestContext) -> Result<Response> {
        let RequestContext {
            function_code: req_function_code,
            header: req_hdr,
        } = request_context;

        let ResponseAdu {
            hdr: rsp_hdr,
            pdu: rsp_pdu,
        } = self;
        let ResponsePdu(result) = rsp_pdu;

        if let Err(message) = verify_response_header(&req_hdr, &rsp_hdr) {
            return Err(ProtocolError::HeaderMismatch { message, result }.into());
        }

        // Match function codes of request and response.
        let rsp_function_code = match &result {
            Ok(response) => response.function_code(),
            Err(ExceptionResponse { function, .. }) => *function,
        };
        if req_function_code != rsp_function_code {
            return Err(ProtocolError::FunctionCodeMismatch {
                request: req_function_code,
                result,
            }
            .into());
        }

        Ok(result.map_err(
            |ExceptionResponse {
                 function: _,
                 exception,
             }| exception,
        ))
    }
}

#[cfg(test)]
mod tests {
    use crate::Error;

    use super::*;

    fn context(slave: u8, function_code: FunctionCode) -> RequestContext {
        RequestContext {
            function_code,
            header: Header {
                slave: Slave(slave),
            },
        }
    }

    #[test]
    fn validate_same_headers() {
        // Given
        let req_hdr = Header { slave: Slave(0) };
        let rsp_hdr = Header { slave: Slave(0) };

        // When
        let result = verify_response_header(&req_hdr, &rsp_hdr);

        // Then
        assert!(result.is_ok());
    }

    #[test]
    fn invalid_validate_not_same_slave_id() {
        // Given
        let req_hdr = Header { slave: Slave(0) };
        let rsp_hdr = Header { slave: Slave(5) };

        // When
        let result = verify_response_header(&req_hdr, &rsp_hdr);

        // Then
        assert!(result.is_err());
    }

    #[test]
    fn exception_with_matching_function_code() {
        // Given
        let adu = ResponseAdu {
            hdr: Header { slave: Slave(1) },
            pdu: ExceptionResponse {
                function: FunctionCode::ReadHoldingRegisters,
                exception: ExceptionCode::IllegalDataAddress,
            }
            .into(),
        };

        // When
        let result = adu.try_into_response(context(1, FunctionCode::ReadHoldingRegisters));

        // Then
        assert!(matches!(result, Ok(Err(ExceptionCode::IllegalDataAddress))));
    }

    #[test]
    fn reject_mismatching_function_code() {
        // Given
        let adu = ResponseAdu {
            hdr: Header { slave: Slave(1) },
            pdu: Response::ReadCoils(vec![true]).into(),
        };

        // When
        let result = adu.try_into_response(context(1, FunctionCode::ReadDiscreteInputs));

        // Then
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::FunctionCodeMismatch { .. }))
        ));
    }
}

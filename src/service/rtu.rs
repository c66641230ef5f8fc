// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{fmt, io};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    codec::rtu::{decode_response_adu, encode_request_adu},
    frame::{rtu::*, *},
    rtu::Framer,
    slave::*,
    Result,
};

/// Modbus RTU client
#[derive(Debug)]
pub(crate) struct Client<T> {
    framer: Framer<T>,
    slave: Slave,
}

impl<T> Client<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(framer: Framer<T>, slave: Slave) -> Self {
        Self { framer, slave }
    }

    fn next_request_adu<'a, R>(&self, req: R) -> RequestAdu<'a>
    where
        R: Into<RequestPdu<'a>>,
    {
        let hdr = Header { slave: self.slave };
        let pdu = req.into();
        RequestAdu { hdr, pdu }
    }

    pub(crate) async fn call(&mut self, req: Request<'_>) -> Result<Response> {
        log::debug!("Call {req:?}");
        let req_adu = self.next_request_adu(req);
        let req_context = req_adu.context();

        let mut buf = BytesMut::new();
        encode_request_adu(&mut buf, &req_adu)?;

        self.framer.discard_input().await?;
        self.framer.send_frame(&buf).await?;
        let frame = self.framer.recv_response().await?;
        let res_adu = decode_response_adu(&frame)?;
        res_adu.try_into_response(req_context)
    }
}

impl<T> SlaveContext for Client<T> {
    fn set_slave(&mut self, slave: Slave) {
        self.slave = slave;
    }
}

#[async_trait::async_trait]
impl<T> crate::client::Client for Client<T>
where
    T: fmt::Debug + AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn call(&mut self, req: Request<'_>) -> Result<Response> {
        Client::call(self, req).await
    }

    async fn disconnect(&mut self) -> io::Result<()> {
        self.framer.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use core::{
        pin::Pin,
        task::{Context, Poll},
    };

    use tokio::io::{duplex, AsyncReadExt as _, AsyncWriteExt as _, ReadBuf};

    use crate::{rtu::SerialConfig, Error, ProtocolError};

    use super::*;

    #[derive(Debug)]
    struct MockTransport;

    impl AsyncRead for MockTransport {
        fn poll_read(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for MockTransport {
        fn poll_write(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn client<T>(transport: T, slave: u8) -> Client<T>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let framer = Framer::new(transport, SerialConfig::new(115_200).timing());
        Client::new(framer, Slave(slave))
    }

    #[tokio::test]
    async fn handle_closed_line() {
        let mut client = client(MockTransport, 1);
        let res = client.call(Request::ReadCoils(0x00, 5)).await;
        assert!(matches!(
            res,
            Err(Error::Transport(err)) if err.kind() == io::ErrorKind::UnexpectedEof
        ));
    }

    #[tokio::test]
    async fn read_holding_register() {
        let (line, mut device) = duplex(256);
        let mut client = client(line, 1);
        let device = tokio::spawn(async move {
            let mut request = [0; 8];
            device.read_exact(&mut request).await.unwrap();
            device
                .write_all(&[0x01, 0x03, 0x02, 0x00, 0x2C, 0xB9, 0x99])
                .await
                .unwrap();
            request
        });
        let response = client
            .call(Request::ReadHoldingRegisters(0x5D, 1))
            .await
            .unwrap();
        assert_eq!(response, Ok(Response::ReadHoldingRegisters(vec![44])));
        assert_eq!(
            device.await.unwrap(),
            [0x01, 0x03, 0x00, 0x5D, 0x00, 0x01, 0x15, 0xD8]
        );
    }

    #[tokio::test]
    async fn reject_response_from_other_unit() {
        let (line, mut device) = duplex(256);
        let mut client = client(line, 2);
        tokio::spawn(async move {
            let mut request = [0; 8];
            device.read_exact(&mut request).await.unwrap();
            device
                .write_all(&[0x01, 0x03, 0x02, 0x00, 0x2C, 0xB9, 0x99])
                .await
                .unwrap();
            device
        });
        let res = client.call(Request::ReadHoldingRegisters(0x5D, 1)).await;
        assert!(matches!(
            res,
            Err(Error::Protocol(ProtocolError::HeaderMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn reject_response_with_invalid_crc() {
        let (line, mut device) = duplex(256);
        let mut client = client(line, 1);
        tokio::spawn(async move {
            let mut request = [0; 8];
            device.read_exact(&mut request).await.unwrap();
            device
                .write_all(&[0x01, 0x83, 0x02, 0xF1, 0xC0])
                .await
                .unwrap();
            device
        });
        let res = client.call(Request::ReadHoldingRegisters(0x5D, 1)).await;
        assert!(matches!(
            res,
            Err(Error::Transport(err)) if err.kind() == io::ErrorKind::InvalidData
        ));
    }
}

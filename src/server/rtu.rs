// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus RTU device

use std::{fmt, io, time::Duration};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    codec::{self, rtu::MIN_REQUEST_FRAME_LEN},
    error::{ConfigError, Error},
    rtu::{DirectionControl, Framer, SerialConfig},
    slave::{Slave, UnitFilter},
    store::Store,
};

use super::{
    request::{reply_channel, Reply, ReplyReceiver, ReplySender},
    CloseHandle, Request, Route, State, Terminated,
};

/// The serial line of a bound device.
struct Line<T> {
    framer: Framer<T>,
    replies: ReplySender,
    pending: ReplyReceiver,
}

/// A Modbus RTU device on a serial line.
pub struct Device<T> {
    store: Store,
    unit_filter: UnitFilter,
    state: State,
    line: Option<Line<T>>,
    close: CloseHandle,
}

impl<T> fmt::Debug for Device<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("unit_filter", &self.unit_filter)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<T> Device<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// A device answering to the units accepted by `unit_filter`.
    #[must_use]
    pub fn new(store: Store, unit_filter: impl Into<UnitFilter>) -> Self {
        Self {
            store,
            unit_filter: unit_filter.into(),
            state: State::Unbound,
            line: None,
            close: CloseHandle::default(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    #[must_use]
    pub fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    /// Attaches the serial line.
    pub fn bind(&mut self, transport: T, config: &SerialConfig) -> Result<(), Error> {
        self.bind_line(Framer::new(transport, config.timing()), config)
    }

    /// Attaches a half-duplex serial line with a direction output.
    pub fn bind_with_direction_control(
        &mut self,
        transport: T,
        config: &SerialConfig,
        direction: impl DirectionControl + 'static,
    ) -> Result<(), Error> {
        let framer =
            Framer::new(transport, config.timing()).with_direction_control(Box::new(direction));
        self.bind_line(framer, config)
    }

    fn bind_line(&mut self, framer: Framer<T>, config: &SerialConfig) -> Result<(), Error> {
        if self.state == State::Serving {
            return Err(ConfigError::Serving.into());
        }
        config.validate()?;
        let (replies, pending) = reply_channel();
        self.line = Some(Line {
            framer,
            replies,
            pending,
        });
        self.close.reset();
        self.state = State::Bound;
        log::info!(
            "Bound to serial line with {} baud, unit filter {:?}",
            config.baud_rate,
            self.unit_filter
        );
        Ok(())
    }

    /// Releases the serial line.
    pub fn close(&mut self) {
        self.close.close();
        if self.line.take().is_some() {
            log::info!("Closed");
        }
        self.state = State::Closed;
    }

    /// Waits for one request and answers it.
    ///
    /// Waits up to `timeout` for the first byte, by default twice the
    /// inter-frame silence. Returns whether a request has been executed.
    pub async fn process(&mut self, timeout: Option<Duration>) -> Result<bool, Error> {
        let Some(line) = self.line.as_mut() else {
            return Err(ConfigError::NotBound.into());
        };
        let timeout = timeout.unwrap_or_else(|| line.framer.timing().receive_timeout());
        let frame = match line.framer.recv_frame(timeout).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(false),
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                log::debug!("Dropping frame: {err}");
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        };
        let processed = process_frame(&self.store, &self.unit_filter, &line.replies, &frame);
        send_replies(line).await?;
        Ok(processed)
    }

    /// Serves requests until the device is closed or the line ends.
    pub async fn serve(&mut self) -> Result<Terminated, Error> {
        if self.line.is_none() {
            return Err(ConfigError::NotBound.into());
        }
        self.state = State::Serving;
        let closed = self.close.subscribe();
        let result = loop {
            if *closed.borrow() {
                break Ok(Terminated::Closed);
            }
            match self.process(None).await {
                Ok(_) => {}
                Err(Error::Transport(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    log::info!("Serial line has been closed");
                    break Ok(Terminated::Finished);
                }
                Err(err) => break Err(err),
            }
        };
        self.line = None;
        self.state = State::Closed;
        log::info!("Closed");
        result
    }
}

/// Validates a received frame and executes it.
fn process_frame(
    store: &Store,
    unit_filter: &UnitFilter,
    replies: &ReplySender,
    frame: &[u8],
) -> bool {
    if frame.len() < MIN_REQUEST_FRAME_LEN {
        log::debug!("Dropping frame of {} bytes", frame.len());
        return false;
    }
    let slave = Slave(frame[0]);
    if !slave.is_broadcast() && !unit_filter.accepts(slave) {
        log::debug!("Ignoring frame for unit {slave}");
        return false;
    }
    let pdu = match codec::rtu::decode_request_frame(frame) {
        Ok((_, pdu)) => pdu,
        Err(err) => {
            log::debug!("Dropping frame: {err}");
            return false;
        }
    };
    let route = Route::Rtu { slave };
    match codec::decode_request_pdu(&pdu) {
        Ok(Ok(request)) => {
            if slave.is_broadcast() && !request.function_code().is_write() {
                log::debug!("Ignoring broadcast {request:?}");
                return false;
            }
            Request::new(slave, request, route, replies.clone()).dispatch(store);
            true
        }
        Ok(Err(exception)) => {
            log::debug!("Rejecting request: {exception}");
            if route.expects_reply() {
                let reply = Reply {
                    slave,
                    route,
                    result: Err(exception),
                };
                // The receiver is owned by the same line.
                let _ = replies.send(reply);
            }
            false
        }
        Err(err) => {
            log::debug!("Dropping frame: {err}");
            false
        }
    }
}

async fn send_replies<T>(line: &mut Line<T>) -> io::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    while let Ok(reply) = line.pending.try_recv() {
        buf.clear();
        codec::rtu::encode_response(&mut buf, reply.slave, &reply.result)?;
        line.framer.send_frame(&buf).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};

    use crate::store::{Definition, Definitions, RegisterClass};

    use super::*;

    fn device() -> Device<DuplexStream> {
        let store = Store::with_definitions(
            &Definitions::new().with(
                RegisterClass::HoldingRegister,
                "EXAMPLE_HREG",
                Definition::new(93).with_default(19u16),
            ),
            false,
        )
        .unwrap();
        Device::new(store, Slave(1))
    }

    #[tokio::test]
    async fn process_unbound() {
        let mut device = device();
        assert!(matches!(
            device.process(None).await,
            Err(Error::Config(ConfigError::NotBound))
        ));
    }

    #[tokio::test]
    async fn reject_invalid_serial_config() {
        let (_, line) = duplex(64);
        let mut device = device();
        assert!(matches!(
            device.bind(line, &SerialConfig::new(0)),
            Err(Error::Config(ConfigError::Serial(_)))
        ));
        assert_eq!(device.state(), State::Unbound);
    }

    #[tokio::test]
    async fn answer_single_request() {
        let (mut host, line) = duplex(256);
        let mut device = device();
        device.bind(line, &SerialConfig::new(115_200)).unwrap();

        // read holding register 93
        host.write_all(&[0x01, 0x03, 0x00, 0x5D, 0x00, 0x01, 0x15, 0xD8])
            .await
            .unwrap();
        assert!(device.process(Some(Duration::from_millis(100))).await.unwrap());

        let mut response = [0; 7];
        host.read_exact(&mut response).await.unwrap();
        assert_eq!(response, [0x01, 0x03, 0x02, 0x00, 0x13, 0xF9, 0x89]);
    }

    #[tokio::test]
    async fn pack_coils_most_significant_bit_first() {
        let coils = vec![true, false, true, true, false, false, true, true, true, false];
        let store = Store::with_definitions(
            &Definitions::new().with(
                RegisterClass::Coil,
                "EXAMPLE_COILS",
                Definition::new(0).with_len(10).with_default(coils),
            ),
            false,
        )
        .unwrap();
        let (mut host, line) = duplex(256);
        let mut device = Device::new(store, Slave(1));
        device.bind(line, &SerialConfig::new(115_200)).unwrap();

        let mut request = vec![0x01, 0x01, 0x00, 0x00, 0x00, 0x0A];
        let crc = codec::rtu::crc16(&request);
        request.extend_from_slice(&crc.to_le_bytes());
        host.write_all(&request).await.unwrap();
        assert!(device.process(Some(Duration::from_millis(100))).await.unwrap());

        let mut response = [0; 7];
        host.read_exact(&mut response).await.unwrap();
        assert_eq!(response[..5], [0x01, 0x01, 0x02, 0xB3, 0x80]);
    }

    #[tokio::test]
    async fn answer_broadcast_write_silently() {
        let (mut host, line) = duplex(256);
        let mut device = device();
        let store = device.store().clone();
        device.bind(line, &SerialConfig::new(115_200)).unwrap();

        let mut frame = vec![0x00, 0x06, 0x00, 0x5D, 0x00, 0x2C];
        let crc = codec::rtu::crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        host.write_all(&frame).await.unwrap();
        assert!(device.process(Some(Duration::from_millis(100))).await.unwrap());
        assert_eq!(store.holding_register(93).unwrap(), 44);

        let mut response = [0; 1];
        assert!(tokio::time::timeout(Duration::from_millis(20), host.read(&mut response))
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn close_while_line_is_busy() {
        let (mut host, line) = duplex(1024);
        let mut device = device();
        device.bind(line, &SerialConfig::new(115_200)).unwrap();
        let close = device.close_handle();
        tokio::spawn(async move {
            while host.write_all(&[0xAA]).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });
        let serving = tokio::spawn(async move { device.serve().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        close.close();
        let terminated = tokio::time::timeout(Duration::from_secs(1), serving)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(terminated, Ok(Terminated::Closed)));
    }

    #[tokio::test]
    async fn finish_when_line_is_closed() {
        let (host, line) = duplex(256);
        let mut device = device();
        device.bind(line, &SerialConfig::new(115_200)).unwrap();
        drop(host);
        assert!(matches!(device.serve().await, Ok(Terminated::Finished)));
        assert_eq!(device.state(), State::Closed);
        assert!(matches!(
            device.serve().await,
            Err(Error::Config(ConfigError::NotBound))
        ));
    }
}

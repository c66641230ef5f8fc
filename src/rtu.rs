// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Serial line settings and RTU framing
//!
//! RTU frames are delimited by silence on the line: a frame ends once no
//! byte has been received for 3.5 character times. All waits are
//! `tokio::time` sleeps.

use std::{fmt, io, time::Duration};

use smallvec::SmallVec;
use tokio::{
    io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _},
    time::{sleep, sleep_until, timeout, Instant},
};

use crate::{codec::rtu::response_frame_len, error::ConfigError};

pub(crate) use crate::codec::rtu::MAX_FRAME_LEN;

/// Fixed silence above 19200 baud.
const FAST_SILENCE: Duration = Duration::from_micros(1750);

/// Delay between asserting the direction output and sending.
const DIRECTION_SETTLE_TIME: Duration = Duration::from_micros(1000);

/// Parity bit of each character.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Character format and speed of a serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl Default for SerialConfig {
    /// 9600 baud, 8 data bits, no parity, 1 stop bit.
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }
}

impl SerialConfig {
    #[must_use]
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Default::default()
        }
    }

    #[must_use]
    pub const fn data_bits(mut self, data_bits: u8) -> Self {
        self.data_bits = data_bits;
        self
    }

    #[must_use]
    pub const fn stop_bits(mut self, stop_bits: u8) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    #[must_use]
    pub const fn parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.baud_rate == 0 {
            return Err(ConfigError::Serial("baud rate must not be 0".to_owned()));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ConfigError::Serial(format!(
                "unsupported number of data bits: {}",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(ConfigError::Serial(format!(
                "unsupported number of stop bits: {}",
                self.stop_bits
            )));
        }
        Ok(())
    }

    /// Bits on the wire per character.
    ///
    /// Start and parity bit are always counted.
    #[must_use]
    pub fn char_bits(&self) -> u32 {
        u32::from(self.data_bits) + u32::from(self.stop_bits) + 2
    }

    /// The timing of this line.
    ///
    /// A baud rate of 0 is treated as 1, [`validate`](Self::validate)
    /// rejects it.
    #[must_use]
    pub fn timing(&self) -> Timing {
        let baud_rate = u64::from(self.baud_rate.max(1));
        let char_bits = u64::from(self.char_bits());
        let char_time = Duration::from_micros(1_000_000 * char_bits / baud_rate);
        let silence = if self.baud_rate <= 19_200 {
            Duration::from_micros(3_500_000 * char_bits / baud_rate)
        } else {
            FAST_SILENCE
        };
        Timing { char_time, silence }
    }

    /// Settings for opening a serial port with `tokio-serial`.
    #[cfg(feature = "rtu-serial")]
    pub fn serial_port_builder(
        &self,
        path: &str,
    ) -> Result<tokio_serial::SerialPortBuilder, ConfigError> {
        self.validate()?;
        let data_bits = match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = if self.stop_bits == 2 {
            tokio_serial::StopBits::Two
        } else {
            tokio_serial::StopBits::One
        };
        let parity = match self.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };
        Ok(tokio_serial::new(path, self.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity))
    }
}

/// Character time and inter-frame silence derived from a [`SerialConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timing {
    char_time: Duration,
    silence: Duration,
}

impl Timing {
    /// Transmission time of a single character.
    #[must_use]
    pub const fn char_time(&self) -> Duration {
        self.char_time
    }

    /// 3.5 character times.
    #[must_use]
    pub const fn silence(&self) -> Duration {
        self.silence
    }

    /// Transmission time of `len` characters.
    #[must_use]
    pub fn frame_time(&self, len: usize) -> Duration {
        self.char_time
            .saturating_mul(u32::try_from(len).unwrap_or(u32::MAX))
    }

    /// How long a device waits for the first byte of a request per poll.
    #[must_use]
    pub fn receive_timeout(&self) -> Duration {
        self.silence.saturating_mul(2)
    }

    /// Default timeout of a host waiting for a response.
    #[must_use]
    pub fn response_timeout(&self) -> Duration {
        self.silence.saturating_mul(40)
    }
}

/// Digital output switching a half-duplex transceiver between receive
/// and transmit.
pub trait DirectionControl: Send {
    fn set_transmit(&mut self, transmit: bool) -> io::Result<()>;
}

impl<F> DirectionControl for F
where
    F: FnMut(bool) -> io::Result<()> + Send,
{
    fn set_transmit(&mut self, transmit: bool) -> io::Result<()> {
        self(transmit)
    }
}

pub(crate) type Frame = SmallVec<[u8; MAX_FRAME_LEN]>;

/// Sends and receives RTU frames on a byte stream.
pub(crate) struct Framer<T> {
    transport: T,
    timing: Timing,
    direction: Option<Box<dyn DirectionControl>>,
    last_activity: Option<Instant>,
}

impl<T> fmt::Debug for Framer<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Framer")
            .field("transport", &self.transport)
            .field("timing", &self.timing)
            .field("direction", &self.direction.is_some())
            .finish_non_exhaustive()
    }
}

impl<T> Framer<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(transport: T, timing: Timing) -> Self {
        Self {
            transport,
            timing,
            direction: None,
            last_activity: None,
        }
    }

    pub(crate) fn with_direction_control(mut self, direction: Box<dyn DirectionControl>) -> Self {
        self.direction = Some(direction);
        self
    }

    pub(crate) fn timing(&self) -> Timing {
        self.timing
    }

    /// Sends a complete frame after the inter-frame gap.
    ///
    /// With direction control the output stays asserted until the last
    /// character has left the line.
    pub(crate) async fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        if let Some(last_activity) = self.last_activity {
            sleep_until(last_activity + self.timing.silence).await;
        }
        log::trace!("Sending RTU frame {frame:02X?}");

        let mut transmit = Transmit::new(self.direction.as_mut());
        transmit.assert()?;
        if transmit.is_active() {
            sleep(DIRECTION_SETTLE_TIME).await;
        }
        let started = Instant::now();
        let written = write_frame(&mut self.transport, frame).await;
        if transmit.is_active() && written.is_ok() {
            sleep_until(started + self.timing.frame_time(frame.len())).await;
        }
        let released = transmit.release();
        self.last_activity = Some(Instant::now());
        written.and(released)
    }

    /// Receives the next frame delimited by silence.
    ///
    /// Returns `None` if no byte arrived within `first_byte_timeout`.
    /// Reaching the end of the stream before any byte is an
    /// [`io::ErrorKind::UnexpectedEof`] error. An oversized frame or a
    /// line that stays busy longer than the longest frame is
    /// [`io::ErrorKind::InvalidData`].
    pub(crate) async fn recv_frame(
        &mut self,
        first_byte_timeout: Duration,
    ) -> io::Result<Option<Frame>> {
        let mut chunk = [0; MAX_FRAME_LEN];
        let Ok(read) = timeout(first_byte_timeout, self.transport.read(&mut chunk)).await else {
            return Ok(None);
        };
        let len = read?;
        if len == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let mut frame = Frame::from_slice(&chunk[..len]);
        let mut oversized = false;
        let deadline = Instant::now() + self.timing.frame_time(MAX_FRAME_LEN) + self.timing.silence;
        // Reading is cancel safe, no byte gets lost on timeout.
        while let Ok(read) = timeout(self.timing.silence, self.transport.read(&mut chunk)).await {
            if Instant::now() >= deadline {
                self.last_activity = Some(Instant::now());
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "No inter-frame silence on a busy RTU line",
                ));
            }
            let len = read?;
            if len == 0 {
                break;
            }
            if frame.len() + len > MAX_FRAME_LEN {
                oversized = true;
                continue;
            }
            frame.extend_from_slice(&chunk[..len]);
        }
        self.last_activity = Some(Instant::now());
        if oversized {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "RTU frame exceeds 256 bytes",
            ));
        }
        log::trace!("Received RTU frame {:02X?}", &frame[..]);
        Ok(Some(frame))
    }

    /// Reads until a structurally complete response has arrived.
    ///
    /// There is no timeout here, the caller bounds the whole call.
    pub(crate) async fn recv_response(&mut self) -> io::Result<Frame> {
        let mut chunk = [0; MAX_FRAME_LEN];
        let mut frame = Frame::new();
        loop {
            if let Some(len) = response_frame_len(&frame) {
                frame.truncate(len);
                break;
            }
            if frame.len() >= MAX_FRAME_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "RTU frame exceeds 256 bytes",
                ));
            }
            let len = self.transport.read(&mut chunk).await?;
            if len == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            frame.extend_from_slice(&chunk[..len]);
            self.last_activity = Some(Instant::now());
        }
        log::trace!("Received RTU response {:02X?}", &frame[..]);
        Ok(frame)
    }

    /// Drops input that is already buffered, e.g. a late response to a
    /// request that has timed out.
    pub(crate) async fn discard_input(&mut self) -> io::Result<()> {
        let mut chunk = [0; MAX_FRAME_LEN];
        // A zero timeout still polls the read once.
        while let Ok(read) = timeout(Duration::ZERO, self.transport.read(&mut chunk)).await {
            let len = read?;
            if len == 0 {
                break;
            }
            log::debug!("Discarding {len} stale bytes");
        }
        Ok(())
    }

    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        self.transport.shutdown().await
    }
}

/// Asserted direction output, released when dropped.
///
/// A send that is cancelled, e.g. by a response timeout, must not leave
/// the transceiver driving the bus.
struct Transmit<'a> {
    direction: Option<&'a mut Box<dyn DirectionControl>>,
}

impl<'a> Transmit<'a> {
    fn new(direction: Option<&'a mut Box<dyn DirectionControl>>) -> Self {
        Self { direction }
    }

    fn is_active(&self) -> bool {
        self.direction.is_some()
    }

    fn assert(&mut self) -> io::Result<()> {
        match self.direction.as_mut() {
            Some(direction) => direction.set_transmit(true),
            None => Ok(()),
        }
    }

    fn release(mut self) -> io::Result<()> {
        match self.direction.take() {
            Some(direction) => direction.set_transmit(false),
            None => Ok(()),
        }
    }
}

impl Drop for Transmit<'_> {
    fn drop(&mut self) {
        if let Some(direction) = self.direction.take() {
            log::debug!("Releasing direction output of an aborted send");
            if let Err(err) = direction.set_transmit(false) {
                log::warn!("Failed to release direction output: {err}");
            }
        }
    }
}

async fn write_frame<T>(transport: &mut T, frame: &[u8]) -> io::Result<()>
where
    T: AsyncWrite + Unpin,
{
    transport.write_all(frame).await?;
    transport.flush().await
}

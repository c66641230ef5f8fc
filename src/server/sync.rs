// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Blocking devices
//!
//! Each device owns a single-threaded runtime and blocks the calling
//! thread while serving. Use the [`CloseHandle`] from another thread to
//! stop it.

use std::io;

use tokio::runtime::Runtime;

use crate::{error::Error, store::Store};

use super::{CloseHandle, State, Terminated};

fn new_runtime() -> io::Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

#[cfg(feature = "rtu-server")]
pub use self::rtu::RtuDevice;

#[cfg(feature = "tcp-server")]
pub use self::tcp::TcpDevice;

#[cfg(feature = "rtu-server")]
mod rtu {
    use std::time::Duration;

    use tokio::io::{AsyncRead, AsyncWrite};

    use crate::{
        rtu::{DirectionControl, SerialConfig},
        server::rtu::Device,
        slave::UnitFilter,
    };

    use super::*;

    /// Blocking Modbus RTU device.
    #[derive(Debug)]
    pub struct RtuDevice<T> {
        runtime: Runtime,
        device: Device<T>,
    }

    impl<T> RtuDevice<T>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        pub fn new(store: Store, unit_filter: impl Into<UnitFilter>) -> io::Result<Self> {
            Ok(Self {
                runtime: new_runtime()?,
                device: Device::new(store, unit_filter),
            })
        }

        #[must_use]
        pub fn state(&self) -> State {
            self.device.state()
        }

        #[must_use]
        pub fn store(&self) -> &Store {
            self.device.store()
        }

        #[must_use]
        pub fn close_handle(&self) -> CloseHandle {
            self.device.close_handle()
        }

        pub fn bind(&mut self, transport: T, config: &SerialConfig) -> Result<(), Error> {
            self.device.bind(transport, config)
        }

        pub fn bind_with_direction_control(
            &mut self,
            transport: T,
            config: &SerialConfig,
            direction: impl DirectionControl + 'static,
        ) -> Result<(), Error> {
            self.device
                .bind_with_direction_control(transport, config, direction)
        }

        pub fn close(&mut self) {
            self.device.close();
        }

        /// Blocks until one request has been answered or `timeout` has
        /// elapsed without any input.
        pub fn process(&mut self, timeout: Option<Duration>) -> Result<bool, Error> {
            self.runtime.block_on(self.device.process(timeout))
        }

        pub fn serve(&mut self) -> Result<Terminated, Error> {
            self.runtime.block_on(self.device.serve())
        }
    }
}

#[cfg(feature = "tcp-server")]
mod tcp {
    use std::net::SocketAddr;

    use crate::server::tcp::{Config, Device};

    use super::*;

    /// Blocking Modbus TCP device.
    #[derive(Debug)]
    pub struct TcpDevice {
        runtime: Runtime,
        device: Device,
    }

    impl TcpDevice {
        pub fn new(store: Store) -> io::Result<Self> {
            Ok(Self {
                runtime: new_runtime()?,
                device: Device::new(store),
            })
        }

        #[must_use]
        pub fn state(&self) -> State {
            self.device.state()
        }

        #[must_use]
        pub fn store(&self) -> &Store {
            self.device.store()
        }

        #[must_use]
        pub fn close_handle(&self) -> CloseHandle {
            self.device.close_handle()
        }

        #[must_use]
        pub fn local_addr(&self) -> Option<SocketAddr> {
            self.device.local_addr()
        }

        pub fn bind(&mut self, config: Config) -> Result<(), Error> {
            self.device.bind(config)
        }

        pub fn close(&mut self) {
            self.device.close();
        }

        pub fn serve(&mut self) -> Result<Terminated, Error> {
            self.runtime.block_on(self.device.serve())
        }
    }
}

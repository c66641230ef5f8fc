// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus devices answering requests from a [`Store`](crate::store::Store)
//!
//! A device is created unbound, bound to a transport, served until it is
//! closed and may be bound again afterwards.

use std::sync::Arc;

use tokio::sync::watch;

pub mod request;

#[cfg(feature = "rtu-server")]
pub mod rtu;

#[cfg(feature = "tcp-server")]
pub mod tcp;

#[cfg(feature = "sync")]
pub mod sync;

pub use self::request::{ConnectionId, Request, Route};

/// Lifecycle of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Unbound,
    Bound,
    Serving,
    Closed,
}

/// Why serving has ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminated {
    /// The device has been closed.
    Closed,

    /// The transport has reached the end of its stream.
    Finished,
}

/// Stops a serving device.
///
/// The device finishes the request it is currently processing and then
/// returns from `serve()`. Closing is idempotent and may happen before
/// serving has started.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    closed: Arc<watch::Sender<bool>>,
}

impl Default for CloseHandle {
    fn default() -> Self {
        Self {
            closed: Arc::new(watch::channel(false).0),
        }
    }
}

impl CloseHandle {
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn reset(&self) {
        self.closed.send_replace(false);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

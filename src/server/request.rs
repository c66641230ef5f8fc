// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Requests received by a device

use std::fmt;

use tokio::sync::mpsc;

use crate::{
    frame::{self, ExceptionCode, ExceptionResponse, FunctionCode, Response},
    slave::Slave,
    store::Store,
};

/// Identifies one accepted TCP connection of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where the answer to a request has to be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// The serial line the request has been received on.
    Rtu { slave: Slave },

    /// The originating TCP connection.
    Tcp {
        connection: ConnectionId,
        transaction_id: u16,
    },
}

impl Route {
    /// Broadcasts on a serial line are never answered.
    #[must_use]
    pub const fn expects_reply(&self) -> bool {
        match self {
            Self::Rtu { slave } => slave.0 != 0,
            Self::Tcp { .. } => true,
        }
    }
}

/// An answer queued for the device engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Reply {
    pub(crate) slave: Slave,
    pub(crate) route: Route,
    pub(crate) result: Result<Response, ExceptionResponse>,
}

pub(crate) type ReplySender = mpsc::UnboundedSender<Reply>;

pub(crate) type ReplyReceiver = mpsc::UnboundedReceiver<Reply>;

pub(crate) fn reply_channel() -> (ReplySender, ReplyReceiver) {
    mpsc::unbounded_channel()
}

/// A validated request waiting to be answered.
///
/// Every request is answered exactly once, either with a response or an
/// exception. Both consume the request.
#[derive(Debug)]
pub struct Request {
    slave: Slave,
    request: frame::Request<'static>,
    route: Route,
    replies: ReplySender,
}

impl Request {
    pub(crate) fn new(
        slave: Slave,
        request: frame::Request<'static>,
        route: Route,
        replies: ReplySender,
    ) -> Self {
        Self {
            slave,
            request,
            route,
            replies,
        }
    }

    /// The unit address the request has been sent to.
    #[must_use]
    pub const fn slave(&self) -> Slave {
        self.slave
    }

    #[must_use]
    pub const fn function_code(&self) -> FunctionCode {
        self.request.function_code()
    }

    #[must_use]
    pub const fn request(&self) -> &frame::Request<'static> {
        &self.request
    }

    #[must_use]
    pub const fn route(&self) -> Route {
        self.route
    }

    /// Answers with `response`.
    ///
    /// A response for a different function code is replaced by a
    /// server device failure.
    pub fn send_response(self, response: Response) {
        let function = self.function_code();
        if response.function_code() != function {
            log::warn!("Rejecting response {response:?} to request {:?}", self.request);
            self.send_exception(ExceptionCode::ServerDeviceFailure);
            return;
        }
        self.reply(Ok(response));
    }

    pub fn send_exception(self, exception: ExceptionCode) {
        let function = self.function_code();
        self.reply(Err(ExceptionResponse {
            function,
            exception,
        }));
    }

    /// Executes the request on `store` and answers with the outcome.
    pub fn dispatch(self, store: &Store) {
        match store.dispatch(&self.request) {
            Ok(response) => self.send_response(response),
            Err(exception) => {
                log::debug!("Request {:?} failed: {exception}", self.request);
                self.send_exception(exception);
            }
        }
    }

    fn reply(self, result: Result<Response, ExceptionResponse>) {
        let Self {
            slave,
            route,
            replies,
            ..
        } = self;
        if !route.expects_reply() {
            log::debug!("Not answering broadcast: {result:?}");
            return;
        }
        let reply = Reply {
            slave,
            route,
            result,
        };
        if replies.send(reply).is_err() {
            log::debug!("Device closed before the reply could be sent");
        }
    }
}

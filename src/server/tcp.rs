// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus TCP device
//!
//! Every accepted connection gets its own reader and writer task. All
//! received frames are funneled into a single dispatcher that owns the
//! store access and the routing table, so requests are executed one after
//! another. Each response is queued for the connection and transaction it
//! belongs to. A peer that does not read its responses is disconnected
//! once its queue is full, the other connections are not held up.

use std::{collections::HashMap, io, net::SocketAddr};

use futures_util::{SinkExt as _, StreamExt as _};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener,
    },
    sync::mpsc::{self, error::TrySendError},
    task::{AbortHandle, JoinSet},
};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::{
    codec::{self, tcp::ServerCodec},
    error::{ConfigError, Error},
    frame::{
        tcp::{Header, RequestFrame, ResponseAdu},
        ResponsePdu,
    },
    slave::{Slave, UnitFilter},
    store::Store,
};

use super::{
    request::{reply_channel, ConnectionId, Reply, ReplyReceiver, ReplySender},
    CloseHandle, Request, Route, State, Terminated,
};

/// Default number of simultaneously open connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

const EVENT_QUEUE_LEN: usize = 32;

/// Responses waiting to be written per connection.
const RESPONSE_QUEUE_LEN: usize = 16;

/// Listener settings of a TCP device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub socket_addr: SocketAddr,

    /// Further connections are closed right after they have been
    /// accepted. Also used as the listen backlog.
    pub max_connections: usize,

    pub unit_filter: UnitFilter,
}

impl Config {
    #[must_use]
    pub fn new(socket_addr: SocketAddr) -> Self {
        Self {
            socket_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            unit_filter: UnitFilter::Any,
        }
    }

    #[must_use]
    pub const fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    #[must_use]
    pub fn unit_filter(mut self, unit_filter: impl Into<UnitFilter>) -> Self {
        self.unit_filter = unit_filter.into();
        self
    }
}

/// Opens a listening socket with address reuse.
fn listener(config: &Config) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(
        Domain::for_address(config.socket_addr),
        Type::STREAM,
        Some(Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&config.socket_addr.into())?;
    let backlog = i32::try_from(config.max_connections.max(1)).unwrap_or(i32::MAX);
    socket.listen(backlog)?;
    Ok(socket.into())
}

#[derive(Debug)]
struct Bound {
    listener: std::net::TcpListener,
    config: Config,
}

/// A Modbus TCP device.
#[derive(Debug)]
pub struct Device {
    store: Store,
    state: State,
    bound: Option<Bound>,
    close: CloseHandle,
}

impl Device {
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self {
            store,
            state: State::Unbound,
            bound: None,
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

    /// The address the device is listening on, e.g. after binding port 0.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound
            .as_ref()
            .and_then(|bound| bound.listener.local_addr().ok())
    }

    /// Starts listening.
    ///
    /// A closed device can be bound again, previous connections are not
    /// carried over.
    pub fn bind(&mut self, config: Config) -> Result<(), Error> {
        if self.state == State::Serving {
            return Err(ConfigError::Serving.into());
        }
        let listener = listener(&config)?;
        log::info!(
            "Listening on {}",
            listener.local_addr().unwrap_or(config.socket_addr)
        );
        self.bound = Some(Bound { listener, config });
        self.close.reset();
        self.state = State::Bound;
        Ok(())
    }

    /// Stops listening without serving.
    pub fn close(&mut self) {
        self.close.close();
        if self.bound.take().is_some() {
            log::info!("Closed");
        }
        self.state = State::Closed;
    }

    /// Serves requests until the device is closed.
    pub async fn serve(&mut self) -> Result<Terminated, Error> {
        let Some(Bound { listener, config }) = self.bound.take() else {
            return Err(ConfigError::NotBound.into());
        };
        self.state = State::Serving;
        let result = match TcpListener::from_std(listener) {
            Ok(listener) => {
                Dispatcher::new(self.store.clone(), config)
                    .run(listener, &self.close)
                    .await
            }
            Err(err) => Err(err.into()),
        };
        self.state = State::Closed;
        log::info!("Closed");
        result
    }
}

#[derive(Debug)]
enum Event {
    Frame(ConnectionId, RequestFrame),
    Closed(ConnectionId),
}

type Writer = FramedWrite<OwnedWriteHalf, ServerCodec>;

/// Routing table entry of an accepted connection.
#[derive(Debug)]
struct Connection {
    responses: mpsc::Sender<ResponseAdu>,
    reader: AbortHandle,
    writer: AbortHandle,
}

/// Owns the routing table of one serving session.
#[derive(Debug)]
struct Dispatcher {
    store: Store,
    config: Config,
    connections: HashMap<ConnectionId, Connection>,
    next_connection: u64,
    replies: ReplySender,
    pending: ReplyReceiver,
}

impl Dispatcher {
    fn new(store: Store, config: Config) -> Self {
        let (replies, pending) = reply_channel();
        Self {
            store,
            config,
            connections: HashMap::new(),
            next_connection: 0,
            replies,
            pending,
        }
    }

    async fn run(mut self, listener: TcpListener, close: &CloseHandle) -> Result<Terminated, Error> {
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE_LEN);
        let mut tasks = JoinSet::new();
        let mut closed = close.subscribe();
        loop {
            if *closed.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = closed.changed() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        if self.connections.len() >= self.config.max_connections {
                            log::warn!("Rejecting connection from {peer_addr}: too many connections");
                            continue;
                        }
                        let connection = ConnectionId(self.next_connection);
                        self.next_connection += 1;
                        log::debug!("Accepted connection {connection} from {peer_addr}");
                        let (reader, writer) = stream.into_split();
                        let (responses, queued) = mpsc::channel(RESPONSE_QUEUE_LEN);
                        let reader = tasks.spawn(read_frames(
                            connection,
                            FramedRead::new(reader, ServerCodec),
                            events_tx.clone(),
                        ));
                        let writer = tasks.spawn(write_responses(
                            connection,
                            FramedWrite::new(writer, ServerCodec),
                            queued,
                        ));
                        self.connections.insert(
                            connection,
                            Connection {
                                responses,
                                reader,
                                writer,
                            },
                        );
                    }
                    Err(err) => log::warn!("Failed to accept connection: {err}"),
                },
                Some(finished) = tasks.join_next() => {
                    if let Err(err) = finished {
                        if err.is_panic() {
                            log::warn!("Connection task failed: {err}");
                        }
                    }
                }
                Some(event) = events_rx.recv() => match event {
                    Event::Frame(connection, frame) => {
                        self.process(connection, frame);
                        self.send_replies();
                    }
                    Event::Closed(connection) => {
                        // The writer still flushes the queued responses.
                        if self.connections.remove(&connection).is_some() {
                            log::debug!("Connection {connection} closed");
                        }
                    }
                },
            }
        }
        log::debug!("Dropping {} connections", self.connections.len());
        tasks.shutdown().await;
        Ok(Terminated::Closed)
    }

    fn process(&self, connection: ConnectionId, frame: RequestFrame) {
        let RequestFrame { hdr, pdu } = frame;
        let slave = Slave(hdr.unit_id);
        if !self.config.unit_filter.accepts(slave) {
            log::debug!("Ignoring request for unit {slave} on connection {connection}");
            return;
        }
        let route = Route::Tcp {
            connection,
            transaction_id: hdr.transaction_id,
        };
        match codec::decode_request_pdu(&pdu) {
            Ok(Ok(request)) => {
                Request::new(slave, request, route, self.replies.clone()).dispatch(&self.store);
            }
            Ok(Err(exception)) => {
                log::debug!("Rejecting request on connection {connection}: {exception}");
                let reply = Reply {
                    slave,
                    route,
                    result: Err(exception),
                };
                // The receiver lives as long as the dispatcher.
                let _ = self.replies.send(reply);
            }
            Err(err) => {
                log::debug!("Dropping frame on connection {connection}: {err}");
            }
        }
    }

    fn send_replies(&mut self) {
        while let Ok(reply) = self.pending.try_recv() {
            let Reply {
                slave,
                route,
                result,
            } = reply;
            let Route::Tcp {
                connection,
                transaction_id,
            } = route
            else {
                continue;
            };
            let Some(entry) = self.connections.get(&connection) else {
                log::debug!("Connection {connection} closed before the reply could be sent");
                continue;
            };
            let adu = ResponseAdu {
                hdr: Header {
                    transaction_id,
                    unit_id: slave.into(),
                },
                pdu: ResponsePdu(result),
            };
            match entry.responses.try_send(adu) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    log::warn!("Closing connection {connection}: responses are not read");
                    self.drop_connection(connection);
                }
                Err(TrySendError::Closed(_)) => {
                    log::debug!("Connection {connection} closed before the reply could be sent");
                    self.drop_connection(connection);
                }
            }
        }
    }

    fn drop_connection(&mut self, connection: ConnectionId) {
        if let Some(entry) = self.connections.remove(&connection) {
            entry.reader.abort();
            entry.writer.abort();
        }
    }
}

async fn read_frames(
    connection: ConnectionId,
    mut frames: FramedRead<OwnedReadHalf, ServerCodec>,
    events: mpsc::Sender<Event>,
) {
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(frame) => {
                if events.send(Event::Frame(connection, frame)).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                log::warn!("Closing connection {connection}: {err}");
                break;
            }
        }
    }
    let _ = events.send(Event::Closed(connection)).await;
}

async fn write_responses(
    connection: ConnectionId,
    mut writer: Writer,
    mut responses: mpsc::Receiver<ResponseAdu>,
) {
    while let Some(adu) = responses.recv().await {
        if let Err(err) = writer.send(adu).await {
            log::warn!("Closing connection {connection}: {err}");
            return;
        }
    }
}

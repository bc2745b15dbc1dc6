// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The multiplexed client connection that call operations issue their I/O against.

use crate::{
    client::Config,
    completion::Completer,
    context::Context,
    status::{Code, Metadata, Status},
    util::TimeUntil,
    wire::{self, BoxIo, ClientFrame, ClientTransport, Outbound, ServerFrame},
};
use bytes::Bytes;
use fnv::FnvHashMap;
use futures::prelude::*;
use parking_lot::Mutex;
use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_rustls::{rustls, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Something the server sent for one call.
#[derive(Debug)]
pub(crate) enum Inbound {
    Message(Bytes),
    Status(Status, Metadata),
}

/// The settings a connection is opened with.
#[derive(Clone)]
pub(crate) struct Settings {
    pub(crate) keepalive_interval: Duration,
    pub(crate) keepalive_timeout: Duration,
    pub(crate) max_frame_length: usize,
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            keepalive_interval: config.keepalive_interval,
            keepalive_timeout: config.keepalive_timeout,
            max_frame_length: config.max_frame_length,
        }
    }
}

/// How to reach the server. Connects lazily, and reconnects once a connection breaks.
pub(crate) struct Connector {
    address: String,
    tls: Option<(TlsConnector, rustls::ServerName)>,
    settings: Settings,
    current: tokio::sync::Mutex<Option<Arc<Connection>>>,
}

impl Connector {
    pub(crate) fn new(
        address: String,
        tls: Option<(TlsConnector, rustls::ServerName)>,
        settings: Settings,
    ) -> Self {
        Self {
            address,
            tls,
            settings,
            current: tokio::sync::Mutex::new(None),
        }
    }

    /// Opens a call, connecting first if needed. Connection failures become `UNAVAILABLE`.
    pub(crate) async fn open(&self, method: &str, ctx: &Context) -> Result<ClientCall, Status> {
        let connection = self.connection().await.map_err(|e| {
            Status::new(
                Code::Unavailable,
                format!("failed to connect to {}: {}", self.address, e),
            )
        })?;
        connection.open_call(method, ctx)
    }

    async fn connection(&self) -> io::Result<Arc<Connection>> {
        let mut current = self.current.lock().await;
        if let Some(connection) = &*current {
            if !connection.is_closed() {
                return Ok(connection.clone());
            }
            debug!(address = %self.address, "Reconnecting");
        }
        let tcp = TcpStream::connect(&self.address).await?;
        tcp.set_nodelay(true)?;
        let io: BoxIo = match &self.tls {
            Some((connector, server_name)) => {
                Box::new(connector.connect(server_name.clone(), tcp).await?)
            }
            None => Box::new(tcp),
        };
        info!(address = %self.address, secure = self.tls.is_some(), "Connected");
        let connection = Connection::spawn(io, &self.settings);
        *current = Some(connection.clone());
        Ok(connection)
    }
}

#[derive(Default)]
struct CallTable {
    calls: FnvHashMap<u64, mpsc::UnboundedSender<Inbound>>,
    closed: bool,
}

/// One live connection, shared by every call opened on it.
pub(crate) struct Connection {
    outbound: mpsc::UnboundedSender<Outbound<ClientFrame>>,
    table: Arc<Mutex<CallTable>>,
    next_call_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Connection {
    /// Starts the reader, writer, and keepalive tasks. Must run inside the channel's runtime.
    fn spawn(io: BoxIo, settings: &Settings) -> Arc<Self> {
        let transport: ClientTransport = wire::bincode(io, settings.max_frame_length);
        let (sink, stream) = transport.split::<ClientFrame>();
        let (outbound, rx) = mpsc::unbounded_channel();
        let table = Arc::new(Mutex::new(CallTable::default()));
        let shutdown = CancellationToken::new();

        tokio::spawn(wire::write_loop(sink, rx, shutdown.clone()));
        tokio::spawn(read_loop(
            stream,
            table.clone(),
            settings.keepalive_interval + settings.keepalive_timeout,
            shutdown.clone(),
        ));
        tokio::spawn(keepalive(
            outbound.clone(),
            settings.keepalive_interval,
            shutdown.clone(),
        ));

        Arc::new(Self {
            outbound,
            table,
            next_call_id: AtomicU64::new(0),
            shutdown,
        })
    }

    fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.table.lock().closed
    }

    fn open_call(self: &Arc<Self>, method: &str, ctx: &Context) -> Result<ClientCall, Status> {
        let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut table = self.table.lock();
            if table.closed {
                return Err(Status::new(Code::Unavailable, "connection closed"));
            }
            table.calls.insert(id, tx);
        }
        self.send(ClientFrame::Start {
            call_id: id,
            method: method.to_string(),
            metadata: ctx.metadata.clone(),
            deadline: ctx.deadline,
            trace_context: ctx.trace_context,
        });
        trace!(call_id = id, %method, "SendStart");

        let watchdog = ctx.deadline.map(|deadline| {
            let connection = Arc::downgrade(self);
            tokio::spawn(expire_at(connection, id, deadline.time_until()))
        });
        Ok(ClientCall {
            id,
            connection: self.clone(),
            inbound: tokio::sync::Mutex::new(rx),
            terminal: Mutex::new(None),
            watchdog,
        })
    }

    fn send(&self, frame: ClientFrame) -> bool {
        self.outbound.send(Outbound::frame(frame)).is_ok()
    }

    /// Queues `frame`; `ack` completes once it is written, or fails if it never is.
    fn send_acked(&self, frame: ClientFrame, ack: Completer) {
        // A closed writer hands the frame back, and dropping its ack fails the operation.
        let _ = self.outbound.send(Outbound::acked(frame, ack));
    }

    fn is_active(&self, call_id: u64) -> bool {
        self.table.lock().calls.contains_key(&call_id)
    }

    /// Ends a call locally with `status`. Returns false if the call had already ended.
    fn terminate(&self, call_id: u64, status: Status) -> bool {
        let sender = self.table.lock().calls.remove(&call_id);
        match sender {
            Some(sender) => {
                let _ = sender.send(Inbound::Status(status, Metadata::default()));
                true
            }
            None => false,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn expire_at(connection: Weak<Connection>, call_id: u64, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    if let Some(connection) = connection.upgrade() {
        if connection.terminate(
            call_id,
            Status::new(Code::DeadlineExceeded, "deadline exceeded"),
        ) {
            debug!(call_id, "DeadlineExceeded");
            connection.send(ClientFrame::Cancel { call_id });
        }
    }
}

async fn read_loop<S>(
    mut stream: S,
    table: Arc<Mutex<CallTable>>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) where
    S: Stream<Item = io::Result<ServerFrame>> + Unpin,
{
    let reason = loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break "connection shut down".to_string(),
            next = tokio::time::timeout(idle_timeout, stream.next()) => next,
        };
        match frame {
            Err(_) => break "keepalive timeout".to_string(),
            Ok(None) => break "connection closed by server".to_string(),
            Ok(Some(Err(e))) => break format!("connection failed: {e}"),
            Ok(Some(Ok(frame))) => route(&table, frame),
        }
    };
    shutdown.cancel();

    let calls = {
        let mut table = table.lock();
        table.closed = true;
        std::mem::take(&mut table.calls)
    };
    if !calls.is_empty() {
        warn!(calls = calls.len(), "Connection lost: {}", reason);
    } else {
        debug!("Connection closed: {}", reason);
    }
    for (_, call) in calls {
        let _ = call.send(Inbound::Status(
            Status::new(Code::Unavailable, reason.clone()),
            Metadata::default(),
        ));
    }
}

fn route(table: &Mutex<CallTable>, frame: ServerFrame) {
    match frame {
        ServerFrame::Message { call_id, payload } => {
            trace!(call_id, len = payload.len(), "ReceiveMessage");
            if let Some(call) = table.lock().calls.get(&call_id) {
                let _ = call.send(Inbound::Message(payload));
            }
        }
        ServerFrame::Status {
            call_id,
            code,
            message,
            trailers,
        } => {
            trace!(call_id, %code, "ReceiveStatus");
            if let Some(call) = table.lock().calls.remove(&call_id) {
                let _ = call.send(Inbound::Status(Status::new(code, message), trailers));
            }
        }
        ServerFrame::Pong { nonce } => trace!(nonce, "ReceivePong"),
    }
}

async fn keepalive(
    outbound: mpsc::UnboundedSender<Outbound<ClientFrame>>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    let mut nonce = 0u64;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                nonce += 1;
                if outbound.send(Outbound::frame(ClientFrame::Ping { nonce })).is_err() {
                    break;
                }
            }
        }
    }
}

/// The client side of one call on a connection.
///
/// Reads are sequential and writes are sequential, but a read and a write may be in flight at
/// the same time. The first terminal status wins, whether it comes from the server, the
/// deadline, a local cancellation, or the connection closing.
pub(crate) struct ClientCall {
    id: u64,
    connection: Arc<Connection>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    terminal: Mutex<Option<(Status, Metadata)>>,
    watchdog: Option<JoinHandle<()>>,
}

impl ClientCall {
    /// The next message, or `None` once the call has ended.
    pub(crate) async fn read(&self) -> Option<Bytes> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(Inbound::Message(payload)) => Some(payload),
            Some(Inbound::Status(status, trailers)) => {
                self.terminal.lock().get_or_insert((status, trailers));
                None
            }
            None => {
                self.terminal.lock().get_or_insert_with(|| {
                    (
                        Status::new(Code::Unavailable, "connection closed"),
                        Metadata::default(),
                    )
                });
                None
            }
        }
    }

    /// The final status. Discards unread messages.
    pub(crate) async fn finish(&self) -> (Status, Metadata) {
        loop {
            let terminal = self.terminal.lock().clone();
            if let Some(terminal) = terminal {
                return terminal;
            }
            if self.read().await.is_some() {
                trace!(call_id = self.id, "DiscardMessage");
            }
        }
    }

    pub(crate) fn write(&self, payload: Bytes, ack: Completer) {
        trace!(call_id = self.id, len = payload.len(), "SendMessage");
        self.connection.send_acked(
            ClientFrame::Message {
                call_id: self.id,
                payload,
            },
            ack,
        );
    }

    /// Queues a message without waiting for it to be written.
    pub(crate) fn send_message(&self, payload: Bytes) {
        self.connection.send(ClientFrame::Message {
            call_id: self.id,
            payload,
        });
    }

    pub(crate) fn writes_done(&self, ack: Completer) {
        trace!(call_id = self.id, "SendHalfClose");
        self.connection
            .send_acked(ClientFrame::HalfClose { call_id: self.id }, ack);
    }

    /// Queues a half-close without waiting for it to be written.
    pub(crate) fn half_close(&self) {
        self.connection
            .send(ClientFrame::HalfClose { call_id: self.id });
    }

    /// Ends the call with `CANCELLED` and asks the server to stop working on it.
    pub(crate) fn cancel(&self) {
        if self.connection.terminate(
            self.id,
            Status::new(Code::Cancelled, "call cancelled by client"),
        ) {
            trace!(call_id = self.id, "CancelRequest");
            self.connection
                .send(ClientFrame::Cancel { call_id: self.id });
        }
    }

    /// True once a terminal status was produced, even if it has not been read yet.
    pub(crate) fn is_terminated(&self) -> bool {
        !self.connection.is_active(self.id)
    }
}

impl Drop for ClientCall {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
        // Abandoned before the server finished it.
        if self.connection.table.lock().calls.remove(&self.id).is_some() {
            self.connection
                .send(ClientFrame::Cancel { call_id: self.id });
        }
    }
}

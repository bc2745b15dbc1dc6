// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Provides a client channel that issues unary and duplex calls.

mod connection;
mod duplex;
mod stream;
mod unary;

pub use stream::{StreamContext, StreamObserver, StreamPacket, StreamState};

use crate::{
    context::Context,
    dispatch::{Inline, ResultDispatcher},
    error::Error,
    interceptor::Interceptor,
    message::Message,
    status::CallResult,
    tls::ClientCredentials,
    util::display_deadline,
    worker::CompletionWorker,
};
use connection::{Connector, Settings};
use parking_lot::Mutex;
use std::{fmt, sync::Arc, time::Duration};
use tokio::runtime::{Handle, Runtime};
use tokio_rustls::{rustls, TlsConnector};
use tracing::{info, info_span, trace, Span};
use unary::{UnaryCall, UnaryReply};

/// Settings that control the behavior of the client.
#[derive(Clone)]
#[non_exhaustive]
pub struct Config {
    /// How often an idle connection is probed.
    pub keepalive_interval: Duration,
    /// How long a probe may go unanswered before the connection is declared dead.
    pub keepalive_timeout: Duration,
    /// The largest frame accepted from the server. Unbounded by default.
    pub max_frame_length: usize,
    /// Threads driving the channel's connection I/O.
    pub io_threads: usize,
    /// How long a duplex write loop waits for the application before it checks the outbound
    /// queue again. Enqueuing a packet or cancelling wakes it early.
    pub write_retry_interval: Duration,
    /// Where call results are delivered.
    pub dispatcher: Arc<dyn ResultDispatcher>,
    /// Hooks run on every call, in order.
    pub interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            keepalive_interval: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(10),
            max_frame_length: usize::MAX,
            io_threads: 1,
            write_retry_interval: Duration::from_millis(10),
            dispatcher: Arc::new(Inline),
            interceptors: vec![],
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("keepalive_interval", &self.keepalive_interval)
            .field("keepalive_timeout", &self.keepalive_timeout)
            .field("max_frame_length", &self.max_frame_length)
            .field("io_threads", &self.io_threads)
            .field("write_retry_interval", &self.write_retry_interval)
            .field("interceptors", &self.interceptors.len())
            .finish_non_exhaustive()
    }
}

/// What every call operation of a channel needs.
pub(crate) struct Shared {
    pub(crate) connector: Arc<Connector>,
    pub(crate) handle: Handle,
    pub(crate) dispatcher: Arc<dyn ResultDispatcher>,
    pub(crate) interceptors: Arc<[Arc<dyn Interceptor>]>,
    pub(crate) write_retry_interval: Duration,
}

/// A connection to one server address, shared by every call issued on it.
///
/// Each channel owns a completion worker, whose thread advances all of the channel's calls, and
/// a small runtime for connection I/O. The connection itself is opened on first use.
pub struct ClientChannel {
    address: String,
    worker: CompletionWorker,
    runtime: Mutex<Option<Runtime>>,
    shared: Arc<Shared>,
}

impl ClientChannel {
    /// Creates a channel to `address` (`host:port`).
    ///
    /// Nothing is sent until the first call. Fails if the address is malformed or the engine
    /// threads cannot be started. TLS requires `host` to be a DNS name.
    pub fn connect(
        address: impl Into<String>,
        credentials: ClientCredentials,
        config: Config,
    ) -> Result<Self, Error> {
        let address = address.into();
        let host = match address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => host,
            _ => return Err(Error::InvalidAddress(address)),
        };
        let tls = match &credentials {
            ClientCredentials::Insecure => None,
            ClientCredentials::Tls(tls_config) => {
                let host = host.trim_start_matches('[').trim_end_matches(']');
                let server_name = rustls::ServerName::try_from(host)
                    .map_err(|_| Error::InvalidAddress(address.clone()))?;
                Some((TlsConnector::from(tls_config.clone()), server_name))
            }
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.io_threads.max(1))
            .thread_name(format!("tagrpc-io {address}"))
            .enable_all()
            .build()
            .map_err(Error::Spawn)?;
        let worker = CompletionWorker::start(format!("tagrpc-client {address}"))
            .map_err(Error::Spawn)?;
        let connector = Connector::new(address.clone(), tls, Settings::from(&config));
        let shared = Arc::new(Shared {
            connector: Arc::new(connector),
            handle: runtime.handle().clone(),
            dispatcher: config.dispatcher,
            interceptors: config.interceptors.into(),
            write_retry_interval: config.write_retry_interval,
        });
        info!(%address, secure = credentials.is_secure(), "ChannelCreated");
        Ok(Self {
            address,
            worker,
            runtime: Mutex::new(Some(runtime)),
            shared,
        })
    }

    /// The address this channel connects to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Returns false once the channel was stopped.
    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Issues a unary call. Returns immediately; `on_response` is later run exactly once,
    /// through the channel's dispatcher, with the call's result and, on success, the response.
    pub fn unary<Req, Resp, F>(&self, method: &str, ctx: Context, request: &Req, on_response: F)
    where
        Req: Message,
        Resp: Message,
        F: FnOnce(CallResult, Option<Resp>) + Send + 'static,
    {
        let ctx = self.intercept(method, ctx);
        let span = call_span(method, &ctx);
        let call = UnaryCall::<Resp>::new(
            method.to_string(),
            self.shared.clone(),
            Box::new(on_response),
            span.clone(),
        );
        let payload = request.encode();
        let method = method.to_string();
        let connector = self.shared.connector.clone();
        let handle = self.shared.handle.clone();
        call.start(self.worker.queue(), move |slot, completer| {
            let _entered = span.enter();
            trace!("SendRequest");
            handle.spawn(async move {
                let reply = match connector.open(&method, &ctx).await {
                    Ok(call) => {
                        call.send_message(payload);
                        call.half_close();
                        let mut response = None;
                        while let Some(message) = call.read().await {
                            response.get_or_insert(message);
                        }
                        let (status, trailers) = call.finish().await;
                        UnaryReply {
                            status,
                            trailers,
                            payload: response,
                        }
                    }
                    Err(status) => UnaryReply::failed(status),
                };
                slot.put(reply);
                completer.complete(true);
            });
        });
    }

    /// Opens a full-duplex streaming call.
    ///
    /// Requests are taken from `stream` as the application queues them; responses, state
    /// changes, and the single terminal result go to `observer` through the channel's
    /// dispatcher. Packets that do not decode as `Req` are skipped.
    pub fn duplex<Req, Resp, O>(&self, method: &str, ctx: Context, stream: StreamContext, observer: O)
    where
        Req: Message,
        Resp: Message,
        O: StreamObserver<Resp>,
    {
        let ctx = self.intercept(method, ctx);
        let span = call_span(method, &ctx);
        duplex::start::<Req, Resp>(
            self.shared.clone(),
            self.worker.queue(),
            method.to_string(),
            ctx,
            stream,
            Box::new(observer),
            span,
        );
    }

    /// Stops the channel. Every call still in flight resolves `UNAVAILABLE`; this returns once
    /// they have all been delivered, unless called from a result callback on the channel's
    /// own worker thread. Calls issued afterwards resolve `UNAVAILABLE` immediately.
    pub fn stop(&self) {
        self.worker.stop();
        self.worker.join();
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        info!(address = %self.address, "ChannelStopped");
    }

    fn intercept(&self, method: &str, mut ctx: Context) -> Context {
        for interceptor in self.shared.interceptors.iter() {
            interceptor.intercept_request(method, &mut ctx.metadata);
        }
        ctx
    }
}

impl Drop for ClientChannel {
    fn drop(&mut self) {
        if self.worker.is_running() {
            self.stop();
        }
    }
}

impl fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientChannel")
            .field("address", &self.address)
            .field("worker", &self.worker)
            .finish()
    }
}

fn call_span(method: &str, ctx: &Context) -> Span {
    info_span!(
        "RPC",
        rpc.trace_id = %ctx.trace_id(),
        rpc.span_id = %ctx.trace_context.span_id,
        rpc.deadline = %display_deadline(ctx.deadline),
        otel.kind = "client",
        otel.name = %method,
    )
}

// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Provides a server that dispatches inbound calls to handlers by method name.

mod accept;
mod incoming;
mod registry;

pub use registry::{service_name, Dispatcher, Handler, ServiceError, ServiceRegistry};

use crate::{error::Error, tls::ServerCredentials, worker::CompletionWorker};
use accept::{AcceptJob, ServerShared};
use incoming::Acceptor;
use parking_lot::Mutex;
use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{net::TcpListener, runtime::Runtime};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Settings that control the behavior of the server.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Config {
    /// The largest frame accepted from a client. Unbounded by default.
    pub max_frame_length: usize,
    /// Threads driving connection I/O and handler scheduling.
    pub io_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_frame_length: usize::MAX,
            io_threads: 1,
        }
    }
}

/// A listening endpoint whose inbound calls are served by handlers looked up by method name.
///
/// The server owns a completion worker that advances every call, and a runtime for connection
/// I/O. Handlers run on the runtime's blocking pool.
pub struct ServerEngine {
    local_addr: SocketAddr,
    worker: CompletionWorker,
    runtime: Mutex<Option<Runtime>>,
    shared: Arc<ServerShared>,
    shutdown: CancellationToken,
    dispatching: AtomicBool,
}

impl ServerEngine {
    /// Binds `address` and starts accepting connections.
    ///
    /// Calls are queued until [`start_dispatch_loop`](Self::start_dispatch_loop) is called.
    pub fn bind(
        address: &str,
        credentials: ServerCredentials,
        config: Config,
    ) -> Result<Self, Error> {
        let bind_error = |source| Error::Bind {
            address: address.to_string(),
            source,
        };
        let listener = std::net::TcpListener::bind(address).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.io_threads.max(1))
            .thread_name(format!("tagrpc-io {local_addr}"))
            .enable_all()
            .build()
            .map_err(Error::Spawn)?;
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(listener).map_err(bind_error)?
        };
        let worker =
            CompletionWorker::start(format!("tagrpc-server {local_addr}")).map_err(Error::Spawn)?;

        let tls = match &credentials {
            ServerCredentials::Insecure => None,
            ServerCredentials::Tls(tls_config) => Some(TlsAcceptor::from(tls_config.clone())),
        };
        let acceptor = Arc::new(Acceptor::default());
        let shutdown = CancellationToken::new();
        runtime.spawn(incoming::accept_loop(
            listener,
            tls,
            acceptor.clone(),
            config.max_frame_length,
            shutdown.clone(),
        ));
        info!(%local_addr, secure = credentials.is_secure(), "ServerListening");

        Ok(Self {
            local_addr,
            worker,
            shared: Arc::new(ServerShared {
                acceptor,
                outstanding: Default::default(),
                handle: runtime.handle().clone(),
            }),
            runtime: Mutex::new(Some(runtime)),
            shutdown,
            dispatching: AtomicBool::new(false),
        })
    }

    /// Starts serving queued and future calls with handlers from `dispatcher`.
    ///
    /// Returns false, leaving the running loop untouched, if the loop was already started.
    pub fn start_dispatch_loop(&self, dispatcher: Arc<dyn Dispatcher>) -> bool {
        if self.dispatching.swap(true, Ordering::AcqRel) {
            warn!(local_addr = %self.local_addr, "Dispatch loop already running");
            return false;
        }
        AcceptJob::spawn(self.shared.clone(), dispatcher, self.worker.queue());
        true
    }

    /// Accept operations currently waiting for an inbound call. Never zero while the dispatch
    /// loop runs.
    pub fn outstanding_accepts(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// The address the server listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns false once the server was stopped.
    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Stops listening, drops every connection, and abandons calls in progress. Returns once
    /// the worker thread has drained its queue.
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.shared.acceptor.close();
        self.worker.stop();
        self.worker.join();
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        info!(local_addr = %self.local_addr, "Shutdown");
    }
}

impl Drop for ServerEngine {
    fn drop(&mut self) {
        if self.worker.is_running() {
            self.stop();
        }
    }
}

impl fmt::Debug for ServerEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerEngine")
            .field("local_addr", &self.local_addr)
            .field("worker", &self.worker)
            .field("outstanding_accepts", &self.outstanding_accepts())
            .field("queued_calls", &self.shared.acceptor.backlog())
            .finish()
    }
}

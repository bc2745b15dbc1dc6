// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! One place to own an application's named channels, its services, and its server.

use crate::{
    client::{self, ClientChannel},
    error::Error,
    interceptor::Interceptor,
    server::{self, Handler, ServerEngine, ServiceRegistry},
    tls::{ClientCredentials, ServerCredentials},
};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::{fmt, net::SocketAddr, sync::Arc};
use tracing::info;

/// Owns named client channels, a service registry, and at most one running server.
///
/// Channels are created on first request and reused afterwards. Interceptors registered on
/// the hub apply to channels created after registration.
pub struct Hub {
    client_config: client::Config,
    clients: Mutex<FnvHashMap<String, Arc<ClientChannel>>>,
    interceptors: Mutex<Vec<Arc<dyn Interceptor>>>,
    registry: Arc<ServiceRegistry>,
    server: Mutex<Option<ServerEngine>>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(client::Config::default())
    }
}

impl Hub {
    /// Creates a hub whose channels start from `client_config`.
    pub fn new(client_config: client::Config) -> Self {
        Self {
            client_config,
            clients: Default::default(),
            interceptors: Default::default(),
            registry: Arc::new(ServiceRegistry::new()),
            server: Default::default(),
        }
    }

    /// Returns the channel named `name`, creating it for `address` if there is none yet. An
    /// existing channel is returned as is, whatever `address` says.
    pub fn client(
        &self,
        name: &str,
        address: &str,
        credentials: ClientCredentials,
    ) -> Result<Arc<ClientChannel>, Error> {
        let mut clients = self.clients.lock();
        if let Some(channel) = clients.get(name) {
            return Ok(channel.clone());
        }
        let mut config = self.client_config.clone();
        config
            .interceptors
            .extend(self.interceptors.lock().iter().cloned());
        let channel = Arc::new(ClientChannel::connect(address, credentials, config)?);
        info!(client = name, %address, "ClientCreated");
        clients.insert(name.to_string(), channel.clone());
        Ok(channel)
    }

    /// Serves every method of `service` with `handler`.
    pub fn register_service(&self, service: impl Into<String>, handler: impl Handler) {
        self.registry.register(service, handler);
    }

    /// Adds `interceptor` to channels created from now on.
    pub fn register_interceptor(&self, interceptor: impl Interceptor) {
        self.interceptors.lock().push(Arc::new(interceptor));
    }

    /// The registry that routes the hub server's calls.
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Stops any running server, then binds a new one serving the registered services.
    pub fn start_server(
        &self,
        address: &str,
        credentials: ServerCredentials,
        config: server::Config,
    ) -> Result<SocketAddr, Error> {
        self.stop_server();
        let server = ServerEngine::bind(address, credentials, config)?;
        server.start_dispatch_loop(self.registry.clone());
        let local_addr = server.local_addr();
        *self.server.lock() = Some(server);
        Ok(local_addr)
    }

    /// The address of the running server, if any.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server.lock().as_ref().map(ServerEngine::local_addr)
    }

    /// Stops the running server, if any, and waits for its worker to exit.
    pub fn stop_server(&self) {
        let server = self.server.lock().take();
        if let Some(server) = server {
            server.stop();
        }
    }

    /// Stops every channel and the server, and forgets the registered services and interceptors.
    pub fn shutdown(&self) {
        let clients = std::mem::take(&mut *self.clients.lock());
        for (_, channel) in clients {
            channel.stop();
        }
        self.stop_server();
        for service in self.registry.services() {
            self.registry.unregister(&service);
        }
        self.interceptors.lock().clear();
        info!("HubShutdown");
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("clients", &self.clients.lock().keys().collect::<Vec<_>>())
            .field("registry", &self.registry)
            .field("server", &self.server_addr())
            .finish_non_exhaustive()
    }
}

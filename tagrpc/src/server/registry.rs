// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use bytes::Bytes;
use fnv::FnvHashMap;
use parking_lot::RwLock;
use std::{fmt, sync::Arc};
use tracing::debug;

/// A handler's refusal to serve a request. Reported to the client as `ABORTED` with
/// [`message`](Self::message).
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ServiceError {
    /// Sent to the client as the status message.
    pub message: String,
}

impl ServiceError {
    /// Creates an error with the given status message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Serves calls without compile-time knowledge of their schema.
///
/// Handlers run on a blocking thread pool, never on the completion worker, so they may block.
pub trait Handler: Send + Sync + 'static {
    /// Produces the response to `request`, a call to `method`.
    fn handle(&self, method: &str, request: Bytes) -> Result<Bytes, ServiceError>;
}

impl<F> Handler for F
where
    F: Fn(&str, Bytes) -> Result<Bytes, ServiceError> + Send + Sync + 'static,
{
    fn handle(&self, method: &str, request: Bytes) -> Result<Bytes, ServiceError> {
        self(method, request)
    }
}

/// Maps method names to handlers. A method without a handler is answered `UNIMPLEMENTED`.
pub trait Dispatcher: Send + Sync + 'static {
    /// Returns the handler for `method`, if any.
    fn resolve(&self, method: &str) -> Option<Arc<dyn Handler>>;
}

impl<F> Dispatcher for F
where
    F: Fn(&str) -> Option<Arc<dyn Handler>> + Send + Sync + 'static,
{
    fn resolve(&self, method: &str) -> Option<Arc<dyn Handler>> {
        self(method)
    }
}

type Services = FnvHashMap<String, Arc<dyn Handler>>;

/// A [`Dispatcher`] routing `/package.Service/Method` to the handler registered for
/// `package.Service`.
///
/// Lookups read an immutable snapshot of the map. Registration copies the map, modifies the copy,
/// and publishes it, so services may be added while calls are being served.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<Arc<Services>>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for every method of `service`, replacing any previous handler.
    pub fn register(&self, service: impl Into<String>, handler: impl Handler) {
        let service = service.into();
        debug!(%service, "RegisterService");
        let handler: Arc<dyn Handler> = Arc::new(handler);
        let mut services = self.services.write();
        let mut updated = Services::clone(&services);
        updated.insert(service, handler);
        *services = Arc::new(updated);
    }

    /// Removes the handler of `service`. Returns false if there was none.
    pub fn unregister(&self, service: &str) -> bool {
        let mut services = self.services.write();
        if !services.contains_key(service) {
            return false;
        }
        let mut updated = Services::clone(&services);
        updated.remove(service);
        *services = Arc::new(updated);
        true
    }

    /// The names of registered services, in no particular order.
    pub fn services(&self) -> Vec<String> {
        self.snapshot().keys().cloned().collect()
    }

    fn snapshot(&self) -> Arc<Services> {
        self.services.read().clone()
    }
}

/// The service part of `/package.Service/Method`.
pub fn service_name(method: &str) -> Option<&str> {
    let (service, method) = method.strip_prefix('/')?.split_once('/')?;
    if service.is_empty() || method.is_empty() || method.contains('/') {
        return None;
    }
    Some(service)
}

impl Dispatcher for ServiceRegistry {
    fn resolve(&self, method: &str) -> Option<Arc<dyn Handler>> {
        let service = service_name(method)?;
        self.snapshot().get(service).cloned()
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.services())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    // Test-only: lets `assert_matches!` print `Option<Arc<dyn Handler>>` on failure.
    impl fmt::Debug for dyn Handler {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("dyn Handler")
        }
    }

    fn echo(_: &str, request: Bytes) -> Result<Bytes, ServiceError> {
        Ok(request)
    }

    #[test]
    fn method_paths_resolve_to_their_service() {
        assert_eq!(service_name("/hello.World/Hello"), Some("hello.World"));
        assert_eq!(service_name("hello.World/Hello"), None);
        assert_eq!(service_name("/hello.World/"), None);
        assert_eq!(service_name("//Hello"), None);
        assert_eq!(service_name("/a/b/c"), None);
    }

    #[test]
    fn registry_routes_by_service() {
        let registry = ServiceRegistry::new();
        assert_matches!(registry.resolve("/hello.World/Hello"), None);
        registry.register("hello.World", echo);
        let handler = registry.resolve("/hello.World/Hello").unwrap();
        assert_eq!(
            handler.handle("/hello.World/Hello", Bytes::from_static(b"hi")),
            Ok(Bytes::from_static(b"hi"))
        );
        assert_matches!(registry.resolve("/hello.Other/Hello"), None);
        assert!(registry.unregister("hello.World"));
        assert!(!registry.unregister("hello.World"));
        assert_matches!(registry.resolve("/hello.World/Hello"), None);
    }

    #[test]
    fn snapshots_are_unaffected_by_later_registration() {
        let registry = ServiceRegistry::new();
        let before = registry.snapshot();
        registry.register("a.A", echo);
        assert!(before.is_empty());
        assert_eq!(registry.services(), vec!["a.A".to_string()]);
    }

    #[test]
    fn closures_are_dispatchers() {
        let dispatcher = |method: &str| -> Option<Arc<dyn Handler>> {
            (method == "/x.X/Y").then(|| Arc::new(echo) as Arc<dyn Handler>)
        };
        assert!(dispatcher.resolve("/x.X/Y").is_some());
        assert!(dispatcher.resolve("/x.X/Z").is_none());
    }
}

use bytes::Bytes;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tagrpc::{
    client,
    dispatch::QueueDispatcher,
    interceptor::Interceptor,
    server::{self, ServiceError},
    CallResult, ClientCredentials, Code, Context, Hub, Metadata, ServerCredentials,
};

mod common;

#[derive(Clone, Default)]
struct Stamp {
    seen: Arc<Mutex<Vec<(String, Code)>>>,
}

impl Interceptor for Stamp {
    fn intercept_request(&self, _: &str, metadata: &mut Metadata) {
        metadata.insert("x-client", "hub-test");
    }

    fn intercept_response(&self, method: &str, result: &CallResult) {
        self.seen.lock().push((method.to_string(), result.status_code));
    }
}

#[test]
fn hub_serves_registered_services_to_named_clients() {
    common::init_tracing();
    let dispatcher = QueueDispatcher::new();
    let mut config = client::Config::default();
    config.dispatcher = dispatcher.clone();
    let hub = Hub::new(config);

    let stamp = Stamp::default();
    hub.register_interceptor(stamp.clone());
    hub.register_service(
        "hello.World",
        |_: &str, name: Bytes| -> Result<Bytes, ServiceError> {
            Ok(Bytes::from(format!("Hello, {}!", String::from_utf8_lossy(&name))))
        },
    );
    let addr = hub
        .start_server(
            "127.0.0.1:0",
            ServerCredentials::Insecure,
            server::Config::default(),
        )
        .unwrap();
    assert_eq!(hub.server_addr(), Some(addr));

    let greeter = hub
        .client("greeter", &addr.to_string(), ClientCredentials::Insecure)
        .unwrap();
    let again = hub
        .client("greeter", "ignored:1", ClientCredentials::Insecure)
        .unwrap();
    assert!(Arc::ptr_eq(&greeter, &again));

    let (tx, rx) = flume::bounded(1);
    greeter.unary(
        "/hello.World/Hello",
        Context::default(),
        &"hub".to_string(),
        move |result, response: Option<String>| {
            let _ = tx.send((result, response));
        },
    );
    // Results wait in the dispatcher until the application pumps it.
    while !dispatcher.run_one(Duration::from_secs(10)) {}
    let (result, response) = rx.try_recv().unwrap();
    assert_eq!(result.status_code, Code::Ok);
    assert_eq!(response.as_deref(), Some("Hello, hub!"));
    assert_eq!(
        *stamp.seen.lock(),
        vec![("/hello.World/Hello".to_string(), Code::Ok)]
    );

    hub.shutdown();
    assert!(!greeter.is_running());
    assert_eq!(hub.server_addr(), None);
    assert!(hub.registry().services().is_empty());
}

#[test]
fn interceptors_decorate_request_metadata() {
    common::init_tracing();
    let echo = common::EchoServer::start();
    let hub = Hub::default();
    hub.register_interceptor(Stamp::default());

    let channel = hub
        .client("echo", &echo.addr.to_string(), ClientCredentials::Insecure)
        .unwrap();
    let stream = client::StreamContext::new();
    assert!(stream.complete());
    let (tx, rx) = flume::unbounded();
    channel.duplex::<String, String, _>(
        "/echo.Echo/Chat",
        Context::default().with_metadata("x-request", "1"),
        stream,
        common::Recorder(tx),
    );
    common::notes_until_closed(&rx);

    let headers = echo.headers.lock();
    assert_eq!(headers.len(), 1);
    assert_eq!(headers[0].get("x-request"), Some("1"));
    assert_eq!(headers[0].get("x-client"), Some("hub-test"));
}

#[test]
fn dispatch_functions_see_the_full_method_path() {
    common::init_tracing();
    let seen = Arc::new(Mutex::new(None));
    let server = tagrpc::ServerEngine::bind(
        "127.0.0.1:0",
        ServerCredentials::Insecure,
        server::Config::default(),
    )
    .unwrap();
    let lookup = {
        let seen = seen.clone();
        move |method: &str| -> Option<Arc<dyn server::Handler>> {
            *seen.lock() = Some(method.to_string());
            None
        }
    };
    assert!(server.start_dispatch_loop(Arc::new(lookup)));
    assert!(!server.start_dispatch_loop(Arc::new(server::ServiceRegistry::new())));

    let channel = common::channel(server.local_addr(), client::Config::default());
    let (tx, rx) = flume::bounded(1);
    channel.unary(
        "/missing.Service/Call",
        Context::default(),
        &Bytes::new(),
        move |result, _: Option<Bytes>| {
            let _ = tx.send(result);
        },
    );
    let result = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(result.status_code, Code::Unimplemented);
    assert_eq!(seen.lock().as_deref(), Some("/missing.Service/Call"));
}

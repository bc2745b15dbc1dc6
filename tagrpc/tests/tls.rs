use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use tagrpc::{
    client::{self, ClientChannel},
    server::{self, ServerEngine, ServiceError, ServiceRegistry},
    CallResult, ClientCredentials, Code, Context, ServerCredentials,
};

mod common;

const CA: &str = include_str!("certs/ca.pem");
const SERVER_CERT: &str = include_str!("certs/server.pem");
const SERVER_KEY: &str = include_str!("certs/server.key");
const CLIENT_CERT: &str = include_str!("certs/client.pem");
const CLIENT_KEY: &str = include_str!("certs/client.key");

fn secure_server(client_root: Option<&str>) -> ServerEngine {
    let credentials =
        ServerCredentials::from_pem(Some(SERVER_CERT), Some(SERVER_KEY), client_root).unwrap();
    assert!(credentials.is_secure());
    let server =
        ServerEngine::bind("127.0.0.1:0", credentials, server::Config::default()).unwrap();
    let registry = ServiceRegistry::new();
    registry.register(
        "echo.Echo",
        |_: &str, request: Bytes| -> Result<Bytes, ServiceError> { Ok(request) },
    );
    server.start_dispatch_loop(Arc::new(registry));
    server
}

fn call(server: &ServerEngine, credentials: ClientCredentials) -> CallResult {
    let address = format!("localhost:{}", server.local_addr().port());
    let channel = ClientChannel::connect(address, credentials, client::Config::default()).unwrap();
    let (tx, rx) = flume::bounded(1);
    channel.unary(
        "/echo.Echo/Echo",
        Context::default(),
        &"secret".to_string(),
        move |result, response: Option<String>| {
            let _ = tx.send((result, response));
        },
    );
    let (result, response) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    if result.succeeded {
        assert_eq!(response.as_deref(), Some("secret"));
    }
    result
}

#[test]
fn server_authenticated_tls() {
    common::init_tracing();
    let server = secure_server(None);
    let credentials = ClientCredentials::from_pem(Some(CA), None, None).unwrap();
    assert_eq!(call(&server, credentials).status_code, Code::Ok);
}

#[test]
fn mutually_authenticated_tls() {
    common::init_tracing();
    let server = secure_server(Some(CA));
    let credentials =
        ClientCredentials::from_pem(Some(CA), Some(CLIENT_CERT), Some(CLIENT_KEY)).unwrap();
    assert_eq!(call(&server, credentials).status_code, Code::Ok);
}

#[test]
fn missing_client_certificate_is_unavailable() {
    common::init_tracing();
    let server = secure_server(Some(CA));
    let credentials = ClientCredentials::from_pem(Some(CA), None, None).unwrap();
    assert_eq!(call(&server, credentials).status_code, Code::Unavailable);
}

#[test]
fn plaintext_client_cannot_talk_to_a_tls_server() {
    common::init_tracing();
    let server = secure_server(None);
    assert_eq!(
        call(&server, ClientCredentials::Insecure).status_code,
        Code::Unavailable
    );
}

#[test]
fn tls_requires_a_dns_name() {
    let credentials = ClientCredentials::from_pem(Some(CA), None, None).unwrap();
    assert!(ClientChannel::connect("not a host:1", credentials, client::Config::default()).is_err());
}

use bytes::Bytes;
use common::EchoServer;
use rand::Rng;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tagrpc::{
    client::{self, StreamContext, StreamObserver},
    server::{self, ServerEngine, ServiceError, ServiceRegistry},
    CallResult, Context, ServerCredentials,
};

mod common;

struct Counting {
    terminals: Arc<AtomicUsize>,
    done: flume::Sender<()>,
}

impl StreamObserver<String> for Counting {
    fn on_message(&mut self, _: String) {}

    fn on_result(&mut self, _: CallResult) {
        self.terminals.fetch_add(1, Ordering::SeqCst);
        let _ = self.done.send(());
    }
}

#[test]
fn every_call_terminates_exactly_once() {
    common::init_tracing();
    let registry = ServiceRegistry::new();
    registry.register(
        "test.Service",
        |method: &str, request: Bytes| -> Result<Bytes, ServiceError> {
            match method {
                "/test.Service/Ok" => Ok(request),
                _ => Err(ServiceError::new("refused")),
            }
        },
    );
    let server = ServerEngine::bind(
        "127.0.0.1:0",
        ServerCredentials::Insecure,
        server::Config::default(),
    )
    .unwrap();
    server.start_dispatch_loop(Arc::new(registry));
    let echo = EchoServer::start();
    let dead = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let unary_channel = common::channel(server.local_addr(), client::Config::default());
    let duplex_channel = common::channel(echo.addr, client::Config::default());
    let dead_channel = common::channel(dead, client::Config::default());

    let mut rng = rand::thread_rng();
    let (done, finished) = flume::unbounded();
    let mut counters = vec![];
    for _ in 0..100 {
        let terminals = Arc::new(AtomicUsize::new(0));
        counters.push(terminals.clone());
        let ctx = if rng.gen_bool(0.2) {
            Context::default().with_timeout(Duration::from_millis(rng.gen_range(1..20)))
        } else {
            Context::default()
        };
        match rng.gen_range(0..5) {
            0 | 1 => {
                let method = if rng.gen_bool(0.5) {
                    "/test.Service/Ok"
                } else {
                    "/test.Service/Fail"
                };
                let done = done.clone();
                unary_channel.unary(
                    method,
                    ctx,
                    &"request".to_string(),
                    move |_, _: Option<String>| {
                        terminals.fetch_add(1, Ordering::SeqCst);
                        let _ = done.send(());
                    },
                );
            }
            2 | 3 => {
                let stream = StreamContext::new();
                for i in 0..rng.gen_range(0..5) {
                    stream.write(format!("m{i}"));
                }
                let cancel_after = rng.gen_bool(0.5).then(|| rng.gen_range(0..5));
                if cancel_after.is_none() {
                    stream.complete();
                }
                duplex_channel.duplex::<String, String, _>(
                    "/echo.Echo/Chat",
                    ctx,
                    stream.clone(),
                    Counting {
                        terminals,
                        done: done.clone(),
                    },
                );
                if let Some(millis) = cancel_after {
                    std::thread::spawn(move || {
                        std::thread::sleep(Duration::from_millis(millis));
                        stream.cancel();
                    });
                }
            }
            _ => {
                dead_channel.duplex::<String, String, _>(
                    "/echo.Echo/Chat",
                    ctx,
                    StreamContext::new(),
                    Counting {
                        terminals,
                        done: done.clone(),
                    },
                );
            }
        }
    }

    for _ in 0..100 {
        finished
            .recv_timeout(Duration::from_secs(20))
            .expect("a call never terminated");
    }
    unary_channel.stop();
    duplex_channel.stop();
    dead_channel.stop();
    server.stop();

    for (i, terminals) in counters.iter().enumerate() {
        assert_eq!(terminals.load(Ordering::SeqCst), 1, "call {i}");
    }
}

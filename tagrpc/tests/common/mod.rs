#![allow(dead_code)]

use bytes::Bytes;
use futures::prelude::*;
use parking_lot::Mutex;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tagrpc::{
    client::{self, ClientChannel, StreamObserver, StreamState},
    wire::{self, ClientFrame, ServerFrame, ServerTransport},
    CallResult, ClientCredentials, Code, Metadata,
};
use tokio::{
    net::{TcpListener, TcpStream},
    runtime::Runtime,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn channel(addr: SocketAddr, config: client::Config) -> ClientChannel {
    ClientChannel::connect(addr.to_string(), ClientCredentials::Insecure, config).unwrap()
}

/// A server speaking the raw wire protocol. Echoes every message, sends numbered messages `0`
/// to `n - 1` for a message `burst:n`, and finishes a call with `OK` once the client
/// half-closes.
pub struct EchoServer {
    pub addr: SocketAddr,
    pub received: Arc<AtomicUsize>,
    /// Request metadata of every call started, in arrival order.
    pub headers: Arc<Mutex<Vec<Metadata>>>,
    _runtime: Runtime,
}

impl EchoServer {
    pub fn start() -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let listener = runtime.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(AtomicUsize::new(0));
        let headers = Arc::new(Mutex::new(vec![]));
        runtime.spawn(accept(listener, received.clone(), headers.clone()));
        Self {
            addr,
            received,
            headers,
            _runtime: runtime,
        }
    }

    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

async fn accept(
    listener: TcpListener,
    received: Arc<AtomicUsize>,
    headers: Arc<Mutex<Vec<Metadata>>>,
) {
    while let Ok((tcp, _)) = listener.accept().await {
        tokio::spawn(echo(tcp, received.clone(), headers.clone()));
    }
}

async fn echo(tcp: TcpStream, received: Arc<AtomicUsize>, headers: Arc<Mutex<Vec<Metadata>>>) {
    let mut transport: ServerTransport<TcpStream> = wire::bincode(tcp, usize::MAX);
    while let Some(Ok(frame)) = transport.next().await {
        let replies = match frame {
            ClientFrame::Message { call_id, payload } => {
                received.fetch_add(1, Ordering::SeqCst);
                let burst = std::str::from_utf8(&payload)
                    .ok()
                    .and_then(|text| text.strip_prefix("burst:"))
                    .and_then(|n| n.parse::<usize>().ok());
                match burst {
                    Some(n) => (0..n)
                        .map(|i| ServerFrame::Message {
                            call_id,
                            payload: Bytes::from(i.to_string()),
                        })
                        .collect(),
                    None => vec![ServerFrame::Message { call_id, payload }],
                }
            }
            ClientFrame::HalfClose { call_id } => vec![ServerFrame::Status {
                call_id,
                code: Code::Ok,
                message: String::new(),
                trailers: [("echo", "done")].into_iter().collect(),
            }],
            ClientFrame::Ping { nonce } => vec![ServerFrame::Pong { nonce }],
            ClientFrame::Start { metadata, .. } => {
                headers.lock().push(metadata);
                vec![]
            }
            ClientFrame::Cancel { .. } => vec![],
        };
        for reply in replies {
            if transport.send(reply).await.is_err() {
                return;
            }
        }
    }
}

/// Everything a duplex call reported, in order.
#[derive(Debug, PartialEq)]
pub enum Note {
    Message(String),
    State(StreamState),
    Result(Code),
}

/// Forwards duplex notifications to a channel.
pub struct Recorder(pub flume::Sender<Note>);

impl StreamObserver<String> for Recorder {
    fn on_message(&mut self, message: String) {
        let _ = self.0.send(Note::Message(message));
    }

    fn on_state(&mut self, state: StreamState) {
        let _ = self.0.send(Note::State(state));
    }

    fn on_result(&mut self, result: CallResult) {
        let _ = self.0.send(Note::Result(result.status_code));
    }
}

/// Collects notes until the call reports `Closed`.
pub fn notes_until_closed(rx: &flume::Receiver<Note>) -> Vec<Note> {
    let mut notes = vec![];
    loop {
        let note = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("call did not close");
        let closed = note == Note::State(StreamState::Closed);
        notes.push(note);
        if closed {
            return notes;
        }
    }
}

pub fn metadata(pairs: &[(&str, &str)]) -> Metadata {
    pairs.iter().copied().collect()
}

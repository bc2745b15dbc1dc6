// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Accepting connections and turning their frames into whole inbound calls.

use crate::{
    completion::{Completer, Slot},
    status::{Metadata, Status},
    trace,
    util::TimeUntil,
    wire::{self, BoxIo, ClientFrame, Outbound, ServerFrame, ServerTransport},
};
use bytes::Bytes;
use fnv::FnvHashMap;
use futures::prelude::*;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};
use tokio::{net::TcpListener, sync::mpsc, time::MissedTickBehavior};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// A call whose request has fully arrived and which awaits a handler.
pub(crate) struct InboundCall {
    pub(crate) method: String,
    pub(crate) metadata: Metadata,
    pub(crate) deadline: Option<SystemTime>,
    pub(crate) trace_context: trace::Context,
    pub(crate) payload: Bytes,
    pub(crate) responder: Responder,
}

impl fmt::Debug for InboundCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundCall")
            .field("method", &self.method)
            .field("call_id", &self.responder.call_id)
            .finish_non_exhaustive()
    }
}

/// Sends the response of one inbound call.
pub(crate) struct Responder {
    call_id: u64,
    outbound: mpsc::UnboundedSender<Outbound<ServerFrame>>,
    cancelled: Arc<AtomicBool>,
    live: Arc<Mutex<FnvHashMap<u64, Arc<AtomicBool>>>>,
    connection: CancellationToken,
}

impl Responder {
    /// True if the client cancelled the call or its connection is gone.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.connection.is_cancelled()
    }

    /// Sends the response message, if any, then the final status. `completer` succeeds once
    /// the status is written, and fails if the call was abandoned.
    pub(crate) fn respond(
        self,
        status: Status,
        payload: Option<Bytes>,
        trailers: Metadata,
        completer: Completer,
    ) {
        if self.is_abandoned() {
            debug!(call_id = self.call_id, "Call abandoned before responding");
            completer.complete(false);
            return;
        }
        let call_id = self.call_id;
        if let Some(payload) = payload {
            let _ = self
                .outbound
                .send(Outbound::frame(ServerFrame::Message { call_id, payload }));
        }
        let _ = self.outbound.send(Outbound::acked(
            ServerFrame::Status {
                call_id,
                code: status.code,
                message: status.message,
                trailers,
            },
            completer,
        ));
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.live.lock().remove(&self.call_id);
    }
}

#[derive(Default)]
struct Queues {
    waiting: VecDeque<(Slot<InboundCall>, Completer)>,
    ready: VecDeque<InboundCall>,
    closed: bool,
}

/// Pairs inbound calls with outstanding accept requests, in arrival order.
#[derive(Default)]
pub(crate) struct Acceptor {
    queues: Mutex<Queues>,
}

impl Acceptor {
    /// Asks for the next inbound call. `completer` succeeds once `slot` holds one.
    pub(crate) fn request(&self, slot: Slot<InboundCall>, completer: Completer) {
        let mut queues = self.queues.lock();
        if queues.closed {
            drop(queues);
            completer.complete(false);
            return;
        }
        match queues.ready.pop_front() {
            Some(call) => {
                drop(queues);
                slot.put(call);
                completer.complete(true);
            }
            None => queues.waiting.push_back((slot, completer)),
        }
    }

    fn push(&self, call: InboundCall) {
        let mut queues = self.queues.lock();
        if queues.closed {
            return;
        }
        match queues.waiting.pop_front() {
            Some((slot, completer)) => {
                drop(queues);
                slot.put(call);
                completer.complete(true);
            }
            None => queues.ready.push_back(call),
        }
    }

    /// Fails every outstanding request and refuses new calls.
    pub(crate) fn close(&self) {
        let (waiting, ready) = {
            let mut queues = self.queues.lock();
            queues.closed = true;
            (
                std::mem::take(&mut queues.waiting),
                std::mem::take(&mut queues.ready),
            )
        };
        drop(ready);
        for (_, completer) in waiting {
            completer.complete(false);
        }
    }

    /// Inbound calls not yet picked up.
    pub(crate) fn backlog(&self) -> usize {
        self.queues.lock().ready.len()
    }
}

/// Accepts connections until `shutdown` fires.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    acceptor: Arc<Acceptor>,
    max_frame_length: usize,
    shutdown: CancellationToken,
) {
    loop {
        let (tcp, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            },
        };
        let _ = tcp.set_nodelay(true);
        let tls = tls.clone();
        let acceptor = acceptor.clone();
        let connection = shutdown.child_token();
        tokio::spawn(async move {
            let io: BoxIo = match tls {
                Some(tls) => match tls.accept(tcp).await {
                    Ok(stream) => Box::new(stream),
                    Err(e) => {
                        warn!(%peer, "TLS handshake failed: {}", e);
                        return;
                    }
                },
                None => Box::new(tcp),
            };
            info!(%peer, "ConnectionAccepted");
            serve_connection(io, peer, acceptor, max_frame_length, connection).await;
        });
    }
    debug!("Listener closed");
}

struct PendingCall {
    method: String,
    metadata: Metadata,
    deadline: Option<SystemTime>,
    trace_context: trace::Context,
    payload: Option<Bytes>,
}

/// How often a connection looks for started calls whose deadline passed before the client
/// half-closed them.
const PENDING_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Drops started calls whose deadline passed before their request completed.
fn evict_expired(pending: &mut FnvHashMap<u64, PendingCall>) {
    pending.retain(|&call_id, call| {
        let expired = call
            .deadline
            .map_or(false, |deadline| deadline.time_until() == Duration::ZERO);
        if expired {
            debug!(call_id, method = %call.method, "EvictExpiredCall");
        }
        !expired
    });
}

async fn serve_connection(
    io: BoxIo,
    peer: SocketAddr,
    acceptor: Arc<Acceptor>,
    max_frame_length: usize,
    connection: CancellationToken,
) {
    let transport: ServerTransport = wire::bincode(io, max_frame_length);
    let (sink, mut stream) = transport.split::<ServerFrame>();
    let (outbound, rx) = mpsc::unbounded_channel();
    tokio::spawn(wire::write_loop(sink, rx, connection.clone()));

    let live: Arc<Mutex<FnvHashMap<u64, Arc<AtomicBool>>>> = Default::default();
    let mut pending: FnvHashMap<u64, PendingCall> = FnvHashMap::default();
    let mut sweep = tokio::time::interval(PENDING_SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        let frame = tokio::select! {
            _ = connection.cancelled() => break,
            _ = sweep.tick() => {
                evict_expired(&mut pending);
                continue;
            }
            frame = stream.next() => match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!(%peer, "Connection failed: {}", e);
                    break;
                }
                None => break,
            },
        };
        match frame {
            ClientFrame::Start {
                call_id,
                method,
                metadata,
                deadline,
                trace_context,
            } => {
                trace!(call_id, %method, "ReceiveStart");
                pending.insert(
                    call_id,
                    PendingCall {
                        method,
                        metadata,
                        deadline,
                        trace_context,
                        payload: None,
                    },
                );
            }
            ClientFrame::Message { call_id, payload } => {
                if let Some(call) = pending.get_mut(&call_id) {
                    call.payload.get_or_insert(payload);
                }
            }
            ClientFrame::HalfClose { call_id } => {
                let call = match pending.remove(&call_id) {
                    Some(call) => call,
                    None => continue,
                };
                let cancelled = Arc::new(AtomicBool::new(false));
                live.lock().insert(call_id, cancelled.clone());
                acceptor.push(InboundCall {
                    method: call.method,
                    metadata: call.metadata,
                    deadline: call.deadline,
                    trace_context: call.trace_context,
                    payload: call.payload.unwrap_or_default(),
                    responder: Responder {
                        call_id,
                        outbound: outbound.clone(),
                        cancelled,
                        live: live.clone(),
                        connection: connection.clone(),
                    },
                });
            }
            ClientFrame::Cancel { call_id } => {
                trace!(call_id, "ReceiveCancel");
                pending.remove(&call_id);
                if let Some(cancelled) = live.lock().remove(&call_id) {
                    cancelled.store(true, Ordering::Release);
                }
            }
            ClientFrame::Ping { nonce } => {
                let _ = outbound.send(Outbound::frame(ServerFrame::Pong { nonce }));
            }
        }
    }
    connection.cancel();
    info!(%peer, "ConnectionClosed");
}

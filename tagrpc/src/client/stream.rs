// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use crate::status::CallResult;
use bytes::Bytes;
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::Notify;

/// One entry of a duplex call's outbound queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamPacket {
    /// The encoded request. Empty for the terminal packet.
    pub payload: Bytes,
    /// Marks the end of the outbound stream.
    pub is_terminal: bool,
}

/// The lifecycle of a duplex call, as reported to [`StreamObserver::on_state`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// The call is being opened.
    Connecting,
    /// The call is open.
    Ready,
    /// A request was handed to the transport.
    Writing,
    /// A response arrived.
    Reading,
    /// The call is over. Always the last state, reported right after the result.
    Closed,
}

/// Receives the notifications of a duplex call, through the channel's
/// [`ResultDispatcher`](crate::dispatch::ResultDispatcher).
pub trait StreamObserver<Resp>: Send + 'static {
    /// A response message arrived.
    fn on_message(&mut self, message: Resp);

    /// The call changed state.
    fn on_state(&mut self, state: StreamState) {
        let _ = state;
    }

    /// The call ended. Called exactly once per call.
    fn on_result(&mut self, result: CallResult);
}

struct Outbox {
    closed: bool,
}

/// The application's handle on a duplex call: an outbound packet queue and a cancellation flag,
/// safe to use from any thread.
///
/// Packets are consumed by the call's write loop on the completion worker. Enqueuing a packet
/// wakes the write loop if it is waiting for data.
#[derive(Clone)]
pub struct StreamContext {
    outbox: Arc<Mutex<Outbox>>,
    tx: flume::Sender<StreamPacket>,
    rx: flume::Receiver<StreamPacket>,
    cancelled: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl Default for StreamContext {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamContext {
    /// Creates an open stream with an empty queue.
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            outbox: Arc::new(Mutex::new(Outbox { closed: false })),
            tx,
            rx,
            cancelled: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Queues a request. Returns false if the stream was already completed or cancelled.
    pub fn write(&self, payload: impl Into<Bytes>) -> bool {
        self.push(StreamPacket {
            payload: payload.into(),
            is_terminal: false,
        })
    }

    /// Queues the terminal packet: the call half-closes once every earlier packet was written.
    /// Returns false if the stream was already completed or cancelled.
    pub fn complete(&self) -> bool {
        self.push(StreamPacket {
            payload: Bytes::new(),
            is_terminal: true,
        })
    }

    /// Asks the call to terminate. Takes effect the next time the write loop runs, which this
    /// call triggers.
    pub fn cancel(&self) {
        self.outbox.lock().closed = true;
        self.cancelled.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Returns true once [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// The number of queued packets.
    pub fn queued(&self) -> usize {
        self.rx.len()
    }

    fn push(&self, packet: StreamPacket) -> bool {
        {
            let mut outbox = self.outbox.lock();
            if outbox.closed || self.is_cancelled() {
                return false;
            }
            outbox.closed = packet.is_terminal;
            // The receiver lives in self.
            let _ = self.tx.send(packet);
        }
        self.wake.notify_one();
        true
    }

    pub(crate) fn dequeue(&self) -> Option<StreamPacket> {
        self.rx.try_recv().ok()
    }

    /// Prods the write loop.
    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }
}

impl fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamContext")
            .field("queued", &self.queued())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The full-duplex streaming call.
//!
//! A duplex call is three cooperating operations on the channel's completion queue. The start
//! operation opens the call and then primes a read operation and a write operation, which run
//! independently from then on. Each half re-registers itself after every completion until it
//! finishes. The call ends when both halves have finished, whichever finishes first and for
//! whatever reason, and that is the only point at which its result is delivered.

use crate::{
    client::{
        connection::ClientCall,
        stream::{StreamContext, StreamObserver, StreamState},
        unary::QUEUE_FAILURE,
        Shared,
    },
    completion::{self, CompletionQueue, Operation, Slot},
    context::Context,
    dispatch,
    message::Message,
    status::{CallResult, Code, Metadata, Status},
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::{marker::PhantomData, sync::Arc};
use tracing::{debug, trace, warn, Span};

type SharedObserver<Resp> = Arc<Mutex<Box<dyn StreamObserver<Resp>>>>;

struct Progress {
    read_finished: bool,
    write_finished: bool,
    delivered: bool,
    outcome: Option<CallResult>,
    state: Option<StreamState>,
}

/// State shared by the three operations of one call.
struct Duplex<Req, Resp> {
    method: String,
    shared: Arc<Shared>,
    stream: StreamContext,
    observer: SharedObserver<Resp>,
    progress: Mutex<Progress>,
    span: Span,
    ghost: PhantomData<fn(Req)>,
}

impl<Req: Message, Resp: Message> Duplex<Req, Resp> {
    fn notify<F>(&self, f: F)
    where
        F: FnOnce(&mut dyn StreamObserver<Resp>) + Send + 'static,
    {
        let observer = self.observer.clone();
        self.shared
            .dispatcher
            .dispatch(dispatch::isolated(move || f(&mut **observer.lock())));
    }

    /// Reports `state` if it differs from the last state reported.
    fn set_state(&self, state: StreamState) {
        {
            let mut progress = self.progress.lock();
            if progress.delivered || progress.state == Some(state) {
                return;
            }
            progress.state = Some(state);
        }
        self.notify(move |observer| observer.on_state(state));
    }

    fn deliver(&self, payload: Bytes) {
        if self.stream.is_cancelled() {
            trace!("Dropping response of cancelled call");
            return;
        }
        match Resp::decode(&payload) {
            Ok(message) => {
                self.set_state(StreamState::Reading);
                self.notify(move |observer| observer.on_message(message));
            }
            Err(e) => warn!("Skipping undecodable response: {}", e),
        }
    }

    fn read_done(&self, result: CallResult) {
        {
            let mut progress = self.progress.lock();
            progress.read_finished = true;
            progress.outcome.get_or_insert(result);
        }
        // A write loop waiting for data would otherwise only notice at its next alarm.
        self.stream.wake();
        self.try_conclude();
    }

    fn write_done(&self) {
        self.progress.lock().write_finished = true;
        self.try_conclude();
    }

    /// Ends a call that never opened.
    fn abort(&self, result: CallResult) {
        {
            let mut progress = self.progress.lock();
            progress.read_finished = true;
            progress.write_finished = true;
            progress.outcome.get_or_insert(result);
        }
        self.try_conclude();
    }

    fn try_conclude(&self) {
        let result = {
            let mut progress = self.progress.lock();
            if !(progress.read_finished && progress.write_finished) || progress.delivered {
                return;
            }
            progress.delivered = true;
            progress.outcome.take().unwrap_or_else(|| {
                CallResult::from_code(Code::Unavailable, QUEUE_FAILURE)
            })
        };
        debug!(code = %result.status_code, "CallClosed");
        for interceptor in self.shared.interceptors.iter() {
            interceptor.intercept_response(&self.method, &result);
        }
        self.notify(move |observer| {
            observer.on_result(result);
            observer.on_state(StreamState::Closed);
        });
    }
}

/// Starts a duplex call: reports `Connecting`, then opens the call off the polling thread.
pub(crate) fn start<Req, Resp>(
    shared: Arc<Shared>,
    queue: &CompletionQueue,
    method: String,
    ctx: Context,
    stream: StreamContext,
    observer: Box<dyn StreamObserver<Resp>>,
    span: Span,
) where
    Req: Message,
    Resp: Message,
{
    let duplex = Arc::new(Duplex::<Req, Resp> {
        method: method.clone(),
        shared: shared.clone(),
        stream,
        observer: Arc::new(Mutex::new(observer)),
        progress: Mutex::new(Progress {
            read_finished: false,
            write_finished: false,
            delivered: false,
            outcome: None,
            state: None,
        }),
        span,
        ghost: PhantomData,
    });
    duplex.set_state(StreamState::Connecting);

    let opened = Slot::new();
    let completer = queue.register(Box::new(StartOp {
        duplex,
        opened: opened.clone(),
    }));
    let connector = shared.connector.clone();
    shared.handle.spawn(async move {
        let call = connector.open(&method, &ctx).await;
        let ok = call.is_ok();
        opened.put(call);
        completer.complete(ok);
    });
}

struct StartOp<Req, Resp> {
    duplex: Arc<Duplex<Req, Resp>>,
    opened: Slot<Result<ClientCall, Status>>,
}

impl<Req: Message, Resp: Message> Operation for StartOp<Req, Resp> {
    fn on_event(self: Box<Self>, ok: bool, queue: &CompletionQueue) {
        let StartOp { duplex, opened } = *self;
        let span = duplex.span.clone();
        let _entered = span.enter();
        match opened.take() {
            Some(Ok(call)) if ok => {
                trace!("CallStarted");
                duplex.set_state(StreamState::Ready);
                let call = Arc::new(call);
                // Both halves start synchronously; the first read only seeds the pipeline.
                Box::new(ReadOp {
                    duplex: duplex.clone(),
                    call: call.clone(),
                    phase: ReadPhase::Reading,
                    inbox: Slot::new(),
                    finished: Slot::new(),
                })
                .on_event(true, queue);
                Box::new(WriteOp {
                    duplex,
                    call,
                    phase: WritePhase::Writing,
                })
                .on_event(true, queue);
            }
            Some(Err(status)) => {
                debug!(%status, "CallFailedToStart");
                duplex.abort(CallResult::new(status, Metadata::default()));
            }
            _ => duplex.abort(CallResult::from_code(Code::Unavailable, QUEUE_FAILURE)),
        }
    }
}

enum ReadPhase {
    Reading,
    Finishing,
}

struct ReadOp<Req, Resp> {
    duplex: Arc<Duplex<Req, Resp>>,
    call: Arc<ClientCall>,
    phase: ReadPhase,
    inbox: Slot<Bytes>,
    finished: Slot<(Status, Metadata)>,
}

impl<Req: Message, Resp: Message> ReadOp<Req, Resp> {
    fn read_next(self: Box<Self>, queue: &CompletionQueue) {
        let call = self.call.clone();
        let inbox = self.inbox.clone();
        let handle = self.duplex.shared.handle.clone();
        let completer = queue.register(self);
        handle.spawn(async move {
            match call.read().await {
                Some(payload) => {
                    inbox.put(payload);
                    completer.complete(true);
                }
                None => completer.complete(false),
            }
        });
    }

    fn finish(mut self: Box<Self>, queue: &CompletionQueue) {
        self.phase = ReadPhase::Finishing;
        let call = self.call.clone();
        let finished = self.finished.clone();
        let handle = self.duplex.shared.handle.clone();
        let completer = queue.register(self);
        handle.spawn(async move {
            finished.put(call.finish().await);
            completer.complete(true);
        });
    }
}

impl<Req: Message, Resp: Message> Operation for ReadOp<Req, Resp> {
    fn on_event(self: Box<Self>, ok: bool, queue: &CompletionQueue) {
        let span = self.duplex.span.clone();
        let _entered = span.enter();
        match self.phase {
            ReadPhase::Reading if ok => {
                if let Some(payload) = self.inbox.take() {
                    self.duplex.deliver(payload);
                }
                self.read_next(queue);
            }
            ReadPhase::Reading => self.finish(queue),
            ReadPhase::Finishing => {
                let (status, trailers) = self.finished.take().unwrap_or_else(|| {
                    (
                        Status::new(Code::Unavailable, QUEUE_FAILURE),
                        Metadata::default(),
                    )
                });
                trace!(code = %status.code, "ReadFinished");
                self.duplex.read_done(CallResult::new(status, trailers));
            }
        }
    }
}

enum WritePhase {
    Writing,
    Closing,
}

struct WriteOp<Req, Resp> {
    duplex: Arc<Duplex<Req, Resp>>,
    call: Arc<ClientCall>,
    phase: WritePhase,
}

impl<Req: Message, Resp: Message> Operation for WriteOp<Req, Resp> {
    fn on_event(mut self: Box<Self>, ok: bool, queue: &CompletionQueue) {
        let span = self.duplex.span.clone();
        let _entered = span.enter();
        if !ok || matches!(self.phase, WritePhase::Closing) {
            trace!(ok, "WriteFinished");
            self.duplex.write_done();
            return;
        }
        if self.duplex.stream.is_cancelled() {
            self.call.cancel();
            self.duplex.write_done();
            return;
        }
        if self.call.is_terminated() {
            trace!("Call ended with writes pending");
            self.duplex.write_done();
            return;
        }
        loop {
            let packet = match self.duplex.stream.dequeue() {
                Some(packet) => packet,
                None => {
                    let shared = &self.duplex.shared;
                    let handle = shared.handle.clone();
                    let delay = shared.write_retry_interval;
                    let wake = self.duplex.stream.waker();
                    completion::alarm(&handle, delay, wake, queue.register(self));
                    return;
                }
            };
            if packet.is_terminal {
                self.phase = WritePhase::Closing;
                let call = self.call.clone();
                call.writes_done(queue.register(self));
                return;
            }
            match Req::decode(&packet.payload) {
                Ok(request) => {
                    self.duplex.set_state(StreamState::Writing);
                    let call = self.call.clone();
                    call.write(request.encode(), queue.register(self));
                    return;
                }
                Err(e) => warn!("Skipping malformed packet: {}", e),
            }
        }
    }
}

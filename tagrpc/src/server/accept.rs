// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The server's accept, dispatch, respond cycle.

use crate::{
    completion::{CompletionQueue, Operation, Slot},
    server::{
        incoming::{Acceptor, InboundCall, Responder},
        registry::{Dispatcher, Handler},
    },
    status::{Code, Metadata, Status},
    util::{display_deadline, TimeUntil},
};
use bytes::Bytes;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};
use tokio::runtime::Handle;
use tracing::{debug, info, info_span, trace, warn, Span};

/// What every accept job of one server needs.
pub(crate) struct ServerShared {
    pub(crate) acceptor: Arc<Acceptor>,
    /// Jobs currently waiting for an inbound call.
    pub(crate) outstanding: AtomicUsize,
    pub(crate) handle: Handle,
}

type Outcome = (Status, Option<Bytes>);

enum Phase {
    Requesting(Slot<InboundCall>),
    Dispatching {
        outcome: Slot<Outcome>,
        responder: Responder,
    },
    Responding,
}

/// Serves one inbound call. A job that receives a call first starts its replacement, so the
/// server always has a request for the next call outstanding.
pub(crate) struct AcceptJob {
    shared: Arc<ServerShared>,
    dispatcher: Arc<dyn Dispatcher>,
    phase: Phase,
    span: Span,
}

impl AcceptJob {
    /// Registers a new job on `queue` and asks the acceptor for a call on its behalf.
    pub(crate) fn spawn(
        shared: Arc<ServerShared>,
        dispatcher: Arc<dyn Dispatcher>,
        queue: &CompletionQueue,
    ) {
        let slot = Slot::new();
        let acceptor = shared.acceptor.clone();
        shared.outstanding.fetch_add(1, Ordering::AcqRel);
        let completer = queue.register(Box::new(AcceptJob {
            shared,
            dispatcher,
            phase: Phase::Requesting(slot.clone()),
            span: Span::none(),
        }));
        acceptor.request(slot, completer);
    }

    fn dispatch(mut self: Box<Self>, call: InboundCall, queue: &CompletionQueue) {
        let InboundCall {
            method,
            metadata,
            deadline,
            trace_context,
            payload,
            responder,
        } = call;
        // The server's span continues the client's trace as a child of the client's span.
        let trace_context = trace_context.new_child();
        self.span = info_span!(
            "RPC",
            rpc.trace_id = %trace_context.trace_id,
            rpc.span_id = %trace_context.span_id,
            rpc.parent_span_id = ?trace_context.parent_id,
            rpc.deadline = %display_deadline(deadline),
            otel.kind = "server",
            otel.name = %method,
        );
        let span = self.span.clone();
        let _entered = span.enter();
        info!(metadata = metadata.len(), "ReceiveRequest");

        let outcome = Slot::new();
        let handler = self.dispatcher.resolve(&method);
        self.phase = Phase::Dispatching {
            outcome: outcome.clone(),
            responder,
        };
        let handle = self.shared.handle.clone();
        let completer = queue.register(self);

        let handler = match handler {
            Some(handler) => handler,
            None => {
                debug!("MethodNotFound");
                outcome.put((Status::new(Code::Unimplemented, "method not found"), None));
                completer.complete(true);
                return;
            }
        };
        if deadline.map_or(false, |deadline| deadline.time_until() == Duration::ZERO) {
            debug!("DeadlineAlreadyPassed");
            outcome.put((Status::new(Code::DeadlineExceeded, "deadline exceeded"), None));
            completer.complete(true);
            return;
        }
        let span = span.clone();
        handle.spawn(async move {
            let ran = tokio::task::spawn_blocking(move || {
                run_handler(&*handler, &method, payload, deadline, &span)
            })
            .await;
            let result = ran.unwrap_or_else(|e| {
                let status = Status::new(Code::Internal, format!("handler did not complete: {e}"));
                (status, None)
            });
            outcome.put(result);
            completer.complete(true);
        });
    }
}

fn run_handler(
    handler: &dyn Handler,
    method: &str,
    request: Bytes,
    deadline: Option<SystemTime>,
    span: &Span,
) -> Outcome {
    let _entered = span.enter();
    match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(method, request))) {
        Ok(_) if deadline.map_or(false, |deadline| deadline.time_until() == Duration::ZERO) => {
            (Status::new(Code::DeadlineExceeded, "deadline exceeded"), None)
        }
        Ok(Ok(response)) => (Status::ok(), Some(response)),
        Ok(Err(e)) => {
            debug!("HandlerFailed: {}", e);
            (Status::new(Code::Aborted, e.message), None)
        }
        Err(_) => {
            warn!("Handler panicked");
            (Status::new(Code::Internal, "handler panicked"), None)
        }
    }
}

impl Operation for AcceptJob {
    fn on_event(mut self: Box<Self>, ok: bool, queue: &CompletionQueue) {
        let span = self.span.clone();
        let _entered = span.enter();
        match std::mem::replace(&mut self.phase, Phase::Responding) {
            Phase::Requesting(slot) => {
                if !ok {
                    self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
                    trace!("AcceptAbandoned");
                    return;
                }
                // The replacement is counted before this job stops counting.
                AcceptJob::spawn(self.shared.clone(), self.dispatcher.clone(), queue);
                self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
                match slot.take() {
                    Some(call) => {
                        trace!(method = %call.method, "AcceptCall");
                        self.dispatch(call, queue);
                    }
                    None => debug!("Accepted without a call"),
                }
            }
            Phase::Dispatching { outcome, responder } => {
                if !ok {
                    return;
                }
                let (status, payload) = outcome.take().unwrap_or_else(|| {
                    (Status::new(Code::Internal, "handler produced no outcome"), None)
                });
                trace!(code = %status.code, "SendResponse");
                let completer = queue.register(self);
                responder.respond(status, payload, Metadata::default(), completer);
            }
            Phase::Responding => trace!(ok, "CallFinished"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServiceError;

    fn respond(method: &str, request: Bytes) -> Result<Bytes, ServiceError> {
        match method {
            "ok" => Ok(request),
            "fail" => Err(ServiceError::new("X")),
            _ => panic!("boom"),
        }
    }

    fn outcome(method: &str, deadline: Option<SystemTime>) -> Outcome {
        run_handler(&respond, method, Bytes::from_static(b"hi"), deadline, &Span::none())
    }

    #[test]
    fn handler_outcomes_map_to_statuses() {
        assert_eq!(outcome("ok", None), (Status::ok(), Some(Bytes::from_static(b"hi"))));
        assert_eq!(outcome("fail", None), (Status::new(Code::Aborted, "X"), None));
        assert_eq!(outcome("panic", None).0.code, Code::Internal);
    }

    #[test]
    fn late_responses_are_deadline_exceeded() {
        let past = SystemTime::now() - Duration::from_secs(1);
        assert_eq!(outcome("ok", Some(past)).0.code, Code::DeadlineExceeded);
        let future = SystemTime::now() + Duration::from_secs(60);
        assert_eq!(outcome("ok", Some(future)).0.code, Code::Ok);
    }
}

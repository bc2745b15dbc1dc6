// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use crate::{
    client::Shared,
    completion::{CompletionQueue, Completer, Operation, Slot},
    dispatch,
    message::Message,
    status::{CallResult, Code, Metadata, Status},
};
use bytes::Bytes;
use std::{marker::PhantomData, sync::Arc};
use tracing::{trace, warn, Span};

pub(crate) const QUEUE_FAILURE: &str = "completion queue shut down or operation failed";

/// What the transport hands back for a unary call.
#[derive(Debug)]
pub(crate) struct UnaryReply {
    pub(crate) status: Status,
    pub(crate) trailers: Metadata,
    pub(crate) payload: Option<Bytes>,
}

impl UnaryReply {
    pub(crate) fn failed(status: Status) -> Self {
        Self {
            status,
            trailers: Metadata::default(),
            payload: None,
        }
    }
}

type OnResponse<Resp> = Box<dyn FnOnce(CallResult, Option<Resp>) + Send>;

/// A single request, single response call: one registration, one completion, one delivery.
pub(crate) struct UnaryCall<Resp> {
    method: String,
    shared: Arc<Shared>,
    reply: Slot<UnaryReply>,
    on_response: OnResponse<Resp>,
    span: Span,
    ghost: PhantomData<fn() -> Resp>,
}

impl<Resp: Message> UnaryCall<Resp> {
    pub(crate) fn new(
        method: String,
        shared: Arc<Shared>,
        on_response: OnResponse<Resp>,
        span: Span,
    ) -> Self {
        Self {
            method,
            shared,
            reply: Slot::new(),
            on_response,
            span,
            ghost: PhantomData,
        }
    }

    /// Registers the call and hands its reply slot and completer to `setup`, which issues the
    /// request and arranges for exactly one completion.
    pub(crate) fn start<F>(self, queue: &CompletionQueue, setup: F)
    where
        F: FnOnce(Slot<UnaryReply>, Completer),
    {
        let reply = self.reply.clone();
        let completer = queue.register(Box::new(self));
        setup(reply, completer);
    }
}

impl<Resp: Message> Operation for UnaryCall<Resp> {
    fn on_event(self: Box<Self>, ok: bool, _: &CompletionQueue) {
        let UnaryCall {
            method,
            shared,
            reply,
            on_response,
            span,
            ..
        } = *self;
        let _entered = span.enter();

        let (result, response) = match reply.take() {
            Some(reply) if ok => settle::<Resp>(reply),
            _ => (CallResult::from_code(Code::Unavailable, QUEUE_FAILURE), None),
        };
        trace!(code = %result.status_code, "ReceiveResponse");
        for interceptor in shared.interceptors.iter() {
            interceptor.intercept_response(&method, &result);
        }
        shared
            .dispatcher
            .dispatch(dispatch::isolated(move || on_response(result, response)));
    }
}

fn settle<Resp: Message>(reply: UnaryReply) -> (CallResult, Option<Resp>) {
    let UnaryReply {
        status,
        trailers,
        payload,
    } = reply;
    if status.code != Code::Ok {
        return (CallResult::new(status, trailers), None);
    }
    let payload = match payload {
        Some(payload) => payload,
        None => {
            return (
                CallResult::new(
                    Status::new(Code::Internal, "server sent no response message"),
                    trailers,
                ),
                None,
            )
        }
    };
    match Resp::decode(&payload) {
        Ok(response) => (CallResult::new(status, trailers), Some(response)),
        Err(e) => {
            warn!("Undecodable response: {}", e);
            (
                CallResult::new(Status::new(Code::Internal, e.to_string()), trailers),
                None,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn non_ok_status_carries_no_response() {
        let (result, response) = settle::<String>(UnaryReply {
            status: Status::new(Code::Aborted, "X"),
            trailers: Metadata::default(),
            payload: Some(Bytes::from_static(b"ignored")),
        });
        assert_eq!(result.status_code, Code::Aborted);
        assert_eq!(result.status_message, "X");
        assert!(!result.succeeded);
        assert_matches!(response, None);
    }

    #[test]
    fn ok_without_message_is_internal() {
        let (result, _) = settle::<String>(UnaryReply::failed(Status::ok()));
        assert_eq!(result.status_code, Code::Internal);
    }

    #[test]
    fn undecodable_response_is_internal() {
        let (result, response) = settle::<String>(UnaryReply {
            status: Status::ok(),
            trailers: [("k", "v")].into_iter().collect(),
            payload: Some(Bytes::from_static(&[0xff])),
        });
        assert_eq!(result.status_code, Code::Internal);
        assert_eq!(result.trailing_metadata.get("k"), Some("v"));
        assert_matches!(response, None);
    }
}

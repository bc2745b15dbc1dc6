// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Provides a call context that carries a deadline, request metadata, and trace context. The
//! context is sent from client to server in the call header.

use crate::{
    status::Metadata,
    trace::{self, TraceId},
};
use static_assertions::assert_impl_all;
use std::time::{Duration, SystemTime};

/// Call-scoped settings fixed when the call is issued.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Context {
    /// When the client expects the call to be complete by. `None` means no deadline.
    ///
    /// The client abandons the call with `DEADLINE_EXCEEDED` once the deadline passes, and the
    /// server does not start handlers for calls whose deadline already passed.
    pub deadline: Option<SystemTime>,
    /// Headers sent with the call.
    pub metadata: Metadata,
    /// Identifies the call in traces on both sides of the connection.
    pub trace_context: trace::Context,
}

assert_impl_all!(Context: Send, Sync);

impl Default for Context {
    fn default() -> Self {
        Self::new_root()
    }
}

impl Context {
    /// Returns a Context with a new root trace context, no deadline, and no metadata.
    pub fn new_root() -> Self {
        Self {
            deadline: None,
            metadata: Metadata::default(),
            trace_context: trace::Context::new_root(),
        }
    }

    /// Sets the deadline to `timeout` from now. A zero timeout leaves the call without one.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        if timeout.is_zero() {
            return self;
        }
        self.with_deadline(SystemTime::now() + timeout)
    }

    /// Sets an absolute deadline.
    pub fn with_deadline(mut self, deadline: SystemTime) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Appends a request header.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    /// Returns the ID of the call-scoped trace.
    pub fn trace_id(&self) -> &TraceId {
        &self.trace_context.trace_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_means_no_deadline() {
        assert_eq!(Context::new_root().with_timeout(Duration::ZERO).deadline, None);
        assert!(Context::new_root()
            .with_timeout(Duration::from_secs(5))
            .deadline
            .is_some());
    }

    #[test]
    fn metadata_is_appended() {
        let ctx = Context::new_root()
            .with_metadata("a", "1")
            .with_metadata("a", "2");
        assert_eq!(ctx.metadata.len(), 2);
        assert_eq!(ctx.metadata.get("a"), Some("1"));
    }
}

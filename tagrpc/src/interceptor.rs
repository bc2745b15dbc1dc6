// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use crate::status::{CallResult, Metadata};

/// Observes and decorates client calls.
///
/// Request hooks run on the issuing thread before the call starts, in registration order.
/// Response hooks run on the completion worker before the terminal result is dispatched.
pub trait Interceptor: Send + Sync + 'static {
    /// May add or rewrite request headers.
    fn intercept_request(&self, method: &str, metadata: &mut Metadata) {
        let _ = (method, metadata);
    }

    /// Sees the terminal result of every call.
    fn intercept_response(&self, method: &str, result: &CallResult) {
        let _ = (method, result);
    }
}

// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Delivery of call results to the application's preferred execution context.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};
use tracing::error;

/// A notification bound for the application.
pub type Callback = Box<dyn FnOnce() + Send>;

/// Wraps an application callback so that a panic in it is logged instead of unwinding into
/// whichever thread runs it. Calls keep advancing when an observer panics.
pub(crate) fn isolated<F>(callback: F) -> Callback
where
    F: FnOnce() + Send + 'static,
{
    Box::new(move || {
        if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
            error!("Application callback panicked");
        }
    })
}

/// Decides where call results are delivered.
///
/// Every data, state, and terminal notification of a call goes through the channel's
/// dispatcher. Notifications of one call are handed over in the order they occur.
pub trait ResultDispatcher: Send + Sync + 'static {
    /// Schedules `callback` to run.
    fn dispatch(&self, callback: Callback);
}

impl<F> ResultDispatcher for F
where
    F: Fn(Callback) + Send + Sync + 'static,
{
    fn dispatch(&self, callback: Callback) {
        self(callback)
    }
}

/// Runs callbacks immediately, on the completion worker's thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct Inline;

impl ResultDispatcher for Inline {
    fn dispatch(&self, callback: Callback) {
        callback()
    }
}

/// Queues callbacks until the application pumps them on a thread of its choosing.
#[derive(Clone)]
pub struct QueueDispatcher {
    tx: flume::Sender<Callback>,
    rx: flume::Receiver<Callback>,
}

impl QueueDispatcher {
    /// Creates an empty dispatcher. Share it through an [`Arc`] to both install it on a channel
    /// and pump it.
    pub fn new() -> Arc<Self> {
        let (tx, rx) = flume::unbounded();
        Arc::new(Self { tx, rx })
    }

    /// Runs every queued callback and returns how many ran.
    pub fn run_pending(&self) -> usize {
        self.rx.try_iter().map(|callback| callback()).count()
    }

    /// Waits up to `timeout` for a callback and runs it. Returns false on timeout.
    pub fn run_one(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(callback) => {
                callback();
                true
            }
            Err(_) => false,
        }
    }

    /// The number of callbacks waiting to run.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns true if no callbacks are waiting.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl ResultDispatcher for QueueDispatcher {
    fn dispatch(&self, callback: Callback) {
        // Both ends live in self, so the channel cannot be disconnected.
        let _ = self.tx.send(callback);
    }
}

impl fmt::Debug for QueueDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueDispatcher")
            .field("queued", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn queue_dispatcher_defers_until_pumped() {
        let dispatcher = QueueDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            dispatcher.dispatch(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.len(), 3);
        assert_eq!(dispatcher.run_pending(), 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(!dispatcher.run_one(Duration::from_millis(1)));
    }

    #[test]
    fn isolated_callbacks_do_not_unwind() {
        let ran = Arc::new(AtomicUsize::new(0));
        Inline.dispatch(isolated(|| panic!("observer failed")));
        let r = ran.clone();
        Inline.dispatch(isolated(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closures_are_dispatchers() {
        let ran = Arc::new(AtomicUsize::new(0));
        let dispatcher: Arc<dyn ResultDispatcher> = Arc::new(|callback: Callback| callback());
        let r = ran.clone();
        dispatcher.dispatch(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}

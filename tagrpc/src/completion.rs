// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The completion queue: the one blocking point of the engine.
//!
//! Asynchronous work is represented by an [`Operation`] registered with a [`CompletionQueue`].
//! Registration moves the operation into the queue, which hands back a [`Completer`] carrying
//! the operation's [`Tag`]. Whoever performs the work posts `(tag, ok)` through the completer;
//! the queue's polling thread then takes the operation back out and calls
//! [`Operation::on_event`], which consumes it. An operation that wants another event
//! re-registers itself, otherwise it is dropped when `on_event` returns.
//!
//! After [`CompletionQueue::shutdown`], events already posted are still delivered as posted,
//! every operation still registered is delivered with `ok = false`, and only then does
//! [`CompletionQueue::next`] report [`Next::Shutdown`].

use fnv::FnvHashMap;
use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{runtime::Handle, sync::Notify};
use tracing::trace;

/// Identifies one registration of an operation with a completion queue. Tags are never reused
/// by the queue that issued them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u64);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A unit of asynchronous work driven by completion events.
pub trait Operation: Send + 'static {
    /// Advances the operation after the work it was registered for finished. `ok` is false
    /// when the work failed or the queue is shutting down.
    fn on_event(self: Box<Self>, ok: bool, queue: &CompletionQueue);
}

/// A completed registration taken out of the queue.
pub struct Event {
    /// The tag the operation was registered under.
    pub tag: Tag,
    /// Whether the underlying work succeeded.
    pub ok: bool,
    op: Box<dyn Operation>,
}

impl Event {
    /// Hands the event to its operation.
    pub fn dispatch(self, queue: &CompletionQueue) {
        self.op.on_event(self.ok, queue)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("tag", &self.tag)
            .field("ok", &self.ok)
            .finish_non_exhaustive()
    }
}

/// The result of [`CompletionQueue::next`].
#[derive(Debug)]
pub enum Next {
    /// An operation is ready to advance.
    Event(Event),
    /// The queue was shut down and every registration has been delivered.
    Shutdown,
}

#[derive(Default)]
struct State {
    next_tag: u64,
    registered: FnvHashMap<u64, Box<dyn Operation>>,
    completed: VecDeque<(u64, bool)>,
    shutdown: bool,
    drained: bool,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    ready: Condvar,
}

/// A multi-producer queue of completion events, consumed by a single polling thread.
#[derive(Clone, Default)]
pub struct CompletionQueue {
    inner: Arc<Inner>,
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CompletionQueue")
            .field("registered", &state.registered.len())
            .field("completed", &state.completed.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

impl CompletionQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves `op` into the queue and returns the completer for its tag.
    ///
    /// Registering on a queue that is shutting down immediately posts a failed completion.
    /// Registering after the queue has fully drained calls `op.on_event(false, ..)` before
    /// returning, since no polling thread remains to deliver it.
    pub fn register(&self, op: Box<dyn Operation>) -> Completer {
        let mut state = self.inner.state.lock();
        let tag = state.next_tag;
        state.next_tag += 1;
        let completer = Completer {
            queue: Arc::downgrade(&self.inner),
            tag: Tag(tag),
            posted: false,
        };
        if state.drained {
            drop(state);
            trace!(tag = %Tag(tag), "RegisterAfterShutdown");
            op.on_event(false, self);
            return completer.disarm();
        }
        state.registered.insert(tag, op);
        if state.shutdown {
            state.completed.push_back((tag, false));
            drop(state);
            self.inner.ready.notify_one();
            return completer.disarm();
        }
        completer
    }

    /// Blocks until an event is available or the queue has shut down and drained.
    pub fn next(&self) -> Next {
        let mut state = self.inner.state.lock();
        loop {
            while let Some((tag, ok)) = state.completed.pop_front() {
                if let Some(op) = state.registered.remove(&tag) {
                    return Next::Event(Event { tag: Tag(tag), ok, op });
                }
                trace!(tag = %Tag(tag), "StaleCompletion");
            }
            if state.shutdown {
                let pending = state.registered.keys().next().copied();
                if let Some(tag) = pending {
                    if let Some(op) = state.registered.remove(&tag) {
                        return Next::Event(Event {
                            tag: Tag(tag),
                            ok: false,
                            op,
                        });
                    }
                }
                state.drained = true;
                return Next::Shutdown;
            }
            self.inner.ready.wait(&mut state);
        }
    }

    /// Like [`next`](Self::next), but gives up after `timeout` and returns `None`.
    pub fn next_timeout(&self, timeout: Duration) -> Option<Next> {
        {
            let mut state = self.inner.state.lock();
            if state.completed.is_empty() && !state.shutdown {
                let _ = self.inner.ready.wait_for(&mut state, timeout);
                if state.completed.is_empty() && !state.shutdown {
                    return None;
                }
            }
        }
        Some(self.next())
    }

    /// Shuts the queue down. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        trace!(pending = state.registered.len(), "Shutdown");
        drop(state);
        self.inner.ready.notify_all();
    }

    /// True once [`shutdown`](Self::shutdown) was called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    /// The number of registered operations awaiting an event.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().registered.len()
    }
}

fn post(inner: &Inner, tag: u64, ok: bool) {
    let mut state = inner.state.lock();
    if !state.registered.contains_key(&tag) {
        return;
    }
    // Completions racing with shutdown still resolve, but as failures.
    let ok = ok && !state.shutdown;
    state.completed.push_back((tag, ok));
    drop(state);
    inner.ready.notify_one();
}

/// Posts the completion of one registration.
///
/// A completer that is dropped without [`complete`](Self::complete) being called posts a
/// failed completion, so an operation can never be stranded by work that was abandoned.
#[must_use = "dropping a Completer fails its operation"]
pub struct Completer {
    queue: Weak<Inner>,
    tag: Tag,
    posted: bool,
}

impl Completer {
    /// The tag this completer resolves.
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Posts `(tag, ok)` to the queue.
    pub fn complete(mut self, ok: bool) {
        self.posted = true;
        if let Some(inner) = self.queue.upgrade() {
            post(&inner, self.tag.0, ok);
        }
    }

    fn disarm(mut self) -> Self {
        self.posted = true;
        self
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if !self.posted {
            if let Some(inner) = self.queue.upgrade() {
                post(&inner, self.tag.0, false);
            }
        }
    }
}

impl fmt::Debug for Completer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Completer").field(&self.tag).finish()
    }
}

/// A one-value mailbox through which asynchronous work hands its output to the operation it
/// completes.
pub(crate) struct Slot<T>(Arc<Mutex<Option<T>>>);

impl<T> Slot<T> {
    pub(crate) fn new() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    pub(crate) fn put(&self, value: T) {
        *self.0.lock() = Some(value);
    }

    pub(crate) fn take(&self) -> Option<T> {
        self.0.lock().take()
    }
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Completes `completer` successfully after `delay`, or as soon as `wake` is notified.
pub(crate) fn alarm(handle: &Handle, delay: Duration, wake: Arc<Notify>, completer: Completer) {
    handle.spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wake.notified() => {}
        }
        completer.complete(true);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe {
        events: Arc<Mutex<Vec<(usize, bool)>>>,
        id: usize,
        drops: Arc<AtomicUsize>,
    }

    impl Operation for Probe {
        fn on_event(self: Box<Self>, ok: bool, _: &CompletionQueue) {
            self.events.lock().push((self.id, ok));
        }
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn probes(
        n: usize,
    ) -> (
        Arc<Mutex<Vec<(usize, bool)>>>,
        Arc<AtomicUsize>,
        impl Iterator<Item = Box<Probe>>,
    ) {
        let events = Arc::new(Mutex::new(vec![]));
        let drops = Arc::new(AtomicUsize::new(0));
        let (e, d) = (events.clone(), drops.clone());
        let iter = (0..n).map(move |id| {
            Box::new(Probe {
                events: e.clone(),
                id,
                drops: d.clone(),
            })
        });
        (events, drops, iter)
    }

    fn drain(queue: &CompletionQueue) {
        while let Next::Event(event) = queue.next() {
            event.dispatch(queue);
        }
    }

    #[test]
    fn completions_are_delivered_in_posting_order() {
        let queue = CompletionQueue::new();
        let (events, _, mut ops) = probes(3);
        let a = queue.register(ops.next().unwrap());
        let b = queue.register(ops.next().unwrap());
        let c = queue.register(ops.next().unwrap());
        c.complete(true);
        a.complete(false);
        b.complete(true);
        queue.shutdown();
        drain(&queue);
        assert_eq!(*events.lock(), vec![(2, true), (0, false), (1, true)]);
    }

    #[test]
    fn shutdown_fails_every_pending_operation_once() {
        let queue = CompletionQueue::new();
        let (events, drops, ops) = probes(5);
        let completers: Vec<_> = ops.map(|op| queue.register(op)).collect();
        queue.shutdown();
        drain(&queue);
        assert_eq!(events.lock().len(), 5);
        assert!(events.lock().iter().all(|(_, ok)| !ok));
        assert_eq!(drops.load(Ordering::SeqCst), 5);

        // Late completions for drained tags are ignored.
        for completer in completers {
            completer.complete(true);
        }
        assert_eq!(events.lock().len(), 5);
        assert_matches!(queue.next(), Next::Shutdown);
    }

    #[test]
    fn dropped_completer_fails_the_operation() {
        let queue = CompletionQueue::new();
        let (events, _, mut ops) = probes(1);
        drop(queue.register(ops.next().unwrap()));
        assert_matches!(queue.next(), Next::Event(Event { ok: false, .. }));
        assert_eq!(queue.pending(), 0);
        assert!(events.lock().is_empty());
    }

    #[test]
    fn register_after_drain_runs_synchronously() {
        let queue = CompletionQueue::new();
        queue.shutdown();
        assert_matches!(queue.next(), Next::Shutdown);
        let (events, drops, mut ops) = probes(1);
        let completer = queue.register(ops.next().unwrap());
        assert_eq!(*events.lock(), vec![(0, false)]);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        completer.complete(true);
        assert_eq!(events.lock().len(), 1);
    }

    #[test]
    fn next_timeout_returns_none_when_idle() {
        let queue = CompletionQueue::new();
        assert!(queue.next_timeout(Duration::from_millis(10)).is_none());
        queue.shutdown();
        assert_matches!(queue.next_timeout(Duration::from_millis(10)), Some(Next::Shutdown));
    }

    #[test]
    fn alarm_fires_early_on_wake() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let queue = CompletionQueue::new();
        let (events, _, mut ops) = probes(1);
        let wake = Arc::new(Notify::new());
        alarm(
            runtime.handle(),
            Duration::from_secs(60),
            wake.clone(),
            queue.register(ops.next().unwrap()),
        );
        wake.notify_one();
        runtime.block_on(async {
            tokio::time::timeout(Duration::from_secs(5), async {
                while queue.inner.state.lock().completed.is_empty() {
                    tokio::task::yield_now().await;
                }
            })
            .await
            .unwrap();
        });
        assert_matches!(queue.next(), Next::Event(Event { ok: true, .. }));
        assert!(events.lock().is_empty());
    }
}

// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use crate::completion::{CompletionQueue, Next};
use parking_lot::Mutex;
use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};
use tracing::{debug, error, trace};

/// Owns a completion queue and the OS thread that polls it.
///
/// The thread takes events off the queue and hands each to its operation until the queue is
/// shut down and drained. Every operation on the queue therefore advances on this one thread.
pub struct CompletionWorker {
    name: String,
    queue: CompletionQueue,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CompletionWorker {
    /// Creates the queue and starts the polling thread.
    pub fn start(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let queue = CompletionQueue::new();
        let running = Arc::new(AtomicBool::new(true));
        let thread = thread::Builder::new().name(name.clone()).spawn({
            let queue = queue.clone();
            let running = running.clone();
            move || run(queue, running)
        })?;
        debug!(worker = %name, "Started");
        Ok(Self {
            name,
            queue,
            running,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// The queue polled by this worker.
    pub fn queue(&self) -> &CompletionQueue {
        &self.queue
    }

    /// The name of the polling thread.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// False once [`stop`](Self::stop) was called.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Marks the worker stopped and shuts its queue down. Pending operations are delivered
    /// failed completions by the polling thread, which then exits.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            debug!(worker = %self.name, "Stopping");
        }
        self.queue.shutdown();
    }

    /// Waits for the polling thread to drain the queue and exit. Returns immediately when
    /// called from the polling thread itself.
    pub fn join(&self) {
        let thread = {
            let mut thread = self.thread.lock();
            match &*thread {
                Some(handle) if handle.thread().id() == thread::current().id() => return,
                _ => thread.take(),
            }
        };
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!(worker = %self.name, "Polling thread panicked");
            }
        }
    }
}

impl Drop for CompletionWorker {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

impl std::fmt::Debug for CompletionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionWorker")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

fn run(queue: CompletionQueue, running: Arc<AtomicBool>) {
    while let Next::Event(event) = queue.next() {
        trace!(tag = %event.tag, ok = event.ok, "Completion");
        if panic::catch_unwind(AssertUnwindSafe(|| event.dispatch(&queue))).is_err() {
            error!("Operation panicked while handling a completion");
        }
    }
    running.store(false, Ordering::Release);
    debug!("Shutdown");
}

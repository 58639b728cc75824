//! The per-sync work queue.
//!
//! Hydration, mutations, and live events all funnel through one queue so
//! batches never interleave. There is no dedicated worker thread: whichever
//! caller finds the queue idle drains it, and callers that arrive while a
//! drain is running leave their job behind for the active drainer.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

type Job = Box<dyn FnOnce() + Send>;

/// A serialized, killable job queue.
#[derive(Default)]
pub struct WorkQueue {
    jobs: Mutex<VecDeque<Job>>,
    serial: Mutex<()>,
    killed: AtomicBool,
}

impl WorkQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True once [`kill`](Self::kill) has run.
    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Discards pending jobs and rejects future ones.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.jobs.lock().clear();
    }

    /// Enqueues a job and drains the queue unless a drain is already
    /// running elsewhere.
    pub fn push(&self, job: impl FnOnce() + Send + 'static) {
        if self.is_killed() {
            return;
        }
        self.jobs.lock().push_back(Box::new(job));
        self.drain();
    }

    /// Runs `f` with the queue's serialization guarantee, then drains
    /// whatever `f` enqueued.
    ///
    /// Jobs pushed from inside `f` (live echoes of `f`'s own remote
    /// writes) run after `f` returns, in order.
    pub fn run_serial<T>(&self, f: impl FnOnce() -> T) -> T {
        let guard = self.serial.lock();
        let out = f();
        self.drain_under(&guard);
        drop(guard);
        // A push may have slipped in between the drain and the unlock.
        self.drain();
        out
    }

    fn drain(&self) {
        loop {
            let Some(guard) = self.serial.try_lock() else {
                return;
            };
            self.drain_under(&guard);
            drop(guard);
            if self.jobs.lock().is_empty() || self.is_killed() {
                return;
            }
        }
    }

    fn drain_under(&self, _guard: &parking_lot::MutexGuard<'_, ()>) {
        loop {
            if self.is_killed() {
                return;
            }
            let job = self.jobs.lock().pop_front();
            match job {
                Some(job) => job(),
                None => return,
            }
        }
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("pending", &self.jobs.lock().len())
            .field("killed", &self.is_killed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn jobs_run_in_order() {
        let queue = WorkQueue::new();
        let seen: Arc<Mutex<Vec<u32>>> = Arc::default();
        for i in 0..5 {
            let sink = Arc::clone(&seen);
            queue.push(move || sink.lock().push(i));
        }
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn jobs_pushed_during_run_serial_wait_for_it() {
        let queue = Arc::new(WorkQueue::new());
        let seen: Arc<Mutex<Vec<&'static str>>> = Arc::default();

        let q = Arc::clone(&queue);
        let sink = Arc::clone(&seen);
        let during = Arc::clone(&seen);
        queue.run_serial(move || {
            q.push(move || during.lock().push("queued"));
            sink.lock().push("inline");
        });

        assert_eq!(*seen.lock(), vec!["inline", "queued"]);
    }

    #[test]
    fn killed_queue_discards_work() {
        let queue = WorkQueue::new();
        let seen: Arc<Mutex<Vec<u32>>> = Arc::default();
        queue.kill();
        let sink = Arc::clone(&seen);
        queue.push(move || sink.lock().push(1));
        assert!(seen.lock().is_empty());
        assert!(queue.is_killed());
    }

    #[test]
    fn cross_thread_serialization() {
        let queue = Arc::new(WorkQueue::new());
        let counter: Arc<Mutex<u64>> = Arc::default();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let counter = Arc::clone(&counter);
                        queue.push(move || *counter.lock() += 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*counter.lock(), 400);
    }
}

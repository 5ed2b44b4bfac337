//! Provided resumption policies.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::{Scheduler, TaskRef};

/// Resumes every continuation immediately, on the stack of whoever completed the event it was waiting on.
pub struct InlineScheduler;

impl Scheduler for InlineScheduler {
    fn queue_for_resume(&self, continuation: TaskRef) {
        continuation.resume();
    }
}

/// Resumes continuations through a local drain queue, breadth-first.
///
/// Resuming a continuation inline can complete a future that resumes another continuation, and so on: a long chain of dependent
/// computations would otherwise resolve as one deep recursion. This policy bounds stack growth by enqueueing instead; the outermost
/// call drains the queue iteratively and any resumption triggered while draining simply appends.
pub struct QueueScheduler {
    queue: spin::Mutex<VecDeque<TaskRef>>,
    draining: AtomicBool
}

impl QueueScheduler {
    pub fn new() -> QueueScheduler {
        QueueScheduler {
            queue: spin::Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false)
        }
    }
}

impl Default for QueueScheduler {
    fn default() -> QueueScheduler {
        QueueScheduler::new()
    }
}

impl Scheduler for QueueScheduler {
    fn queue_for_resume(&self, continuation: TaskRef) {
        self.queue.lock().push_back(continuation);

        if self.draining.swap(true, Ordering::Acquire) {
            // A call further down the stack is already draining and will pick this continuation up.
            return;
        };

        loop {
            loop {
                let next = self.queue.lock().pop_front();
                match next {
                    Some(continuation) => {
                        continuation.resume();
                    },
                    None => {
                        break;
                    }
                };
            }

            self.draining.store(false, Ordering::Release);

            // A continuation enqueued between the last pop and the flag reset would otherwise be stranded until the next call.
            if self.queue.lock().is_empty() || self.draining.swap(true, Ordering::Acquire) {
                return;
            };
        }
    }
}

/// An instrumentation wrapper counting how many resumptions pass through, delegating the actual policy to an inner scheduler.
pub struct CountingScheduler {
    inner: Arc<dyn Scheduler>,
    resumes: AtomicUsize
}

impl CountingScheduler {
    pub fn new(inner: Arc<dyn Scheduler>) -> CountingScheduler {
        CountingScheduler {
            inner,
            resumes: AtomicUsize::new(0)
        }
    }

    /// Gets the number of resumptions routed through this scheduler so far.
    pub fn resume_count(&self) -> usize {
        self.resumes.load(Ordering::Relaxed)
    }
}

impl Scheduler for CountingScheduler {
    fn queue_for_resume(&self, continuation: TaskRef) {
        self.resumes.fetch_add(1, Ordering::Relaxed);
        self.inner.queue_for_resume(continuation);
    }
}

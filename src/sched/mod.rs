//! Pluggable resumption scheduling for suspended continuations.
//!
//! This module decouples *who resumes a suspended computation* from *how it was suspended*. Every continuation captures its
//! [`Scheduler`] once, at creation time, from the explicit handle passed to [`schedule`]; from then on every resumption of that
//! continuation is routed through the captured policy, no matter whether it was waiting on a future, a mutex or anything else speaking
//! the waiter-node protocol. Continuations launched with [`spawn`] carry no scheduler and resume immediately on the resuming thread's
//! stack.

use std::fmt;
use std::sync::Arc;

pub mod policy;

pub(crate) mod task;

use crate::sync::future::Future;
use task::{Continuation, Core};

/// A resumption policy for suspended continuations.
///
/// A scheduler receives every continuation that becomes runnable again and decides how to hand it back to execution: resume it
/// synchronously on the current stack, enqueue it for later draining, or dispatch it elsewhere. The contract is that every continuation
/// passed to [`Scheduler::queue_for_resume`] is eventually resumed, exactly once. No ordering or fairness between continuations is
/// required.
pub trait Scheduler: Send + Sync + 'static {
    /// Accepts a continuation that is ready to make progress.
    fn queue_for_resume(&self, continuation: TaskRef);
}

/// A type-erased handle to a suspended continuation that is ready to be resumed.
///
/// Handed to a [`Scheduler`], which must eventually call [`TaskRef::resume`] on it exactly once.
pub struct TaskRef {
    task: Arc<dyn Continuation>
}

impl TaskRef {
    pub(crate) fn new(task: Arc<dyn Continuation>) -> TaskRef {
        TaskRef { task }
    }

    /// Resumes the continuation on the current thread, driving it until it suspends again or finishes.
    pub fn resume(self) {
        self.task.run();
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskRef").field(&Arc::as_ptr(&self.task)).finish()
    }
}

/// Creates a suspended, not-yet-started continuation from the provided computation and returns its [`Future`] handle.
///
/// The continuation carries no scheduler: whoever completes an event it is waiting on resumes it immediately on their own stack. Use
/// [`schedule`] to bind a resumption policy instead. The computation does not run until the future is started, waited on or awaited.
pub fn spawn<F>(computation: F) -> Future<F::Output>
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static
{
    Future::from_core(Core::new(Box::pin(computation), None))
}

/// Creates a suspended continuation bound to the provided scheduler and returns its [`Future`] handle.
///
/// The scheduler is captured now, at creation time, and intercepts every later resumption of this continuation regardless of which
/// thread triggers it. Nested computations follow creation lineage: a child launched from inside this computation uses whatever
/// scheduler handle it is explicitly given, which is ordinarily the same one.
pub fn schedule<F>(scheduler: Arc<dyn Scheduler>, computation: F) -> Future<F::Output>
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static
{
    Future::from_core(Core::new(Box::pin(computation), Some(scheduler)))
}

/// Wraps a plain callable into a continuation bound to the provided scheduler.
///
/// This is the launch entry point for code that is not itself suspendable: the callable runs to completion during the continuation's
/// first resumption and its return value resolves the future.
pub fn schedule_fn<F, T>(scheduler: Arc<dyn Scheduler>, f: F) -> Future<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static
{
    schedule(scheduler, async move { f() })
}

#[cfg(test)]
mod test {
    use super::policy::InlineScheduler;
    use super::*;

    #[test]
    fn test_schedule_fn() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(InlineScheduler);
        let fut = schedule_fn(scheduler, || 42);

        assert_eq!(42, fut.get().unwrap());
    }

    #[test]
    fn test_schedule_computation() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(InlineScheduler);
        let fut = schedule(scheduler, async { 42 });

        assert_eq!(42, fut.get().unwrap());
    }

    #[test]
    fn test_spawn_not_started_until_waited() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let ran = Arc::new(AtomicBool::new(false));
        let fut = {
            let ran = ran.clone();
            spawn(async move {
                ran.store(true, Ordering::Relaxed);
            })
        };

        assert!(!ran.load(Ordering::Relaxed));
        fut.get().unwrap();
        assert!(ran.load(Ordering::Relaxed));
    }
}

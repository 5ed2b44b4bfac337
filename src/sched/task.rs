//! The heap-resident, reference-counted continuation behind every future.
//!
//! A [`Core`] owns a suspendable computation (a pinned state machine), the slot its result is published into, the list of parties
//! waiting for that result and the scheduler captured when the continuation was created. Handles, registered wakers and in-flight
//! resumptions all share ownership of the core through an atomic reference count; whichever reference is dropped last tears the frame
//! down, so dropping every external handle while the computation is still suspended or running defers destruction until it finishes.

use std::cell::UnsafeCell;
use std::future::Future;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use crate::error::{Error, PanicPayload};
use crate::sched::{Scheduler, TaskRef};
use crate::sync::wait::{SyncSignal, WaitList, WaitNode};

/// Created or suspended; a resume will transition to `QUEUED` and deliver the continuation.
const IDLE: u8 = 0;
/// A resume is in flight towards a scheduler or the current stack.
const QUEUED: u8 = 1;
/// The computation is being polled.
const RUNNING: u8 = 2;
/// A resume arrived while the computation was being polled; the runner polls again instead of suspending.
const NOTIFIED: u8 = 3;
/// The computation finished and published its result.
const DONE: u8 = 4;

enum Slot<T> {
    Empty,
    Value(T),
    Panicked(PanicPayload),
    Taken
}

/// A type-erased resumable continuation. Implemented by [`Core`] for every result type.
pub(crate) trait Continuation: Send + Sync {
    fn run(self: Arc<Self>);
}

/// The shared state of one continuation and its future handles.
pub(crate) struct Core<T> {
    run_state: AtomicU8,
    started: AtomicBool,
    waiters: WaitList,
    result: UnsafeCell<Slot<T>>,
    frame: UnsafeCell<Option<Pin<Box<dyn Future<Output = T> + Send>>>>,
    scheduler: Option<Arc<dyn Scheduler>>
}

// SAFETY: The run-state machine guarantees a single runner at a time, so the frame cell is never accessed concurrently. The result cell
//         is written once by the runner before the waiter list closes and only read or taken after the close is observed; the public
//         handle API restricts taking to the sole owning handle and concurrent borrows to Sync result types.
unsafe impl<T: Send> Send for Core<T> {}
unsafe impl<T: Send> Sync for Core<T> {}

impl<T: Send + 'static> Core<T> {
    pub(crate) fn new(frame: Pin<Box<dyn Future<Output = T> + Send>>, scheduler: Option<Arc<dyn Scheduler>>) -> Arc<Core<T>> {
        Arc::new(Core {
            run_state: AtomicU8::new(IDLE),
            started: AtomicBool::new(false),
            waiters: WaitList::new(),
            result: UnsafeCell::new(Slot::Empty),
            frame: UnsafeCell::new(Some(frame)),
            scheduler
        })
    }

    /// Starts the computation if it has not been started yet. Idempotent and thread-safe: exactly one caller, from any thread, triggers
    /// execution, which begins inline on that caller's stack.
    pub(crate) fn start(self: &Arc<Self>) {
        if !self.started.swap(true, Ordering::AcqRel) {
            tracing::trace!(core = ?Arc::as_ptr(self), "starting continuation");
            self.run_state.store(QUEUED, Ordering::Release);
            Arc::clone(self).run();
        };
    }

    /// Gets whether the computation has finished and published its result.
    pub(crate) fn is_finished(&self) -> bool {
        self.waiters.is_closed()
    }

    /// Links a waiter to be resumed when the computation finishes. Fails by returning the node when the computation already finished;
    /// the result is then already visible to the caller.
    pub(crate) fn chain(&self, node: Box<WaitNode>) -> Result<(), Box<WaitNode>> {
        self.waiters.chain(node)
    }

    /// Blocks the current thread until the computation finishes, starting it if necessary.
    pub(crate) fn wait_blocking(self: &Arc<Self>) {
        self.start();

        if self.is_finished() {
            return;
        };

        let signal = Arc::new(SyncSignal::new());
        if self.chain(WaitNode::blocking(signal.clone())).is_ok() {
            signal.block();
        };
    }

    /// Moves the result out of the slot, or reports the stored computation failure. The failure payload is retained, so repeated
    /// retrieval through other handles observes it identically.
    ///
    /// # Safety
    ///
    /// The caller must have observed [`Core::is_finished`] and must hold the sole owning handle, so that no other thread can take the
    /// result concurrently.
    pub(crate) unsafe fn take_result(&self) -> Result<T, Error> {
        debug_assert!(self.is_finished());

        let slot = &mut *self.result.get();
        match mem::replace(slot, Slot::Taken) {
            Slot::Value(val) => Ok(val),
            Slot::Panicked(payload) => {
                *slot = Slot::Panicked(payload.clone());
                Err(Error::Panicked(payload))
            },
            Slot::Taken => {
                panic!("Attempt to take the result of a continuation twice");
            },
            Slot::Empty => unreachable!("wait list closed before result publication")
        }
    }

    /// Borrows the result in place, or reports the stored computation failure.
    ///
    /// # Safety
    ///
    /// The caller must have observed [`Core::is_finished`] and must guarantee that no owning handle exists that could move the result
    /// out while the borrow is live. Shared handles satisfy this by construction, since creating one consumes the owning handle.
    pub(crate) unsafe fn peek_result(&self) -> Result<&T, Error> {
        debug_assert!(self.is_finished());

        match &*self.result.get() {
            Slot::Value(val) => Ok(val),
            Slot::Panicked(payload) => Err(Error::Panicked(payload.clone())),
            Slot::Taken => {
                panic!("Attempt to read the result of a continuation after it was taken");
            },
            Slot::Empty => unreachable!("wait list closed before result publication")
        }
    }

    /// Requests that the continuation be resumed, routing through the captured scheduler if one is present. Safe to call from any
    /// thread; resumes that race an in-progress poll are coalesced into one additional poll instead of being lost.
    fn wake(self: Arc<Self>) {
        loop {
            match self.run_state.load(Ordering::Acquire) {
                IDLE => {
                    if self
                        .run_state
                        .compare_exchange(IDLE, QUEUED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.deliver();
                        return;
                    };
                },
                RUNNING => {
                    if self
                        .run_state
                        .compare_exchange(RUNNING, NOTIFIED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    };
                },
                _ => {
                    // Already queued, already notified or already done; this resume has nothing left to do.
                    return;
                }
            };
        }
    }

    fn deliver(self: Arc<Self>) {
        let scheduler = self.scheduler.clone();

        match scheduler {
            Some(scheduler) => {
                tracing::trace!(core = ?Arc::as_ptr(&self), "routing resume through scheduler");
                scheduler.queue_for_resume(TaskRef::new(self));
            },
            None => {
                self.run();
            }
        };
    }

    fn finish(&self, outcome: Slot<T>) {
        // SAFETY: We are the sole runner; nothing reads the slot before observing the close below.
        unsafe {
            *self.result.get() = outcome;
        };

        self.run_state.store(DONE, Ordering::Release);

        // The closing swap publishes the result to everyone who chained or who now fails to chain.
        let mut resumed = 0;
        for node in self.waiters.close() {
            node.resume();
            resumed += 1;
        }

        tracing::trace!(resumed, "continuation finished");

        // Frame teardown: captured state dies here, strictly after the result became observable.
        // SAFETY: The sole-runner guarantee still holds; no further poll can begin once the state is DONE.
        unsafe {
            *self.frame.get() = None;
        };
    }
}

impl<T: Send + 'static> Continuation for Core<T> {
    fn run(self: Arc<Self>) {
        if self
            .run_state
            .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // A stale delivery; the continuation was already resumed.
            return;
        };

        loop {
            let waker = make_waker(Arc::clone(&self));
            let mut cx = Context::from_waker(&waker);

            // SAFETY: Holding the RUNNING state makes us the sole accessor of the frame cell.
            let frame = unsafe { &mut *self.frame.get() };
            let Some(frame) = frame.as_mut() else {
                return;
            };

            match panic::catch_unwind(AssertUnwindSafe(|| frame.as_mut().poll(&mut cx))) {
                Ok(Poll::Pending) => {
                    if self
                        .run_state
                        .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    };

                    // A resume arrived while we were polling; drive the computation again rather than dropping the wakeup.
                    self.run_state.store(RUNNING, Ordering::Release);
                },
                Ok(Poll::Ready(val)) => {
                    self.finish(Slot::Value(val));
                    return;
                },
                Err(payload) => {
                    self.finish(Slot::Panicked(PanicPayload::new(payload)));
                    return;
                }
            };
        }
    }
}

fn vtable<T: Send + 'static>() -> &'static RawWakerVTable {
    &RawWakerVTable::new(clone_raw::<T>, wake_raw::<T>, wake_by_ref_raw::<T>, drop_raw::<T>)
}

/// Creates a [`Waker`] resuming the provided continuation. The waker is the type-erased form a waiter node carries: it bundles the
/// continuation handle with the scheduler captured at creation time.
pub(crate) fn make_waker<T: Send + 'static>(core: Arc<Core<T>>) -> Waker {
    // SAFETY: The vtable functions below uphold the RawWaker contract over a reference-counted Core pointer.
    unsafe { Waker::from_raw(RawWaker::new(Arc::into_raw(core) as *const (), vtable::<T>())) }
}

unsafe fn clone_raw<T: Send + 'static>(ptr: *const ()) -> RawWaker {
    let core = Arc::from_raw(ptr as *const Core<T>);
    let cloned = Arc::clone(&core);
    mem::forget(core);

    RawWaker::new(Arc::into_raw(cloned) as *const (), vtable::<T>())
}

unsafe fn wake_raw<T: Send + 'static>(ptr: *const ()) {
    let core = Arc::from_raw(ptr as *const Core<T>);
    core.wake();
}

unsafe fn wake_by_ref_raw<T: Send + 'static>(ptr: *const ()) {
    let core = Arc::from_raw(ptr as *const Core<T>);
    Arc::clone(&core).wake();
    mem::forget(core);
}

unsafe fn drop_raw<T: Send + 'static>(ptr: *const ()) {
    drop(Arc::from_raw(ptr as *const Core<T>));
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn test_start_is_single_fire() {
        let runs = Arc::new(AtomicUsize::new(0));
        let core = {
            let runs = runs.clone();
            Core::new(
                Box::pin(async move {
                    runs.fetch_add(1, Ordering::Relaxed);
                }),
                None
            )
        };

        core.start();
        core.start();
        core.start();

        assert!(core.is_finished());
        assert_eq!(1, runs.load(Ordering::Relaxed));
    }

    #[test]
    fn test_result_published_before_close() {
        let core = Core::new(Box::pin(async { 42 }), None);

        core.start();
        assert!(core.is_finished());
        assert_eq!(42, unsafe { core.take_result() }.unwrap());
    }

    #[test]
    fn test_wake_after_done_is_noop() {
        let core = Core::new(Box::pin(async { 42 }), None);

        core.start();
        let waker = make_waker(Arc::clone(&core));
        waker.wake_by_ref();
        waker.wake();

        assert_eq!(42, unsafe { core.take_result() }.unwrap());
    }
}

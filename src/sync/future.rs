//! Asynchronously resolved values.
//!
//! A [`Future`] is the consuming side of one suspended computation created by [`spawn`](crate::sched::spawn) or
//! [`schedule`](crate::sched::schedule). The computation does not run until it is started, which happens implicitly on the first wait,
//! retrieval or await of any of its handles. A waiting party suspends (when it is itself a continuation) or blocks on a
//! condition-variable-backed waiter node (when it is a plain thread); both go through the same waiter-chaining protocol, so a
//! computation finishing on any thread resumes every waiter exactly once with a fully published result.
//!
//! The plain [`Future`] handle is move-only: a value produced exactly once is moved out exactly once, and two independent owners racing
//! on move-out semantics are unrepresentable. [`SharedFuture`] widens ownership to any number of concurrent readers, which all observe
//! the identical result by reference.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::sched::task::Core;
use crate::sync::wait::WaitNode;

/// Represents a value that will be available when a suspended computation completes.
///
/// Handles are reference-counted: the computation's frame is kept alive by its handles, by every waiter registered with it and by its
/// own in-flight execution, and is torn down when the last of those is gone. Dropping every handle while the computation is still
/// running therefore defers destruction until it finishes.
#[must_use]
pub struct Future<T: Send + 'static> {
    core: Option<Arc<Core<T>>>,
    registered: Option<Waker>
}

impl<T: Send + 'static> Future<T> {
    pub(crate) fn from_core(core: Arc<Core<T>>) -> Future<T> {
        Future {
            core: Some(core),
            registered: None
        }
    }

    /// Gets whether this handle refers to a computation. Only a default-constructed handle does not; every operation on such a handle
    /// reports [`Error::NoState`].
    pub fn valid(&self) -> bool {
        self.core.is_some()
    }

    /// Starts the computation if it has not been started yet.
    ///
    /// Starting is idempotent and thread-safe: exactly one caller triggers execution, which begins on that caller's stack. Waiting,
    /// retrieving and awaiting all start the computation implicitly, so calling this is only needed to kick off execution without
    /// consuming or blocking anything.
    pub fn start(&self) -> Result<(), Error> {
        let core = self.core.as_ref().ok_or(Error::NoState)?;
        core.start();
        Ok(())
    }

    /// Blocks the current thread until the computation finishes, starting it if necessary.
    pub fn wait(&self) -> Result<(), Error> {
        let core = self.core.as_ref().ok_or(Error::NoState)?;
        core.wait_blocking();
        Ok(())
    }

    /// Timed waits are not implemented; this always reports [`Error::TimedWaitUnsupported`].
    pub fn wait_timeout(&self, _timeout: Duration) -> Result<(), Error> {
        Err(Error::TimedWaitUnsupported)
    }

    /// Timed waits are not implemented; this always reports [`Error::TimedWaitUnsupported`].
    pub fn wait_deadline(&self, _deadline: Instant) -> Result<(), Error> {
        Err(Error::TimedWaitUnsupported)
    }

    /// Blocks until the computation finishes, then moves its result out, or reports the failure it captured.
    ///
    /// The handle is consumed: a value produced once is retrieved once. Use [`Future::share`] first if several parties need the result.
    pub fn get(mut self) -> Result<T, Error> {
        let core = self.core.take().ok_or(Error::NoState)?;
        core.wait_blocking();

        // SAFETY: The computation finished and we consumed the sole owning handle, so nothing else can take the result.
        unsafe { core.take_result() }
    }

    /// Converts this handle into one that can be copied and read concurrently from many threads.
    pub fn share(mut self) -> SharedFuture<T>
    where
        T: Sync
    {
        SharedFuture {
            core: self.core.take(),
            registered: None
        }
    }
}

impl<T: Send + 'static> Default for Future<T> {
    /// Creates a handle referring to no computation.
    fn default() -> Future<T> {
        Future {
            core: None,
            registered: None
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future").field("valid", &self.valid()).finish()
    }
}

impl<T: Send + 'static> std::future::Future for Future<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        match this.core.as_ref() {
            Some(core) => {
                core.start();

                if !core.is_finished() {
                    if this.registered.as_ref().is_some_and(|waker| waker.will_wake(cx.waker())) {
                        // Already chained with an equivalent waker; the closing swap will resume us.
                        return Poll::Pending;
                    };

                    if core.chain(WaitNode::waking(cx.waker().clone())).is_ok() {
                        this.registered = Some(cx.waker().clone());
                        return Poll::Pending;
                    };

                    // Lost the race against the close; the result is published and can be observed directly.
                };
            },
            None => {
                return Poll::Ready(Err(Error::NoState));
            }
        };

        this.registered = None;
        match this.core.take() {
            // SAFETY: The computation finished and we consume the sole owning handle here.
            Some(core) => Poll::Ready(unsafe { core.take_result() }),
            None => unreachable!()
        }
    }
}

/// A copyable handle to a computation's result, readable concurrently from many threads.
///
/// All copies observe the identical value (or the identical captured failure); [`SharedFuture::get`] returns the result by reference
/// and never consumes it.
#[must_use]
pub struct SharedFuture<T: Send + 'static> {
    core: Option<Arc<Core<T>>>,
    registered: Option<Waker>
}

impl<T: Send + 'static> SharedFuture<T> {
    /// Gets whether this handle refers to a computation.
    pub fn valid(&self) -> bool {
        self.core.is_some()
    }

    /// Starts the computation if it has not been started yet. See [`Future::start`].
    pub fn start(&self) -> Result<(), Error> {
        let core = self.core.as_ref().ok_or(Error::NoState)?;
        core.start();
        Ok(())
    }

    /// Blocks the current thread until the computation finishes, starting it if necessary.
    pub fn wait(&self) -> Result<(), Error> {
        let core = self.core.as_ref().ok_or(Error::NoState)?;
        core.wait_blocking();
        Ok(())
    }

    /// Timed waits are not implemented; this always reports [`Error::TimedWaitUnsupported`].
    pub fn wait_timeout(&self, _timeout: Duration) -> Result<(), Error> {
        Err(Error::TimedWaitUnsupported)
    }

    /// Timed waits are not implemented; this always reports [`Error::TimedWaitUnsupported`].
    pub fn wait_deadline(&self, _deadline: Instant) -> Result<(), Error> {
        Err(Error::TimedWaitUnsupported)
    }

    /// Blocks until the computation finishes, then returns its result by reference, or reports the failure it captured. Every call,
    /// from any thread and any copy of this handle, observes the same result.
    pub fn get(&self) -> Result<&T, Error>
    where
        T: Sync
    {
        let core = self.core.as_ref().ok_or(Error::NoState)?;
        core.wait_blocking();

        // SAFETY: The computation finished, and no owning handle exists once a SharedFuture has been created, so the result can never
        //         be moved out from under this borrow.
        unsafe { core.peek_result() }
    }
}

impl<T: Send + 'static> Clone for SharedFuture<T> {
    fn clone(&self) -> SharedFuture<T> {
        SharedFuture {
            core: self.core.clone(),
            registered: None
        }
    }
}

impl<T: Send + 'static> Default for SharedFuture<T> {
    fn default() -> SharedFuture<T> {
        SharedFuture {
            core: None,
            registered: None
        }
    }
}

impl<T: Send + 'static> fmt::Debug for SharedFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedFuture").field("valid", &self.valid()).finish()
    }
}

impl<T: Send + Sync + Clone + 'static> std::future::Future for SharedFuture<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let core = match this.core.as_ref() {
            Some(core) => core,
            None => {
                return Poll::Ready(Err(Error::NoState));
            }
        };

        core.start();

        if !core.is_finished() {
            if this.registered.as_ref().is_some_and(|waker| waker.will_wake(cx.waker())) {
                return Poll::Pending;
            };

            if core.chain(WaitNode::waking(cx.waker().clone())).is_ok() {
                this.registered = Some(cx.waker().clone());
                return Poll::Pending;
            };
        };

        this.registered = None;

        // SAFETY: The computation finished; shared handles only ever borrow the result.
        Poll::Ready(unsafe { core.peek_result() }.map(T::clone))
    }
}

static_assertions::assert_impl_all!(Future<i32>: Send, Sync);
static_assertions::assert_impl_all!(SharedFuture<i32>: Send, Sync, Clone);
static_assertions::assert_not_impl_any!(Future<i32>: Clone);

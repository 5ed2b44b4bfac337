//! Coroutine-style futures, awaitable locks and pluggable resumption scheduling.
//!
//! This crate provides a small toolkit for structuring work as suspendable computations:
//!
//! * [`spawn`] and [`schedule`] turn a computation into a reference-counted continuation and hand back a [`Future`] to its eventual
//!   result. Computations are lazy: nothing runs until a handle starts, waits on or awaits the future.
//! * [`Future`] is a move-only handle whose result is retrieved exactly once; [`SharedFuture`] widens it to any number of concurrent
//!   readers observing the identical result. Plain threads can block for a result, continuations suspend for it, and both arrive
//!   through the same waiter protocol.
//! * [`Mutex`] and [`SharedMutex`] are locks whose contenders suspend instead of blocking threads, with first-come-first-served
//!   hand-off.
//! * A [`Scheduler`] decides how resumed continuations get back to execution. The policy is captured once, when the continuation is
//!   created, and intercepts every later resumption no matter which thread or primitive triggers it.
//!
//! A computation that panics does not poison anything: the panic is captured and every retrieval of the result reports it as an
//! [`Error::Panicked`] carrying the original payload.

pub mod error;
pub mod sched;
pub mod sync;

pub use error::{Error, PanicPayload};
pub use sched::policy::{CountingScheduler, InlineScheduler, QueueScheduler};
pub use sched::{schedule, schedule_fn, spawn, Scheduler, TaskRef};
pub use sync::{ExclusiveToken, Future, LockFuture, LockToken, Mutex, SharedFuture, SharedMutex, SharedToken};

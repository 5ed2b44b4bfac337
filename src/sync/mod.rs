//! Synchronization primitives for suspended computations.
//!
//! Everything in this module speaks the same waiter-node protocol: a party waiting on a future, a mutex or a readers-writer lock
//! chains one node onto an atomic list and is resumed through its continuation's captured scheduler (or its blocked thread's signal)
//! when the event it is waiting for occurs.

pub mod future;
pub mod mutex;
pub mod shared_mutex;

pub(crate) mod wait;

pub use future::{Future, SharedFuture};
pub use mutex::{LockFuture, LockToken, Mutex};
pub use shared_mutex::{ExclusiveToken, SharedMutex, SharedToken};

//! An awaitable mutual-exclusion lock that suspends contenders instead of blocking threads.
//!
//! The entire lock is two atomic words. One word is the wait queue: either unlocked, or the head of an intrusive stack of
//! [`WaitNode`]s in reverse arrival order, whose terminal entry belongs to the current holder. The other word points at the holder's
//! entry, which is how a queued contender recognises that the lock was handed to it. Acquisition and queueing are a single CAS on the
//! queue word; release walks the queue to the entry just before the holder's, which is the earliest arrival still waiting, so hand-off
//! is first-come-first-served.
//!
//! There is no unlock fairness beyond that ordering and no cancellation: a contender that enqueued itself must eventually take the
//! lock. Dropping a pending [`LockFuture`] leaks its place in the queue and the acquisition it would have been granted.

use std::pin::Pin;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::task::{Context, Poll};

use crate::sync::wait::WaitNode;

const STATE_UNLOCKED: usize = 0;

/// The decoded state of the queue word.
///
/// `WaitNode` allocations are well-aligned, so a node address can never collide with the unlocked value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MutexState {
    Unlocked,
    Locked(NonNull<WaitNode>)
}

impl MutexState {
    fn from_usize(val: usize) -> MutexState {
        match val {
            STATE_UNLOCKED => MutexState::Unlocked,
            ptr => MutexState::Locked(NonNull::new(ptr as *mut WaitNode).unwrap())
        }
    }

    fn into_usize(self) -> usize {
        match self {
            MutexState::Unlocked => STATE_UNLOCKED,
            MutexState::Locked(node) => node.as_ptr() as usize
        }
    }
}

/// An awaitable mutual-exclusion lock. See the module documentation for the queueing protocol.
pub struct Mutex {
    waiting: AtomicUsize,
    holder: AtomicPtr<WaitNode>
}

impl Mutex {
    /// Creates a new, unlocked mutex.
    pub const fn new() -> Mutex {
        Mutex {
            waiting: AtomicUsize::new(STATE_UNLOCKED),
            holder: AtomicPtr::new(ptr::null_mut())
        }
    }

    /// Gets whether the mutex is currently held. Only meaningful for debugging and assertions, since the answer can be stale by the
    /// time the caller observes it.
    pub fn is_locked(&self) -> bool {
        !matches!(
            MutexState::from_usize(self.waiting.load(Ordering::Acquire)),
            MutexState::Unlocked
        )
    }

    /// Attempts to acquire the mutex without suspending, returning a guard on success.
    pub fn try_lock(&self) -> Option<LockToken> {
        let node = Box::into_raw(WaitNode::holder_only());

        match self.waiting.compare_exchange(
            MutexState::Unlocked.into_usize(),
            MutexState::Locked(NonNull::new(node).unwrap()).into_usize(),
            Ordering::AcqRel,
            Ordering::Relaxed
        ) {
            Ok(_) => {
                self.holder.store(node, Ordering::Release);
                Some(LockToken { mutex: self, armed: true })
            },
            Err(_) => {
                // SAFETY: The node was never published, so we still own it.
                drop(unsafe { Box::from_raw(node) });
                None
            }
        }
    }

    /// Acquires the mutex, suspending the calling continuation until the lock is handed to it.
    ///
    /// The returned future must be driven to completion once it has been polled: dropping it while queued leaks the queue entry and
    /// the eventual acquisition. The waker captured when the contender enqueues itself is the one the hand-off wakes through; later
    /// polls do not re-register it, so the awaiting task's waker must stay equivalent (in the `will_wake` sense) until the lock is
    /// granted.
    pub fn lock(&self) -> LockFuture {
        LockFuture { mutex: self, node: None }
    }

    /// Releases the mutex, handing it to the earliest still-waiting contender if there is one.
    ///
    /// # Panics
    ///
    /// Unlocking a mutex that is not locked is a contract violation and panics.
    pub fn unlock(&self) {
        let holder = self.holder.load(Ordering::Relaxed);

        loop {
            let head = self.waiting.load(Ordering::Acquire);

            match MutexState::from_usize(head) {
                MutexState::Unlocked => {
                    panic!("Attempt to unlock a mutex that is not locked");
                },
                MutexState::Locked(node) if node.as_ptr() == holder => {
                    // The holder's entry is the only one queued. The hand-off pointer must be cleared before the CAS publishes
                    // Unlocked, since a new acquirer may install its own entry the moment the CAS lands. A concurrent enqueue moves
                    // the head, failing the CAS, and is then handled by the walk below.
                    self.holder.store(ptr::null_mut(), Ordering::Relaxed);

                    if self
                        .waiting
                        .compare_exchange(head, MutexState::Unlocked.into_usize(), Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        // SAFETY: The entry was unlinked by the CAS, so we are its sole owner again.
                        drop(unsafe { Box::from_raw(holder) });
                        return;
                    };
                },
                MutexState::Locked(head) => {
                    // Contenders are queued in reverse arrival order ahead of the holder's entry, so the entry linking to it is the
                    // earliest arrival. Only the head moves concurrently; interior links are only ever touched by the single unlocker.
                    let mut next_in_line = head.as_ptr();

                    // SAFETY: Every queued entry is owned by the queue and stays valid until unlinked by an unlocker, which we are.
                    unsafe {
                        while (*next_in_line).next != holder {
                            next_in_line = (*next_in_line).next;

                            if next_in_line.is_null() {
                                panic!("Mutex holder entry is missing from its wait queue");
                            };
                        }

                        // The store below makes the hand-off observable: from that point the new holder can run, release the lock
                        // and free its own entry. Detach the resumption handles first and never touch the entry afterwards.
                        let resume = (*next_in_line).resume_handle();
                        (*next_in_line).next = ptr::null_mut();
                        self.holder.store(next_in_line, Ordering::Release);
                        drop(Box::from_raw(holder));

                        tracing::trace!(next = ?next_in_line, "mutex handed off");
                        resume.resume();
                    };
                    return;
                }
            };
        }
    }
}

impl Default for Mutex {
    fn default() -> Mutex {
        Mutex::new()
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        let mut next = match MutexState::from_usize(*self.waiting.get_mut()) {
            MutexState::Unlocked => ptr::null_mut(),
            MutexState::Locked(head) => head.as_ptr()
        };

        // Reclaim whatever entries are still queued, without waking anyone.
        while !next.is_null() {
            // SAFETY: Dropping the mutex means no contender can touch the queue anymore.
            let node = unsafe { Box::from_raw(next) };
            next = node.next;
        }
    }
}

// SAFETY: All queue mutation goes through the atomic words; see WaitNode for the interior link protocol.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

/// The pending acquisition of a [`Mutex`]. Resolves to a [`LockToken`] once the lock is handed to this contender.
#[must_use]
pub struct LockFuture<'a> {
    mutex: &'a Mutex,
    node: Option<NonNull<WaitNode>>
}

// SAFETY: The queue entry pointer is owned by the mutex's queue; this future only compares it against the holder word.
unsafe impl Send for LockFuture<'_> {}
unsafe impl Sync for LockFuture<'_> {}

impl<'a> std::future::Future for LockFuture<'a> {
    type Output = LockToken<'a>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<LockToken<'a>> {
        let this = self.get_mut();

        if let Some(node) = this.node {
            // Already queued. The lock is ours exactly when the previous holder pointed the holder word at our entry; our entry
            // cannot be freed or recycled before that happens, so the comparison cannot be spoofed.
            return if this.mutex.holder.load(Ordering::Acquire) == node.as_ptr() {
                Poll::Ready(LockToken {
                    mutex: this.mutex,
                    armed: true
                })
            } else {
                Poll::Pending
            };
        };

        let node = Box::into_raw(WaitNode::waking(cx.waker().clone()));

        loop {
            let head = this.mutex.waiting.load(Ordering::Acquire);

            match MutexState::from_usize(head) {
                MutexState::Unlocked => {
                    // SAFETY: The node is unpublished; we still own it.
                    unsafe {
                        (*node).next = ptr::null_mut();
                    };

                    if this
                        .mutex
                        .waiting
                        .compare_exchange_weak(
                            head,
                            MutexState::Locked(NonNull::new(node).unwrap()).into_usize(),
                            Ordering::AcqRel,
                            Ordering::Acquire
                        )
                        .is_ok()
                    {
                        // Uncontended: our entry goes straight in as the holder's.
                        this.mutex.holder.store(node, Ordering::Release);
                        return Poll::Ready(LockToken {
                            mutex: this.mutex,
                            armed: true
                        });
                    };
                },
                MutexState::Locked(prev) => {
                    // SAFETY: The node is unpublished; we still own it.
                    unsafe {
                        (*node).next = prev.as_ptr();
                    };

                    if this
                        .mutex
                        .waiting
                        .compare_exchange_weak(
                            head,
                            MutexState::Locked(NonNull::new(node).unwrap()).into_usize(),
                            Ordering::AcqRel,
                            Ordering::Acquire
                        )
                        .is_ok()
                    {
                        this.node = Some(NonNull::new(node).unwrap());
                        return Poll::Pending;
                    };
                }
            };
        }
    }
}

/// A guard proving that its holder owns a [`Mutex`]. The lock is released when the token is dropped or explicitly released.
#[must_use]
pub struct LockToken<'a> {
    mutex: &'a Mutex,
    armed: bool
}

impl LockToken<'_> {
    /// Releases the lock now, consuming the token.
    pub fn release(mut self) {
        self.armed = false;
        self.mutex.unlock();
    }

    /// Consumes the token without releasing the lock; the caller takes over responsibility for unlocking.
    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for LockToken<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.mutex.unlock();
        };
    }
}

static_assertions::assert_impl_all!(Mutex: Send, Sync);
static_assertions::assert_impl_all!(LockToken<'static>: Send, Sync);

#[cfg(test)]
mod test {
    use std::cell::UnsafeCell;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::sched::spawn;

    #[test]
    fn test_try_lock_cycle() {
        let mutex = Mutex::new();

        assert!(!mutex.is_locked());

        let token = mutex.try_lock().unwrap();
        assert!(mutex.is_locked());
        assert!(mutex.try_lock().is_none());

        token.release();
        assert!(!mutex.is_locked());
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn test_token_drop_releases() {
        let mutex = Mutex::new();

        {
            let _token = mutex.try_lock().unwrap();
            assert!(mutex.is_locked());
        }

        assert!(!mutex.is_locked());
    }

    #[test]
    #[should_panic]
    fn test_unlock_unheld_panics() {
        let mutex = Mutex::new();

        mutex.unlock();
    }

    #[test]
    fn test_uncontended_async_lock() {
        let mutex = Arc::new(Mutex::new());

        let fut = {
            let mutex = mutex.clone();
            spawn(async move {
                let token = mutex.lock().await;
                assert!(mutex.is_locked());
                token.release();
            })
        };

        fut.get().unwrap();
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_handoff_is_first_come_first_served() {
        let mutex = Arc::new(Mutex::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let held = mutex.try_lock().unwrap();

        let contenders = (0..3)
            .map(|i| {
                let mutex = mutex.clone();
                let order = order.clone();
                let fut = spawn(async move {
                    let token = mutex.lock().await;
                    order.lock().unwrap().push(i);
                    token.release();
                });
                fut.start().unwrap();
                fut
            })
            .collect::<Vec<_>>();

        assert!(order.lock().unwrap().is_empty());

        // Each release resumes the earliest waiter inline, which runs, pushes and releases in turn.
        held.release();

        for fut in contenders {
            fut.get().unwrap();
        }

        assert_eq!(vec![0, 1, 2], *order.lock().unwrap());
    }

    #[test]
    fn test_handoff_does_not_touch_released_entry() {
        use crate::sync::wait::{SyncSignal, WaitList, WaitNode};

        let mutex = Arc::new(Mutex::new());
        let list = Arc::new(WaitList::new());
        let signal = Arc::new(SyncSignal::new());

        let held = mutex.try_lock().unwrap();

        let contender = {
            let mutex = mutex.clone();
            let list = list.clone();
            let signal = signal.clone();
            spawn(async move {
                mutex.lock().await.release();

                // Releasing freed this contender's queue entry; chaining here is likely to reuse that allocation while the
                // unlocker is still mid-hand-off on the same stack.
                assert!(list.chain(WaitNode::blocking(signal.clone())).is_ok());
            })
        };
        contender.start().unwrap();

        // The hand-off runs the contender inline. An unlocker that still reads its entry afterwards would find the recycled
        // blocking node and spuriously notify its signal.
        held.release();
        contender.get().unwrap();

        assert!(!list.is_closed());
        assert!(!signal.was_notified());
    }

    struct Critical {
        val: UnsafeCell<u64>,
        in_crit: AtomicBool
    }

    // SAFETY: Test-only; accesses to val are guarded by the mutex under test and checked by the in_crit flag.
    unsafe impl Sync for Critical {}

    #[test]
    fn test_mutual_exclusion_across_threads() {
        const THREADS: u64 = 4;
        const ROUNDS: u64 = 100;

        let mutex = Arc::new(Mutex::new());
        let shared = Arc::new(Critical {
            val: UnsafeCell::new(0),
            in_crit: AtomicBool::new(false)
        });

        let workers = (0..THREADS)
            .map(|_| {
                let mutex = mutex.clone();
                let shared = shared.clone();

                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        let mutex = mutex.clone();
                        let shared = shared.clone();

                        spawn(async move {
                            let token = mutex.lock().await;

                            assert!(!shared.in_crit.swap(true, Ordering::SeqCst));
                            // SAFETY: Exclusivity is exactly what this test asserts.
                            unsafe {
                                *shared.val.get() += 1;
                            };
                            assert!(shared.in_crit.swap(false, Ordering::SeqCst));

                            token.release();
                        })
                        .get()
                        .unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();

        for worker in workers {
            worker.join().unwrap();
        }

        assert!(!mutex.is_locked());
        assert_eq!(THREADS * ROUNDS, unsafe { *shared.val.get() });
    }
}

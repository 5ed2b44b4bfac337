//! The waiter-chaining protocol shared by futures and mutexes.
//!
//! A [`WaitNode`] represents one party awaiting an event: either a suspended continuation (carried as a [`Waker`], which also carries the
//! resumption policy captured when the continuation was created) or a thread blocked on a [`SyncSignal`]. Nodes are chained into an
//! intrusive singly-linked list whose head is a single atomic word, so that any number of threads can link themselves concurrently with a
//! CAS retry loop and the completing party can harvest the entire chain with one atomic swap.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::Waker;

/// A single pending waiter, owned by the list it is chained into.
///
/// Ownership is transferred to the list when the node is successfully chained and recovered when the node is harvested, so a node is
/// resumed at most once by construction.
pub(crate) struct WaitNode {
    pub(crate) next: *mut WaitNode,
    waker: Option<Waker>,
    signal: Option<Arc<SyncSignal>>,
}

// SAFETY: The `next` pointer is written by the enqueuing thread before the node is published and afterwards only by the single party
//         harvesting the node (the closing swap or the sole mutex holder), so the node can safely move between threads.
unsafe impl Send for WaitNode {}
unsafe impl Sync for WaitNode {}

impl WaitNode {
    /// Creates a node resuming a suspended continuation.
    pub(crate) fn waking(waker: Waker) -> Box<WaitNode> {
        Box::new(WaitNode {
            next: ptr::null_mut(),
            waker: Some(waker),
            signal: None
        })
    }

    /// Creates a node signalling a thread blocked in a synchronous wait.
    pub(crate) fn blocking(signal: Arc<SyncSignal>) -> Box<WaitNode> {
        Box::new(WaitNode {
            next: ptr::null_mut(),
            waker: None,
            signal: Some(signal)
        })
    }

    /// Creates an empty node standing in for a holder that acquired a mutex synchronously.
    pub(crate) fn holder_only() -> Box<WaitNode> {
        Box::new(WaitNode {
            next: ptr::null_mut(),
            waker: None,
            signal: None
        })
    }

    /// Hands the continuation back to execution and releases any blocked thread. Consumes the node, so a harvested node is resumed
    /// exactly once.
    pub(crate) fn resume(self: Box<WaitNode>) {
        if let Some(waker) = self.waker {
            waker.wake();
        }
        if let Some(signal) = self.signal {
            signal.notify();
        }
    }

    /// Clones this waiter's resumption handles out of the node. Used by the mutex hand-off, where the node lives on as the new
    /// holder's queue entry: the resumed party may release the lock and free that entry before the resumer regains control, so the
    /// resumer must stop touching the node once the hand-off is observable and wake through the detached handles instead.
    pub(crate) fn resume_handle(&self) -> ResumeHandle {
        ResumeHandle {
            waker: self.waker.clone(),
            signal: self.signal.clone()
        }
    }
}

/// A waiter's resumption handles, detached from its node so the waiter can be resumed after the node is no longer safe to access.
pub(crate) struct ResumeHandle {
    waker: Option<Waker>,
    signal: Option<Arc<SyncSignal>>
}

impl ResumeHandle {
    /// Hands the continuation back to execution and releases any blocked thread.
    pub(crate) fn resume(self) {
        if let Some(waker) = self.waker {
            waker.wake();
        }
        if let Some(signal) = self.signal {
            signal.notify();
        }
    }
}

const STATE_EMPTY: usize = 0;
const STATE_CLOSED: usize = 1;

/// The decoded state of a wait list's atomic head word.
///
/// `WaitNode` allocations are well-aligned, so a node address can never collide with the two reserved values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitListState {
    Empty,
    Waiting(NonNull<WaitNode>),
    Closed
}

impl WaitListState {
    fn from_usize(val: usize) -> WaitListState {
        match val {
            STATE_EMPTY => WaitListState::Empty,
            STATE_CLOSED => WaitListState::Closed,
            ptr => WaitListState::Waiting(NonNull::new(ptr as *mut WaitNode).unwrap())
        }
    }

    fn into_usize(self) -> usize {
        match self {
            WaitListState::Empty => STATE_EMPTY,
            WaitListState::Closed => STATE_CLOSED,
            WaitListState::Waiting(node) => node.as_ptr() as usize
        }
    }
}

/// A lock-free list of waiters pending on a one-shot event.
///
/// The list supports concurrent chaining from any thread and a single closing swap that both captures every pending waiter and forbids
/// further links. Whatever the event publishes must be stored before calling [`WaitList::close`]: the swap uses release ordering and every
/// chaining attempt or closed-check uses acquire ordering, so an observer that either fails to chain or sees the list closed also sees the
/// published result.
pub(crate) struct WaitList {
    head: AtomicUsize
}

impl WaitList {
    pub(crate) const fn new() -> WaitList {
        WaitList {
            head: AtomicUsize::new(STATE_EMPTY)
        }
    }

    /// Gets whether the event already occurred. Acquire-ordered, so a `true` result makes the event's published result visible.
    pub(crate) fn is_closed(&self) -> bool {
        self.head.load(Ordering::Acquire) == STATE_CLOSED
    }

    /// Links a waiter onto the list, transferring ownership of the node to the list.
    ///
    /// Fails by returning the node when the list is already closed; the caller must then treat the event as having occurred and observe
    /// its result directly instead of waiting.
    pub(crate) fn chain(&self, node: Box<WaitNode>) -> Result<(), Box<WaitNode>> {
        let node = Box::into_raw(node);

        loop {
            let head = self.head.load(Ordering::Acquire);

            match WaitListState::from_usize(head) {
                WaitListState::Closed => {
                    // SAFETY: The node was never published, so we still own it.
                    return Err(unsafe { Box::from_raw(node) });
                },
                WaitListState::Empty => unsafe {
                    (*node).next = ptr::null_mut();
                },
                WaitListState::Waiting(prev) => unsafe {
                    (*node).next = prev.as_ptr();
                }
            };

            let new_head = WaitListState::Waiting(NonNull::new(node).unwrap()).into_usize();
            if self
                .head
                .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            };
        }
    }

    /// Closes the list, capturing every pending waiter in one atomic swap. No further waiter can link after this returns.
    ///
    /// # Panics
    ///
    /// Closing a list twice is a contract violation and panics.
    pub(crate) fn close(&self) -> ClosedChain {
        match WaitListState::from_usize(self.head.swap(STATE_CLOSED, Ordering::AcqRel)) {
            WaitListState::Empty => ClosedChain { next: ptr::null_mut() },
            WaitListState::Waiting(head) => ClosedChain { next: head.as_ptr() },
            WaitListState::Closed => {
                panic!("Attempt to close a wait list that was already closed");
            }
        }
    }
}

impl Drop for WaitList {
    fn drop(&mut self) {
        // A list dropped while still open belongs to a computation that was leaked without ever resolving. Its waiters can never be
        // resumed; reclaim the nodes without waking anyone.
        if let WaitListState::Waiting(head) = WaitListState::from_usize(self.head.load(Ordering::Acquire)) {
            drop(ClosedChain { next: head.as_ptr() });
        };
    }
}

/// The chain of waiters captured by a closing swap, yielding ownership of each node in harvest order (reverse arrival order; no fairness
/// is guaranteed).
pub(crate) struct ClosedChain {
    next: *mut WaitNode
}

// SAFETY: The chain exclusively owns every captured node; see WaitNode.
unsafe impl Send for ClosedChain {}

impl Iterator for ClosedChain {
    type Item = Box<WaitNode>;

    fn next(&mut self) -> Option<Box<WaitNode>> {
        if self.next.is_null() {
            None
        } else {
            // SAFETY: Every node on a captured chain was created by Box::into_raw in WaitList::chain and is owned by this iterator. The
            //         successor pointer must be read before the node is handed out, since resuming a node can invalidate it.
            let node = unsafe { Box::from_raw(self.next) };
            self.next = node.next;
            Some(node)
        }
    }
}

impl Drop for ClosedChain {
    fn drop(&mut self) {
        for _ in self {}
    }
}

/// A condition-variable-backed signal allowing a plain thread to block on the waiter protocol without polling.
pub(crate) struct SyncSignal {
    state: Mutex<bool>,
    cond: Condvar
}

impl SyncSignal {
    pub(crate) fn new() -> SyncSignal {
        SyncSignal {
            state: Mutex::new(false),
            cond: Condvar::new()
        }
    }

    pub(crate) fn notify(&self) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.cond.notify_all();
    }

    pub(crate) fn block(&self) {
        let mut fired = self.state.lock().unwrap_or_else(|e| e.into_inner());

        while !*fired {
            fired = self.cond.wait(fired).unwrap_or_else(|e| e.into_inner());
        };
    }

    /// Gets whether the signal has been notified, without blocking.
    pub(crate) fn was_notified(&self) -> bool {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;
    use std::task::Wake;
    use std::thread;

    use super::*;

    struct CountingWake(AtomicUsize);

    impl CountingWake {
        fn new() -> Arc<CountingWake> {
            Arc::new(CountingWake(AtomicUsize::new(0)))
        }

        fn count(&self) -> usize {
            self.0.load(Ordering::Relaxed)
        }
    }

    impl Wake for CountingWake {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_close_resumes_all() {
        let list = WaitList::new();
        let wake_1 = CountingWake::new();
        let wake_2 = CountingWake::new();

        assert!(list.chain(WaitNode::waking(Waker::from(wake_1.clone()))).is_ok());
        assert!(list.chain(WaitNode::waking(Waker::from(wake_2.clone()))).is_ok());
        assert!(!list.is_closed());
        assert_eq!(0, wake_1.count());

        for node in list.close() {
            node.resume();
        }

        assert!(list.is_closed());
        assert_eq!(1, wake_1.count());
        assert_eq!(1, wake_2.count());
    }

    #[test]
    fn test_chain_after_close_fails() {
        let list = WaitList::new();

        for node in list.close() {
            node.resume();
        }

        let wake = CountingWake::new();
        assert!(list.chain(WaitNode::waking(Waker::from(wake.clone()))).is_err());
        assert_eq!(0, wake.count());
    }

    #[test]
    #[should_panic]
    fn test_double_close_panics() {
        let list = WaitList::new();

        drop(list.close());
        drop(list.close());
    }

    #[test]
    fn test_resume_handle_outlives_node() {
        let wake = CountingWake::new();
        let node = WaitNode::waking(Waker::from(wake.clone()));

        let handle = node.resume_handle();
        drop(node);

        assert_eq!(0, wake.count());
        handle.resume();
        assert_eq!(1, wake.count());
    }

    #[test]
    fn test_blocking_signal() {
        let list = Arc::new(WaitList::new());
        let signal = Arc::new(SyncSignal::new());

        assert!(list.chain(WaitNode::blocking(signal.clone())).is_ok());

        let closer = {
            let list = list.clone();
            thread::spawn(move || {
                for node in list.close() {
                    node.resume();
                }
            })
        };

        signal.block();
        assert!(list.is_closed());
        closer.join().unwrap();
    }
}

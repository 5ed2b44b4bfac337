//! An awaitable readers-writer lock built from two [`Mutex`]es and a reader count.
//!
//! The outer mutex serialises admission: writers hold it for their whole critical section, readers hold it only while joining. The
//! inner mutex represents the data itself and is held either by the one writer or collectively by the group of readers, acquired by
//! the first reader to join and released by the last to leave. A writer waiting for the inner mutex already holds the outer one, so
//! new readers cannot join past a waiting writer; they queue behind it on the outer mutex until the writer is done.
//!
//! Like [`Mutex`], contenders suspend instead of blocking threads, hand-off follows arrival order on each underlying queue and
//! cancellation of a pending acquisition is not supported.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::sync::mutex::Mutex;

/// An awaitable readers-writer lock. See the module documentation for the admission protocol.
pub struct SharedMutex {
    outer: Mutex,
    inner: Mutex,
    readers: AtomicUsize
}

impl SharedMutex {
    /// Creates a new, unheld lock.
    pub const fn new() -> SharedMutex {
        SharedMutex {
            outer: Mutex::new(),
            inner: Mutex::new(),
            readers: AtomicUsize::new(0)
        }
    }

    /// Gets whether the lock is currently held exclusively. Only meaningful for debugging and assertions, since the answer can be
    /// stale by the time the caller observes it.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked() && self.readers.load(Ordering::Acquire) == 0
    }

    /// Gets whether the lock is currently held by at least one reader. Debugging observer, like [`SharedMutex::is_locked`].
    pub fn is_locked_shared(&self) -> bool {
        self.readers.load(Ordering::Acquire) > 0
    }

    /// Acquires the lock exclusively, suspending until every current reader or writer is gone.
    pub async fn lock(&self) -> ExclusiveToken<'_> {
        self.outer.lock().await.disarm();
        self.inner.lock().await.disarm();

        ExclusiveToken { mutex: self, armed: true }
    }

    /// Attempts to acquire the lock exclusively without suspending.
    pub fn try_lock(&self) -> Option<ExclusiveToken> {
        let outer = self.outer.try_lock()?;

        match self.inner.try_lock() {
            Some(inner) => {
                outer.disarm();
                inner.disarm();
                Some(ExclusiveToken { mutex: self, armed: true })
            },
            None => {
                // Readers hold the inner mutex; back out of the admission lock.
                drop(outer);
                None
            }
        }
    }

    /// Releases an exclusive hold, handing the lock to whoever is queued next.
    ///
    /// # Panics
    ///
    /// Releasing a lock that is not held exclusively is a contract violation and panics.
    pub fn unlock(&self) {
        self.inner.unlock();
        self.outer.unlock();
    }

    /// Acquires the lock for shared reading, suspending until any current or already-waiting writer is gone. Any number of readers
    /// can hold the lock at once.
    pub async fn lock_shared(&self) -> SharedToken<'_> {
        let outer = self.outer.lock().await;

        if self.readers.fetch_add(1, Ordering::AcqRel) == 0 {
            // First reader in: claim the data on behalf of the whole group.
            self.inner.lock().await.disarm();
        };

        outer.release();
        SharedToken { mutex: self, armed: true }
    }

    /// Attempts to acquire the lock for shared reading without suspending.
    pub fn try_lock_shared(&self) -> Option<SharedToken> {
        let outer = self.outer.try_lock()?;

        if self.readers.fetch_add(1, Ordering::AcqRel) == 0 {
            // The inner mutex can only be held transiently here, by a departing last reader between its count decrement and its
            // release, so spinning is bounded.
            loop {
                if let Some(inner) = self.inner.try_lock() {
                    inner.disarm();
                    break;
                };

                std::hint::spin_loop();
            }
        };

        outer.release();
        Some(SharedToken { mutex: self, armed: true })
    }

    /// Releases one shared hold. The last reader to leave hands the lock to whoever is queued next.
    ///
    /// # Panics
    ///
    /// Releasing a lock that is not held by any reader is a contract violation and panics.
    pub fn unlock_shared(&self) {
        let prev = self.readers.fetch_sub(1, Ordering::AcqRel);

        if prev == 0 {
            self.readers.fetch_add(1, Ordering::AcqRel);
            panic!("Attempt to release a shared lock that is not held by any reader");
        } else if prev == 1 {
            self.inner.unlock();
        };
    }
}

impl Default for SharedMutex {
    fn default() -> SharedMutex {
        SharedMutex::new()
    }
}

/// A guard proving that its holder owns a [`SharedMutex`] exclusively. The lock is released when the token is dropped or explicitly
/// released.
#[must_use]
pub struct ExclusiveToken<'a> {
    mutex: &'a SharedMutex,
    armed: bool
}

impl ExclusiveToken<'_> {
    /// Releases the lock now, consuming the token.
    pub fn release(mut self) {
        self.armed = false;
        self.mutex.unlock();
    }
}

impl Drop for ExclusiveToken<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.mutex.unlock();
        };
    }
}

/// A guard proving that its holder shares a [`SharedMutex`] with other readers. The hold is released when the token is dropped or
/// explicitly released.
#[must_use]
pub struct SharedToken<'a> {
    mutex: &'a SharedMutex,
    armed: bool
}

impl SharedToken<'_> {
    /// Releases this reader's hold now, consuming the token.
    pub fn release(mut self) {
        self.armed = false;
        self.mutex.unlock_shared();
    }
}

impl Drop for SharedToken<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.mutex.unlock_shared();
        };
    }
}

static_assertions::assert_impl_all!(SharedMutex: Send, Sync);
static_assertions::assert_impl_all!(ExclusiveToken<'static>: Send, Sync);
static_assertions::assert_impl_all!(SharedToken<'static>: Send, Sync);

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use super::*;
    use crate::sched::spawn;

    #[test]
    fn test_exclusive_excludes_everyone() {
        let lock = SharedMutex::new();

        let token = lock.try_lock().unwrap();
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());
        assert!(lock.try_lock_shared().is_none());

        token.release();
        assert!(!lock.is_locked());
        assert!(lock.try_lock_shared().is_some());
    }

    #[test]
    fn test_readers_share() {
        let lock = SharedMutex::new();

        let first = lock.try_lock_shared().unwrap();
        let second = lock.try_lock_shared().unwrap();

        assert!(lock.is_locked_shared());
        assert!(!lock.is_locked());
        assert!(lock.try_lock().is_none());

        first.release();
        assert!(lock.try_lock().is_none());

        second.release();
        assert!(!lock.is_locked_shared());
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_token_drop_releases() {
        let lock = SharedMutex::new();

        {
            let _token = lock.try_lock().unwrap();
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());

        {
            let _token = lock.try_lock_shared().unwrap();
            assert!(lock.is_locked_shared());
        }
        assert!(!lock.is_locked_shared());
    }

    #[test]
    #[should_panic]
    fn test_unlock_shared_unheld_panics() {
        let lock = SharedMutex::new();

        lock.unlock_shared();
    }

    #[test]
    fn test_writer_waits_for_all_readers() {
        let lock = Arc::new(SharedMutex::new());
        let wrote = Arc::new(AtomicBool::new(false));

        let first = lock.try_lock_shared().unwrap();
        let second = lock.try_lock_shared().unwrap();

        let writer = {
            let lock = lock.clone();
            let wrote = wrote.clone();
            spawn(async move {
                let token = lock.lock().await;
                wrote.store(true, Ordering::Release);
                token.release();
            })
        };
        writer.start().unwrap();

        // The writer holds the admission lock while waiting, so no new reader can join past it.
        assert!(!wrote.load(Ordering::Acquire));
        assert!(lock.try_lock_shared().is_none());

        first.release();
        assert!(!wrote.load(Ordering::Acquire));

        // The last reader out hands the data to the writer, which runs inline here.
        second.release();
        assert!(wrote.load(Ordering::Acquire));

        writer.get().unwrap();
        assert!(lock.try_lock_shared().is_some());
    }

    #[test]
    fn test_reader_waits_for_writer() {
        let lock = Arc::new(SharedMutex::new());
        let read = Arc::new(AtomicBool::new(false));

        let token = lock.try_lock().unwrap();

        let reader = {
            let lock = lock.clone();
            let read = read.clone();
            spawn(async move {
                let token = lock.lock_shared().await;
                read.store(true, Ordering::Release);
                token.release();
            })
        };
        reader.start().unwrap();

        assert!(!read.load(Ordering::Acquire));

        token.release();
        assert!(read.load(Ordering::Acquire));

        reader.get().unwrap();
    }

    #[test]
    fn test_async_shared_hold() {
        let lock = Arc::new(SharedMutex::new());

        let fut = {
            let lock = lock.clone();
            spawn(async move {
                let token = lock.lock_shared().await;
                assert!(lock.is_locked_shared());
                token.release();
            })
        };

        fut.get().unwrap();
        assert!(!lock.is_locked_shared());
    }
}

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot_core::{DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN, park, unpark_one};

// The unlocked state must be zero so that a zero-filled block starts with every slot unlocked.
const UNLOCKED: u8 = 0;
const LOCKED: u8 = 1;
const CONTENDED: u8 = 2;

/// A lock over one slot of a reserved table, stored as a single byte inside the table's block.
///
/// The lock never spins. Contended acquirers park on the address of the lock word and are
/// unparked one at a time when the holder releases it. Because waiters are keyed by address,
/// no waiter state lives in the block itself and a zero-filled byte is a valid unlocked lock.
///
/// The lock does not own the data it protects. Callers pair it with the slot's vector.
#[derive(Debug)]
#[repr(transparent)]
pub(crate) struct SlotLock {
    state: AtomicU8,
}

impl SlotLock {
    #[cfg(test)]
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNLOCKED),
        }
    }

    /// Acquires the lock, parking the current thread until it becomes available.
    ///
    /// The lock is released when the returned guard is dropped.
    #[inline]
    pub(crate) fn lock(&self) -> SlotLockGuard<'_> {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_slow();
        }

        SlotLockGuard { lock: self }
    }

    #[cold]
    #[cfg_attr(test, mutants::skip)] // Mutations turn contention into hangs.
    fn lock_slow(&self) {
        loop {
            let state = self.state.load(Ordering::Relaxed);

            if state == UNLOCKED {
                if self
                    .state
                    .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }

            // Announce that someone is waiting so the holder takes the slow unlock path.
            if state == LOCKED
                && self
                    .state
                    .compare_exchange(LOCKED, CONTENDED, Ordering::Relaxed, Ordering::Relaxed)
                    .is_err()
            {
                continue;
            }

            let addr = self.address();
            let validate = || self.state.load(Ordering::Relaxed) == CONTENDED;

            // SAFETY: We park on the address of our own state atomic, which outlives the call.
            // The validation closure only reads that atomic and does not call into parking_lot.
            unsafe {
                park(addr, validate, || {}, |_, _| {}, DEFAULT_PARK_TOKEN, None);
            }

            // We were woken by an unlock, but others may still be parked. Acquire as CONTENDED
            // so that our own unlock wakes the next waiter.
            if self
                .state
                .compare_exchange(UNLOCKED, CONTENDED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    #[inline]
    fn unlock(&self) {
        if self
            .state
            .compare_exchange(LOCKED, UNLOCKED, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }

        self.unlock_slow();
    }

    #[cold]
    fn unlock_slow(&self) {
        self.state.store(UNLOCKED, Ordering::Release);

        // SAFETY: We unpark a thread waiting on the address of our own state atomic.
        unsafe {
            unpark_one(self.address(), |_| DEFAULT_UNPARK_TOKEN);
        }
    }

    fn address(&self) -> usize {
        self.state.as_ptr().addr()
    }

    #[cfg(test)]
    fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }
}

/// Holds a [`SlotLock`] until dropped, releasing it on every exit path.
#[derive(Debug)]
#[must_use = "the slot is unlocked as soon as the guard is dropped"]
pub(crate) struct SlotLockGuard<'a> {
    lock: &'a SlotLock,
}

impl Drop for SlotLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::cell::UnsafeCell;
    use std::mem;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn zeroed_lock_is_unlocked() {
        // SAFETY: SlotLock is a transparent wrapper over AtomicU8, for which zero is valid.
        let lock: SlotLock = unsafe { mem::zeroed() };

        assert!(!lock.is_locked());
        let guard = lock.lock();
        assert!(lock.is_locked());
        drop(guard);
        assert!(!lock.is_locked());
    }

    #[test]
    fn guard_releases_on_panic() {
        let lock = SlotLock::new();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = lock.lock();
            panic!("intentional panic while holding the slot lock");
        }));

        assert!(result.is_err());
        assert!(!lock.is_locked());
    }

    struct Counter {
        lock: SlotLock,
        value: UnsafeCell<u64>,
    }

    // SAFETY: Access to `value` is guarded by `lock`.
    unsafe impl Sync for Counter {}

    #[test]
    #[cfg_attr(miri, ignore)] // Too slow under Miri.
    fn contention_is_serialized() {
        let counter = Arc::new(Counter {
            lock: SlotLock::new(),
            value: UnsafeCell::new(0),
        });

        let handles = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = counter.lock.lock();
                        // SAFETY: We hold the lock that guards the value.
                        unsafe {
                            *counter.value.get() += 1;
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        let _guard = counter.lock.lock();
        // SAFETY: We hold the lock that guards the value.
        assert_eq!(unsafe { *counter.value.get() }, 8000);
    }
}

//! Counting semaphore that works across processes sharing its memory.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;
use std::io;
use std::time::Instant;

use crate::futex::{futex_wait, futex_wake};

/// Largest value a semaphore can hold.
pub const SEMAPHORE_MAX_VALUE: u32 = i32::MAX as u32;

/// A futex-backed counting semaphore placed in shared memory.
///
/// `count` is the futex word. `waiters` lets `post` skip the wake syscall
/// when nobody sleeps.
#[repr(C)]
pub struct ShmSemaphore {
    count: AtomicU32,
    waiters: AtomicU32,
}

#[cfg(not(feature = "loom"))]
static_assertions::const_assert_eq!(core::mem::size_of::<ShmSemaphore>(), 8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreError {
    /// `post` would exceed [`SEMAPHORE_MAX_VALUE`].
    Overflow,
}

impl fmt::Display for SemaphoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overflow => write!(f, "semaphore value would exceed {SEMAPHORE_MAX_VALUE}"),
        }
    }
}

impl std::error::Error for SemaphoreError {}

/// Result of a timed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreWait {
    Acquired,
    TimedOut,
}

impl ShmSemaphore {
    pub const fn new(initial: u32) -> Self {
        Self {
            count: AtomicU32::new(initial),
            waiters: AtomicU32::new(0),
        }
    }

    /// Reset in place.
    ///
    /// # Safety
    ///
    /// No process may be using the semaphore.
    pub unsafe fn init(this: *mut Self, initial: u32) {
        unsafe { core::ptr::write(this, Self::new(initial)) };
    }

    /// Increment the value and wake one waiter.
    pub fn post(&self) -> Result<(), SemaphoreError> {
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            if current >= SEMAPHORE_MAX_VALUE {
                return Err(SemaphoreError::Overflow);
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        // SeqCst pairs with the waiter's increment of `waiters` before it
        // re-reads `count`: either it sees our increment or we see it waiting.
        if self.waiters.load(Ordering::SeqCst) > 0 {
            futex_wake(&self.count, 1);
        }
        Ok(())
    }

    /// Decrement if the value is positive. Never blocks.
    pub fn try_wait(&self) -> bool {
        let mut current = self.count.load(Ordering::Relaxed);
        while current > 0 {
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Block until the value can be decremented.
    pub fn wait(&self) -> io::Result<()> {
        loop {
            if self.try_wait() {
                return Ok(());
            }
            self.waiters.fetch_add(1, Ordering::SeqCst);
            let result = futex_wait(&self.count, 0, None);
            self.waiters.fetch_sub(1, Ordering::SeqCst);
            result?;
        }
    }

    /// Block until the value can be decremented or `timeout` elapses.
    pub fn timed_wait(&self, timeout: Duration) -> io::Result<SemaphoreWait> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if self.try_wait() {
                return Ok(SemaphoreWait::Acquired);
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(SemaphoreWait::TimedOut);
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            self.waiters.fetch_add(1, Ordering::SeqCst);
            let result = futex_wait(&self.count, 0, remaining);
            self.waiters.fetch_sub(1, Ordering::SeqCst);
            match result {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    // A post may have landed right at the deadline.
                    return Ok(if self.try_wait() {
                        SemaphoreWait::Acquired
                    } else {
                        SemaphoreWait::TimedOut
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[inline]
    pub fn value(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ShmSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmSemaphore")
            .field("value", &self.value())
            .field("waiters", &self.waiters.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::vec::Vec;

    #[test]
    fn post_then_wait_does_not_block() {
        let sem = ShmSemaphore::new(0);
        sem.post().unwrap();
        sem.post().unwrap();
        assert_eq!(sem.value(), 2);
        sem.wait().unwrap();
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
    }

    #[test]
    fn timed_wait_reports_timeout() {
        let sem = ShmSemaphore::new(0);
        let start = Instant::now();
        let outcome = sem.timed_wait(Duration::from_millis(20)).unwrap();
        assert_eq!(outcome, SemaphoreWait::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn post_overflow_is_an_error() {
        let sem = ShmSemaphore::new(SEMAPHORE_MAX_VALUE);
        assert_eq!(sem.post(), Err(SemaphoreError::Overflow));
    }

    #[test]
    fn post_wakes_blocked_waiter() {
        let sem = Arc::new(ShmSemaphore::new(0));
        let waiter = {
            let sem = sem.clone();
            std::thread::spawn(move || sem.timed_wait(Duration::from_secs(5)).unwrap())
        };
        std::thread::sleep(Duration::from_millis(10));
        sem.post().unwrap();
        assert_eq!(waiter.join().unwrap(), SemaphoreWait::Acquired);
        assert_eq!(sem.value(), 0);
    }

    #[test]
    fn every_post_is_consumed_exactly_once() {
        const POSTS: u32 = 2_000;
        let sem = Arc::new(ShmSemaphore::new(0));
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let sem = sem.clone();
                std::thread::spawn(move || {
                    let mut taken = 0u32;
                    while sem.timed_wait(Duration::from_millis(200)).unwrap() == SemaphoreWait::Acquired {
                        taken += 1;
                    }
                    taken
                })
            })
            .collect();
        for _ in 0..POSTS {
            sem.post().unwrap();
        }
        let total: u32 = waiters.into_iter().map(|w| w.join().unwrap()).sum();
        assert_eq!(total, POSTS);
    }
}

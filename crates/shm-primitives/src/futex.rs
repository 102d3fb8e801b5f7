//! Futex wait/wake on 32-bit words in shared memory.
//!
//! The words may live in a `MAP_SHARED` mapping used by several processes, so
//! the non-private futex operations are used. Other platforms fall back to
//! polling with short sleeps.

use core::sync::atomic::AtomicU32;
use core::time::Duration;
use std::io;

/// Block while `*word == expected`, until woken or `timeout` elapses.
///
/// Returns `Ok(())` on wake-up, on a value mismatch, and on signal
/// interruption (callers re-check their condition in a loop), and
/// `ErrorKind::TimedOut` when the timeout expires.
#[cfg(target_os = "linux")]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> io::Result<()> {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(core::ptr::null(), |t| t as *const libc::timespec);

    // SAFETY: word is a valid, aligned u32 for the duration of the call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            core::ptr::null::<u32>(),
            0u32,
        )
    };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(()),
        Some(libc::ETIMEDOUT) => Err(io::Error::from(io::ErrorKind::TimedOut)),
        _ => Err(err),
    }
}

/// Wake up to `count` waiters blocked on `word`. Returns how many woke.
#[cfg(target_os = "linux")]
pub fn futex_wake(word: &AtomicU32, count: u32) -> usize {
    let count = count.min(i32::MAX as u32);
    // SAFETY: word is a valid, aligned u32 for the duration of the call.
    let rc = unsafe { libc::syscall(libc::SYS_futex, word.as_ptr(), libc::FUTEX_WAKE, count) };
    if rc < 0 { 0 } else { rc as usize }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> io::Result<()> {
    use core::sync::atomic::Ordering;
    use std::time::Instant;

    const POLL: Duration = Duration::from_micros(200);
    let deadline = timeout.map(|d| Instant::now() + d);
    while word.load(Ordering::Acquire) == expected {
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::from(io::ErrorKind::TimedOut));
            }
            std::thread::sleep(POLL.min(deadline - now));
        } else {
            std::thread::sleep(POLL);
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_word: &AtomicU32, _count: u32) -> usize {
    0
}

/// Wake one waiter.
#[inline]
pub fn futex_signal(word: &AtomicU32) {
    futex_wake(word, 1);
}

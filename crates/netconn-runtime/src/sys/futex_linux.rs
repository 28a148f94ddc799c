//! Linux futex-based semaphore
//!
//! Futex word layout:
//! - bits 0..31 = available count
//! - bit 31     = closed
//!
//! A waiter takes a count with a CAS. With no count left it sleeps in
//! FUTEX_WAIT on the word it observed, so a `signal()` or `close()`
//! that changes the word in between makes the wait return at once.

use super::{Semaphore, WaitResult};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

const CLOSED_BIT: u32 = 1 << 31;
const COUNT_MASK: u32 = CLOSED_BIT - 1;

pub struct FutexSemaphore {
    word: AtomicU32,

    /// Threads inside FUTEX_WAIT (lets `signal` skip the syscall)
    waiters: AtomicU32,
}

impl FutexSemaphore {
    pub fn new(initial: u32) -> Self {
        Self {
            word: AtomicU32::new(initial & COUNT_MASK),
            waiters: AtomicU32::new(0),
        }
    }

    fn futex_wait(&self, expected: u32, timeout: Option<Duration>) {
        let timespec = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let timespec_ptr = match &timespec {
            Some(ts) => ts as *const libc::timespec,
            None => std::ptr::null(),
        };
        // ETIMEDOUT, EAGAIN and EINTR all send the caller back to re-check the word
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.word.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected,
                timespec_ptr,
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    fn futex_wake(&self, n: i32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.word.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                n,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}

impl Default for FutexSemaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Semaphore for FutexSemaphore {
    fn wait(&self, timeout: Option<Duration>) -> WaitResult {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.try_wait() {
                return WaitResult::Signalled;
            }
            let current = self.word.load(Ordering::SeqCst);
            if current & COUNT_MASK != 0 {
                continue;
            }
            if current & CLOSED_BIT != 0 {
                return WaitResult::Closed;
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitResult::TimedOut;
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            self.waiters.fetch_add(1, Ordering::SeqCst);
            self.futex_wait(current, remaining);
            self.waiters.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn try_wait(&self) -> bool {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            if current & COUNT_MASK == 0 {
                return false;
            }
            match self.word.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn signal(&self) {
        self.word.fetch_add(1, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            self.futex_wake(1);
        }
    }

    fn close(&self) {
        self.word.fetch_or(CLOSED_BIT, Ordering::SeqCst);
        self.futex_wake(i32::MAX);
    }

    fn is_closed(&self) -> bool {
        self.word.load(Ordering::Acquire) & CLOSED_BIT != 0
    }
}

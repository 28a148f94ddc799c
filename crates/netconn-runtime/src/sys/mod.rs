//! Blocking primitives
//!
//! Counting semaphores with a close state, and the bounded mailbox
//! built from them. Application threads block only on these.

use std::time::Duration;

pub mod mbox;

/// Why `Semaphore::wait` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// A count was taken
    Signalled,
    TimedOut,
    /// The semaphore was closed and no count is left
    Closed,
}

/// Counting semaphore that can be closed.
///
/// Counts signalled before `close()` are still handed out; once they
/// run out every waiter returns `Closed` instead of blocking.
pub trait Semaphore: Send + Sync {
    /// Take one count, blocking up to `timeout` (`None` = forever).
    fn wait(&self, timeout: Option<Duration>) -> WaitResult;

    /// Take one count if available.
    fn try_wait(&self) -> bool;

    /// Add one count, waking one waiter.
    fn signal(&self);

    /// Wake every waiter; later waits fail once the count is used up.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

// The Condvar implementation is always built so it can be tested on Linux.
mod fallback;
pub use fallback::CondvarSemaphore;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexSemaphore as PlatformSemaphore;
    } else {
        pub use fallback::CondvarSemaphore as PlatformSemaphore;
    }
}

/// Create a platform-appropriate semaphore with `initial` counts.
pub fn new_semaphore(initial: u32) -> Box<dyn Semaphore> {
    Box::new(PlatformSemaphore::new(initial))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn check_timeout(sem: &dyn Semaphore) {
        let start = Instant::now();
        assert_eq!(sem.wait(Some(Duration::from_millis(50))), WaitResult::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    fn check_signal_wakes(sem: Arc<dyn Semaphore>) {
        let sem2 = Arc::clone(&sem);
        let handle = thread::spawn(move || sem2.wait(Some(Duration::from_secs(10))));
        thread::sleep(Duration::from_millis(50));
        sem.signal();
        assert_eq!(handle.join().unwrap(), WaitResult::Signalled);
    }

    fn check_close(sem: Arc<dyn Semaphore>) {
        sem.signal();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let sem = Arc::clone(&sem);
                thread::spawn(move || sem.wait(None))
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        sem.close();
        let mut results: Vec<_> = waiters.into_iter().map(|h| h.join().unwrap()).collect();
        results.sort_by_key(|r| *r as u8);
        // the count signalled before close is still handed out once
        assert_eq!(
            results,
            vec![WaitResult::Signalled, WaitResult::Closed, WaitResult::Closed]
        );
        assert!(sem.is_closed());
        assert!(!sem.try_wait());
    }

    #[test]
    fn test_platform_semaphore() {
        let sem = PlatformSemaphore::new(1);
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        check_timeout(&sem);
        check_signal_wakes(Arc::new(PlatformSemaphore::new(0)));
        check_close(Arc::new(PlatformSemaphore::new(0)));
    }

    #[test]
    fn test_condvar_semaphore() {
        let sem = CondvarSemaphore::new(2);
        assert!(sem.try_wait());
        assert_eq!(sem.wait(None), WaitResult::Signalled);
        check_timeout(&sem);
        check_signal_wakes(Arc::new(CondvarSemaphore::new(0)));
        check_close(Arc::new(CondvarSemaphore::new(0)));
    }

    #[test]
    fn test_counts_accumulate() {
        let sem = new_semaphore(0);
        for _ in 0..5 {
            sem.signal();
        }
        for _ in 0..5 {
            assert_eq!(sem.wait(Some(Duration::from_millis(10))), WaitResult::Signalled);
        }
        assert!(!sem.try_wait());
    }
}

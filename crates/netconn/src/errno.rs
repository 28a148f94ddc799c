//! Per-thread error number of the socket calls.
//!
//! Every socket call stores its outcome here (0 on success) in
//! addition to returning it, for callers written against the
//! `errno` convention.

use std::cell::Cell;

thread_local! {
    static ERRNO: Cell<i32> = const { Cell::new(0) };
}

/// Error number of the last socket call made by this thread.
pub fn errno() -> i32 {
    ERRNO.with(Cell::get)
}

pub fn set_errno(e: i32) {
    ERRNO.with(|c| c.set(e));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_errno_is_per_thread() {
        set_errno(libc::EBADF);
        let other = thread::spawn(|| {
            assert_eq!(errno(), 0);
            set_errno(libc::EINVAL);
            errno()
        })
        .join()
        .unwrap();
        assert_eq!(other, libc::EINVAL);
        assert_eq!(errno(), libc::EBADF);
        set_errno(0);
    }
}

//! Fallback semaphore using std::sync::Condvar
//!
//! Used on platforms without futex support.

use super::{Semaphore, WaitResult};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct State {
    count: u32,
    closed: bool,
}

pub struct CondvarSemaphore {
    state: Mutex<State>,
    condvar: Condvar,
}

impl CondvarSemaphore {
    pub fn new(initial: u32) -> Self {
        Self {
            state: Mutex::new(State {
                count: initial,
                closed: false,
            }),
            condvar: Condvar::new(),
        }
    }
}

impl Default for CondvarSemaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Semaphore for CondvarSemaphore {
    fn wait(&self, timeout: Option<Duration>) -> WaitResult {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if guard.count > 0 {
                guard.count -= 1;
                return WaitResult::Signalled;
            }
            if guard.closed {
                return WaitResult::Closed;
            }
            guard = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitResult::TimedOut;
                    }
                    self.condvar
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
                None => self.condvar.wait(guard).unwrap_or_else(|e| e.into_inner()),
            };
        }
    }

    fn try_wait(&self) -> bool {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if guard.count > 0 {
            guard.count -= 1;
            true
        } else {
            false
        }
    }

    fn signal(&self) {
        {
            let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
            guard.count += 1;
        }
        self.condvar.notify_one();
    }

    fn close(&self) {
        {
            let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
            guard.closed = true;
        }
        self.condvar.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed
    }
}

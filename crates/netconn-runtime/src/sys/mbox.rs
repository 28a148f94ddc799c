//! Bounded mailbox
//!
//! An `ArrayQueue` guarded by two semaphores: `items` counts queued
//! messages, `space` counts free slots. A sender reserves a slot
//! before pushing and a receiver takes an item before popping, so the
//! queue itself never reports full or empty to a caller that got past
//! its semaphore.
//!
//! `close()` stops new posts and wakes every blocked thread. Messages
//! already queued stay fetchable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

use super::{PlatformSemaphore, Semaphore, WaitResult};

/// Why a fetch returned nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchError {
    Timeout,
    Closed,
}

pub struct Mbox<T> {
    queue: ArrayQueue<T>,
    items: PlatformSemaphore,
    space: PlatformSemaphore,
    closed: AtomicBool,
}

impl<T> Mbox<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: ArrayQueue::new(capacity),
            items: PlatformSemaphore::new(0),
            space: PlatformSemaphore::new(capacity as u32),
            closed: AtomicBool::new(false),
        }
    }

    /// Post, blocking while the mailbox is full. Gives the message back
    /// if the mailbox is (or gets) closed.
    pub fn post(&self, msg: T) -> Result<(), T> {
        if self.is_closed() {
            return Err(msg);
        }
        match self.space.wait(None) {
            WaitResult::Signalled => self.push_reserved(msg),
            _ => Err(msg),
        }
    }

    /// Post without blocking. Gives the message back when full or closed.
    pub fn trypost(&self, msg: T) -> Result<(), T> {
        if self.is_closed() || !self.space.try_wait() {
            return Err(msg);
        }
        self.push_reserved(msg)
    }

    fn push_reserved(&self, msg: T) -> Result<(), T> {
        match self.queue.push(msg) {
            Ok(()) => {
                self.items.signal();
                Ok(())
            }
            Err(msg) => {
                self.space.signal();
                Err(msg)
            }
        }
    }

    /// Fetch, blocking up to `timeout` (`None` = forever).
    pub fn fetch(&self, timeout: Option<Duration>) -> Result<T, FetchError> {
        loop {
            match self.items.wait(timeout) {
                WaitResult::Signalled => {
                    if let Some(msg) = self.queue.pop() {
                        self.space.signal();
                        return Ok(msg);
                    }
                }
                WaitResult::TimedOut => return Err(FetchError::Timeout),
                WaitResult::Closed => return Err(FetchError::Closed),
            }
        }
    }

    /// Fetch without blocking.
    pub fn tryfetch(&self) -> Option<T> {
        if !self.items.try_wait() {
            return None;
        }
        let msg = self.queue.pop()?;
        self.space.signal();
        Some(msg)
    }

    /// Refuse further posts and wake all waiters.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.items.close();
        self.space.close();
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

impl<T> std::fmt::Debug for Mbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mbox")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("closed", &self.is_closed())
            .finish()
    }
}

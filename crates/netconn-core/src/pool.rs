//! Fixed-capacity object pools
//!
//! A `MemPool` hands out small integer indices up to a fixed maximum.
//! Freed indices go on a LIFO stack and are reused first, fresh indices
//! are only taken when the stack is empty. Pools bound how many
//! connections and control blocks may exist at once; exhaustion is an
//! ordinary `NetError::Mem`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{NetError, NetResult};

/// Usage counters of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub used: u32,
    pub max: u32,
    pub high_water: u32,
    pub failures: u32,
}

pub struct MemPool {
    name: &'static str,

    /// LIFO stack of released indices
    free_stack: Mutex<Vec<u32>>,

    /// Next never-used index
    next_fresh: AtomicU32,

    max: u32,
    used: AtomicU32,
    high_water: AtomicU32,
    failures: AtomicU32,
}

impl MemPool {
    pub fn new(name: &'static str, max: usize) -> Self {
        Self {
            name,
            free_stack: Mutex::new(Vec::with_capacity(max)),
            next_fresh: AtomicU32::new(0),
            max: max as u32,
            used: AtomicU32::new(0),
            high_water: AtomicU32::new(0),
            failures: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Take an index, or `Mem` when the pool is exhausted.
    pub fn alloc(&self) -> NetResult<u32> {
        let recycled = self
            .free_stack
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        let index = match recycled {
            Some(index) => index,
            None => loop {
                let current = self.next_fresh.load(Ordering::Acquire);
                if current >= self.max {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(NetError::Mem);
                }
                if self
                    .next_fresh
                    .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break current;
                }
            },
        };
        let used = self.used.fetch_add(1, Ordering::Relaxed) + 1;
        self.high_water.fetch_max(used, Ordering::Relaxed);
        Ok(index)
    }

    /// Return an index. Out-of-range indices are ignored.
    pub fn free(&self, index: u32) {
        if index >= self.max {
            return;
        }
        self.free_stack
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(index);
        self.used.fetch_sub(1, Ordering::Relaxed);
    }

    /// Allocate an index owned by a guard that frees it on drop.
    pub fn alloc_slot(self: &Arc<Self>) -> NetResult<PoolSlot> {
        let index = self.alloc()?;
        Ok(PoolSlot {
            pool: Arc::clone(self),
            index,
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            used: self.used.load(Ordering::Relaxed),
            max: self.max,
            high_water: self.high_water.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for MemPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemPool")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

/// An allocated pool index, released when dropped.
pub struct PoolSlot {
    pool: Arc<MemPool>,
    index: u32,
}

impl PoolSlot {
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.pool.free(self.index);
    }
}

impl std::fmt::Debug for PoolSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.pool.name, self.index)
    }
}

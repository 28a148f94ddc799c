//! `select()` and `poll()` over socket descriptors.
//!
//! A blocked caller links a `Waiter` into the table's waiter list and
//! bumps `select_waiting` on every descriptor it watches. Connection
//! events on a watched descriptor walk the list and signal each waiter
//! whose interest matches, at most once per waiter.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use netconn_core::error::Errno;
use netconn_core::ktrace;
use netconn_runtime::sys::{PlatformSemaphore, Semaphore, WaitResult};
use nix::poll::PollFlags;

use crate::errno::set_errno;
use crate::socket::{Fd, SocketRef, Sockets};

/// Snapshot of a descriptor's event state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub read: bool,
    pub write: bool,
    pub except: bool,
}

/// Set of descriptors for `select`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FdSet {
    fds: BTreeSet<Fd>,
}

impl FdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fd: Fd) {
        self.fds.insert(fd);
    }

    pub fn remove(&mut self, fd: Fd) {
        self.fds.remove(&fd);
    }

    pub fn contains(&self, fd: Fd) -> bool {
        self.fds.contains(&fd)
    }

    pub fn clear(&mut self) {
        self.fds.clear();
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Fd> + '_ {
        self.fds.iter().copied()
    }
}

impl FromIterator<Fd> for FdSet {
    fn from_iter<I: IntoIterator<Item = Fd>>(iter: I) -> Self {
        FdSet {
            fds: iter.into_iter().collect(),
        }
    }
}

/// One entry of a `poll` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollFd {
    /// Negative descriptors are skipped
    pub fd: Fd,
    pub events: PollFlags,
    pub revents: PollFlags,
}

impl PollFd {
    pub fn new(fd: Fd, events: PollFlags) -> Self {
        PollFd {
            fd,
            events,
            revents: PollFlags::empty(),
        }
    }
}

const POLL_READ: PollFlags = PollFlags::POLLIN.union(PollFlags::POLLRDNORM);
const POLL_WRITE: PollFlags = PollFlags::POLLOUT.union(PollFlags::POLLWRNORM);

/// What a waiter is blocked on.
#[derive(Debug, Clone, Default)]
struct SelectSets {
    read: FdSet,
    write: FdSet,
    except: FdSet,
}

impl SelectSets {
    fn watches(&self, fd: Fd) -> bool {
        self.read.contains(fd) || self.write.contains(fd) || self.except.contains(fd)
    }
}

enum Interest {
    Select(SelectSets),
    Poll(Vec<(Fd, PollFlags)>),
}

impl Interest {
    fn wants(&self, fd: Fd, ready: Readiness) -> bool {
        match self {
            Interest::Select(sets) => {
                (ready.read && sets.read.contains(fd))
                    || (ready.write && sets.write.contains(fd))
                    || (ready.except && sets.except.contains(fd))
            }
            Interest::Poll(fds) => fds.iter().any(|&(f, events)| {
                f == fd
                    && ((ready.read && events.intersects(POLL_READ))
                        || (ready.write && events.intersects(POLL_WRITE))
                        || ready.except)
            }),
        }
    }
}

pub(crate) struct Waiter {
    interest: Interest,
    sem: PlatformSemaphore,
    signalled: AtomicBool,
}

impl Waiter {
    fn new(interest: Interest) -> Arc<Self> {
        Arc::new(Waiter {
            interest,
            sem: PlatformSemaphore::new(0),
            signalled: AtomicBool::new(false),
        })
    }

    fn wake(&self) {
        if !self.signalled.swap(true, Ordering::AcqRel) {
            self.sem.signal();
        }
    }

    /// Block until woken; true on timeout.
    fn wait(&self, timeout: Option<Duration>) -> bool {
        self.sem.wait(timeout) == WaitResult::TimedOut
    }
}

struct WaiterList {
    waiters: Vec<Arc<Waiter>>,
    /// Bumped on every link/unlink
    ctr: u64,
}

/// Callers currently blocked in `select`/`poll`.
pub(crate) struct SelectList {
    inner: Mutex<WaiterList>,
}

impl SelectList {
    pub(crate) fn new() -> Self {
        SelectList {
            inner: Mutex::new(WaiterList {
                waiters: Vec::new(),
                ctr: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WaiterList> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn link(&self, waiter: &Arc<Waiter>) {
        let mut list = self.lock();
        list.waiters.push(Arc::clone(waiter));
        list.ctr = list.ctr.wrapping_add(1);
    }

    fn unlink(&self, waiter: &Arc<Waiter>) {
        let mut list = self.lock();
        list.waiters.retain(|w| !Arc::ptr_eq(w, waiter));
        list.ctr = list.ctr.wrapping_add(1);
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Signal every waiter interested in `fd` given `ready`.
    ///
    /// The list lock is dropped while a waiter is examined; the walk
    /// starts over whenever the list changed meanwhile.
    pub(crate) fn check_waiters(&self, fd: Fd, ready: Readiness) {
        'again: loop {
            let mut list = self.lock();
            let ctr = list.ctr;
            let mut i = 0;
            loop {
                let Some(waiter) = list.waiters.get(i).cloned() else {
                    return;
                };
                drop(list);
                if !waiter.signalled.load(Ordering::Acquire) && waiter.interest.wants(fd, ready) {
                    ktrace!("socket {}: waking waiter", fd);
                    waiter.wake();
                }
                i += 1;
                list = self.lock();
                if list.ctr != ctr {
                    continue 'again;
                }
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Scan {
    Clear,
    IncWait,
    DecWait,
}

impl Sockets {
    // ── select ──

    /// Wait until a descriptor below `maxfdp1` in one of the sets is
    /// readable, writable or has an error, or `timeout` passes (`None`
    /// waits forever, zero only checks). The sets are overwritten with
    /// the ready descriptors; returns how many there are.
    pub fn select(
        &self,
        maxfdp1: Fd,
        readset: Option<&mut FdSet>,
        writeset: Option<&mut FdSet>,
        exceptset: Option<&mut FdSet>,
        timeout: Option<Duration>,
    ) -> Result<usize, Errno> {
        let want = SelectSets {
            read: readset.as_deref().cloned().unwrap_or_default(),
            write: writeset.as_deref().cloned().unwrap_or_default(),
            except: exceptset.as_deref().cloned().unwrap_or_default(),
        };
        match self.select_sets(maxfdp1, want, timeout) {
            Ok((n, out)) => {
                if let Some(set) = readset {
                    *set = out.read;
                }
                if let Some(set) = writeset {
                    *set = out.write;
                }
                if let Some(set) = exceptset {
                    *set = out.except;
                }
                set_errno(0);
                Ok(n)
            }
            Err(e) => {
                set_errno(e.0);
                Err(e)
            }
        }
    }

    fn select_sets(
        &self,
        maxfdp1: Fd,
        want: SelectSets,
        timeout: Option<Duration>,
    ) -> Result<(usize, SelectSets), Errno> {
        let first = self.table.fd_of(0);
        let limit = self.table.fd_of(self.tcpip.config().num_sockets);
        if maxfdp1 < 0 || maxfdp1 > limit {
            return Err(Errno::INVAL);
        }

        // hold every watched descriptor open for the whole call
        let refs = (first..maxfdp1)
            .filter(|&fd| want.watches(fd))
            .map(|fd| self.table.get(fd))
            .collect::<Result<Vec<_>, _>>()?;

        let (n, out) = self.selscan(&want, &refs);
        if n > 0 || timeout == Some(Duration::ZERO) {
            return Ok((n, out));
        }

        let waiter = Waiter::new(Interest::Select(want.clone()));
        self.table.select.link(&waiter);
        self.select_waiting(&refs, Scan::IncWait);

        // events may have arrived before we were on the list
        let (mut n, mut out) = self.selscan(&want, &refs);
        let mut timed_out = false;
        if n == 0 {
            timed_out = waiter.wait(timeout);
        }

        let closed = self.select_waiting(&refs, Scan::DecWait);
        self.table.select.unlink(&waiter);
        if closed {
            return Err(Errno::BADF);
        }
        if timed_out {
            return Ok((0, SelectSets::default()));
        }
        if n == 0 {
            (n, out) = self.selscan(&want, &refs);
        }
        Ok((n, out))
    }

    fn selscan(&self, want: &SelectSets, refs: &[SocketRef<'_>]) -> (usize, SelectSets) {
        let mut out = SelectSets::default();
        let mut n = 0;
        let slots = self.table.lock();
        for r in refs {
            let Some(slot) = slots.get(r.index()) else {
                continue;
            };
            let fd = self.table.fd_of(r.index());
            let ready = slot.readiness();
            if ready.read && want.read.contains(fd) {
                out.read.insert(fd);
                n += 1;
            }
            if ready.write && want.write.contains(fd) {
                out.write.insert(fd);
                n += 1;
            }
            if ready.except && want.except.contains(fd) {
                out.except.insert(fd);
                n += 1;
            }
        }
        (n, out)
    }

    /// Adjust `select_waiting` on every watched slot. Returns true if
    /// one of them was closed meanwhile.
    fn select_waiting(&self, refs: &[SocketRef<'_>], scan: Scan) -> bool {
        let mut closed = false;
        let mut slots = self.table.lock();
        for r in refs {
            if let Some(slot) = slots.get_mut(r.index()) {
                match scan {
                    Scan::IncWait => slot.select_waiting += 1,
                    Scan::DecWait => slot.select_waiting = slot.select_waiting.saturating_sub(1),
                    Scan::Clear => {}
                }
                closed |= slot.is_closing();
            }
        }
        closed
    }

    // ── poll ──

    /// Wait for events on `fds` (see `select` for `timeout`). Invalid
    /// descriptors report `POLLNVAL`; `POLLERR` is reported whether
    /// asked for or not. Returns the number of entries with events.
    pub fn poll(&self, fds: &mut [PollFd], timeout: Option<Duration>) -> Result<usize, Errno> {
        let refs: Vec<Option<SocketRef<'_>>> = fds
            .iter()
            .map(|pfd| {
                if pfd.fd < 0 {
                    None
                } else {
                    self.table.get(pfd.fd).ok()
                }
            })
            .collect();

        let mut nready = self.pollscan(fds, &refs, Scan::Clear);
        if nready == 0 && timeout != Some(Duration::ZERO) {
            let interest = fds.iter().map(|pfd| (pfd.fd, pfd.events)).collect();
            let waiter = Waiter::new(Interest::Poll(interest));
            self.table.select.link(&waiter);

            nready = self.pollscan(fds, &refs, Scan::IncWait);
            if nready == 0 {
                waiter.wait(timeout);
            }
            nready = self.pollscan(fds, &refs, Scan::DecWait);
            self.table.select.unlink(&waiter);
        }
        set_errno(0);
        Ok(nready)
    }

    fn pollscan(&self, fds: &mut [PollFd], refs: &[Option<SocketRef<'_>>], scan: Scan) -> usize {
        let mut nready = 0;
        let mut slots = self.table.lock();
        for (pfd, r) in fds.iter_mut().zip(refs) {
            if scan == Scan::Clear {
                pfd.revents = PollFlags::empty();
            }
            // a descriptor found invalid stays invalid for this call
            if pfd.fd >= 0 && !pfd.revents.contains(PollFlags::POLLNVAL) {
                match r.as_ref().and_then(|r| slots.get_mut(r.index())) {
                    Some(slot) => {
                        match scan {
                            Scan::IncWait => slot.select_waiting += 1,
                            Scan::DecWait => {
                                slot.select_waiting = slot.select_waiting.saturating_sub(1)
                            }
                            Scan::Clear => {}
                        }
                        if slot.is_closing() {
                            pfd.revents |= PollFlags::POLLNVAL;
                        } else {
                            let ready = slot.readiness();
                            if ready.read {
                                pfd.revents |= pfd.events & POLL_READ;
                            }
                            if ready.write {
                                pfd.revents |= pfd.events & POLL_WRITE;
                            }
                            if ready.except {
                                pfd.revents |= PollFlags::POLLERR;
                            }
                        }
                    }
                    None => pfd.revents |= PollFlags::POLLNVAL,
                }
            }
            if !pfd.revents.is_empty() {
                nready += 1;
            }
        }
        nready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn select_waiter(read: &[Fd]) -> Arc<Waiter> {
        Waiter::new(Interest::Select(SelectSets {
            read: read.iter().copied().collect(),
            ..SelectSets::default()
        }))
    }

    const READABLE: Readiness = Readiness {
        read: true,
        write: false,
        except: false,
    };

    #[test]
    fn test_fdset() {
        let mut set: FdSet = [3, 1, 2].into_iter().collect();
        assert_eq!(set.len(), 3);
        assert!(set.contains(2));
        set.remove(2);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 3]);
        set.clear();
        assert!(set.is_empty());
    }

    #[test]
    fn test_interest_matching() {
        let w = select_waiter(&[4]);
        assert!(w.interest.wants(4, READABLE));
        assert!(!w.interest.wants(5, READABLE));
        assert!(!w.interest.wants(4, Readiness::default()));

        let p = Interest::Poll(vec![(7, PollFlags::POLLOUT)]);
        assert!(!p.wants(7, READABLE));
        let err = Readiness {
            except: true,
            ..Readiness::default()
        };
        // errors wake a poller whatever it asked for
        assert!(p.wants(7, err));
    }

    #[test]
    fn test_waiter_signalled_at_most_once() {
        let list = SelectList::new();
        let w = select_waiter(&[1]);
        list.link(&w);
        for _ in 0..5 {
            list.check_waiters(1, READABLE);
        }
        assert!(!w.wait(Some(Duration::ZERO)));
        assert!(w.wait(Some(Duration::from_millis(10))));
        list.unlink(&w);
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_broadcast_survives_concurrent_unlink() {
        let list = Arc::new(SelectList::new());
        let waiters: Vec<_> = (0..8).map(|_| select_waiter(&[9])).collect();
        for w in &waiters {
            list.link(w);
        }

        let woken = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = waiters
            .iter()
            .map(|w| {
                let w = Arc::clone(w);
                let list = Arc::clone(&list);
                let woken = Arc::clone(&woken);
                thread::spawn(move || {
                    if !w.wait(Some(Duration::from_secs(5))) {
                        woken.fetch_add(1, Ordering::SeqCst);
                    }
                    list.unlink(&w);
                })
            })
            .collect();

        list.check_waiters(9, READABLE);
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 8);
        assert_eq!(list.len(), 0);
    }
}

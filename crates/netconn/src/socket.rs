//! Socket descriptors over netconn connections.
//!
//! A fixed table maps descriptors (`index + socket_offset`) to
//! connections. Every call takes a use count on its slot for its
//! duration; a descriptor closed while another thread is still inside
//! a call on it is freed by the last user. The table lock is never
//! held across a netconn call.

use std::net::{IpAddr, SocketAddr};
use std::ops::Deref;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use netconn_core::arena::Arena;
use netconn_core::error::{Errno, NetError};
use netconn_core::{kdebug, ktrace};
use netconn_runtime::{
    ConnEvent, ConnEvents, ConnInner, Netbuf, Netconn, NetconnType, RecvFlags, TcpipHandle,
    WriteFlags,
};
use tcpip_core::{IpFamily, Pbuf};

use crate::errno::set_errno;
use crate::select::{Readiness, SelectList};
use crate::sockopt::Membership;

/// Socket descriptor
pub type Fd = i32;

/// Most vectors one `sendmsg`/`recvmsg` takes.
pub const IOV_MAX: usize = 1024;

/// Largest datagram `sendto`/`sendmsg` accept.
const MAX_DATAGRAM: usize = 0xffff;

pub const MSG_PEEK: i32 = libc::MSG_PEEK;
pub const MSG_DONTWAIT: i32 = libc::MSG_DONTWAIT;
pub const MSG_TRUNC: i32 = libc::MSG_TRUNC;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        pub const MSG_MORE: i32 = libc::MSG_MORE;
    } else {
        pub const MSG_MORE: i32 = 0x10;
    }
}

// ── Per-descriptor state ──

/// Data fetched from the connection but not yet handed out.
pub(crate) enum Lastdata {
    Stream(Pbuf),
    Datagram(Netbuf),
}

impl Lastdata {
    fn len(&self) -> usize {
        match self {
            Lastdata::Stream(p) => p.tot_len(),
            Lastdata::Datagram(buf) => buf.len(),
        }
    }
}

pub(crate) struct Socket {
    pub(crate) conn: Netconn,
    lastdata: Mutex<Option<Lastdata>>,
    /// Errno of the last call (SO_ERROR)
    err: AtomicI32,
}

impl Socket {
    fn new(conn: Netconn) -> Self {
        Socket {
            conn,
            lastdata: Mutex::new(None),
            err: AtomicI32::new(0),
        }
    }

    fn lastdata(&self) -> MutexGuard<'_, Option<Lastdata>> {
        self.lastdata.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn has_lastdata(&self) -> bool {
        self.lastdata().is_some()
    }

    pub(crate) fn lastdata_len(&self) -> usize {
        self.lastdata().as_ref().map_or(0, Lastdata::len)
    }

    pub(crate) fn put_lastdata(&self, data: Lastdata) {
        *self.lastdata() = Some(data);
    }

    fn take_stream(&self) -> Option<Pbuf> {
        let mut last = self.lastdata();
        match last.take() {
            Some(Lastdata::Stream(p)) => Some(p),
            other => {
                *last = other;
                None
            }
        }
    }

    fn take_datagram(&self) -> Option<Netbuf> {
        let mut last = self.lastdata();
        match last.take() {
            Some(Lastdata::Datagram(buf)) => Some(buf),
            other => {
                *last = other;
                None
            }
        }
    }

    /// Read and clear the recorded errno.
    pub(crate) fn take_err(&self) -> i32 {
        self.err.swap(0, Ordering::AcqRel)
    }

    fn set_err(&self, e: i32) {
        self.err.store(e, Ordering::Release);
    }
}

/// One descriptor table entry.
pub(crate) struct Slot {
    pub(crate) sock: Arc<Socket>,
    pub(crate) rcvevent: i32,
    pub(crate) sendevent: bool,
    pub(crate) errevent: bool,
    /// Number of select/poll callers watching this descriptor
    pub(crate) select_waiting: u32,
    fd_used: u32,
    free_pending: bool,
}

impl Slot {
    fn new(conn: Netconn, sendevent: bool) -> Self {
        Slot {
            sock: Arc::new(Socket::new(conn)),
            rcvevent: 0,
            sendevent,
            errevent: false,
            select_waiting: 0,
            fd_used: 0,
            free_pending: false,
        }
    }

    /// Closed, waiting for the last user to leave.
    pub(crate) fn is_closing(&self) -> bool {
        self.free_pending
    }

    pub(crate) fn readiness(&self) -> Readiness {
        Readiness {
            read: self.rcvevent > 0 || self.sock.has_lastdata(),
            write: self.sendevent,
            except: self.errevent,
        }
    }
}

// ── Descriptor table ──

pub(crate) struct SocketTable {
    offset: Fd,
    slots: Mutex<Arena<Slot>>,
    pub(crate) select: SelectList,
    pub(crate) memberships: Mutex<Arena<Membership>>,
}

impl SocketTable {
    pub(crate) fn new(num_sockets: usize, offset: Fd, num_memberships: usize) -> Self {
        SocketTable {
            offset,
            slots: Mutex::new(Arena::new(num_sockets)),
            select: SelectList::new(),
            memberships: Mutex::new(Arena::new(num_memberships)),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Arena<Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn index_of(&self, fd: Fd) -> Option<usize> {
        fd.checked_sub(self.offset)
            .and_then(|i| usize::try_from(i).ok())
    }

    pub(crate) fn fd_of(&self, index: usize) -> Fd {
        self.offset + index as Fd
    }

    /// Install `conn` in the first free slot. Events that reached the
    /// connection before it had a slot are replayed.
    fn alloc(&self, conn: Netconn, accepted: bool) -> Result<usize, Slot> {
        let inner = Arc::clone(conn.inner());
        let sendevent = !conn.ty().is_tcp() || accepted;
        let index = self.lock().alloc(Slot::new(conn, sendevent))?;
        for _ in 0..inner.attach_socket(index as i32) {
            self.event(&inner, ConnEvent::RcvPlus, 0);
        }
        Ok(index)
    }

    /// Take a use count on the socket behind `fd`.
    pub(crate) fn get(&self, fd: Fd) -> Result<SocketRef<'_>, Errno> {
        let index = self.index_of(fd).ok_or(Errno::BADF)?;
        let mut slots = self.lock();
        match slots.get_mut(index) {
            Some(slot) if !slot.free_pending => {
                slot.fd_used += 1;
                Ok(SocketRef {
                    table: self,
                    index,
                    sock: Arc::clone(&slot.sock),
                })
            }
            _ => {
                ktrace!("socket {}: bad descriptor", fd);
                Err(Errno::BADF)
            }
        }
    }

    /// Release a use count, freeing the slot if a close is pending.
    fn done(&self, index: usize) {
        let freed = {
            let mut slots = self.lock();
            match slots.get_mut(index) {
                Some(slot) => {
                    slot.fd_used = slot.fd_used.saturating_sub(1);
                    if slot.fd_used == 0 && slot.free_pending {
                        slots.free(index)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if freed.is_some() {
            ktrace!("socket {}: freed", self.fd_of(index));
        }
    }

    fn mark_free(&self, index: usize) {
        if let Some(slot) = self.lock().get_mut(index) {
            slot.free_pending = true;
        }
    }

    /// Empty the table. The caller drops the slots outside the lock.
    pub(crate) fn drain(&self) -> Vec<Slot> {
        self.lock().drain_filter(|_| true)
    }

    pub(crate) fn open_count(&self) -> usize {
        self.lock().iter().filter(|(_, s)| !s.free_pending).count()
    }
}

impl ConnEvents for SocketTable {
    fn event(&self, conn: &ConnInner, evt: ConnEvent, _len: usize) {
        let index = match conn.socket() {
            Some(s) => s as usize,
            None => {
                if evt != ConnEvent::RcvPlus {
                    return;
                }
                match conn.note_early_rcvplus() {
                    Some(s) => s as usize,
                    None => return,
                }
            }
        };

        let ready = {
            let mut slots = self.lock();
            let Some(slot) = slots.get_mut(index) else {
                return;
            };
            if !std::ptr::eq(Arc::as_ptr(slot.sock.conn.inner()), conn) {
                return;
            }
            let notify = match evt {
                ConnEvent::RcvPlus => {
                    slot.rcvevent += 1;
                    slot.rcvevent <= 1
                }
                ConnEvent::RcvMinus => {
                    slot.rcvevent -= 1;
                    false
                }
                ConnEvent::SendPlus => !std::mem::replace(&mut slot.sendevent, true),
                ConnEvent::SendMinus => {
                    slot.sendevent = false;
                    false
                }
                ConnEvent::Error => {
                    slot.errevent = true;
                    true
                }
            };
            if !notify || slot.select_waiting == 0 {
                return;
            }
            slot.readiness()
        };
        self.select.check_waiters(self.fd_of(index), ready);
    }
}

/// A socket held with a use count, released on drop.
pub(crate) struct SocketRef<'a> {
    table: &'a SocketTable,
    index: usize,
    sock: Arc<Socket>,
}

impl SocketRef<'_> {
    pub(crate) fn index(&self) -> usize {
        self.index
    }
}

impl Deref for SocketRef<'_> {
    type Target = Socket;

    fn deref(&self) -> &Socket {
        &self.sock
    }
}

impl Drop for SocketRef<'_> {
    fn drop(&mut self) {
        self.table.done(self.index);
    }
}

// ── Addresses ──

/// IPv4-mapped IPv6 addresses are used as plain IPv4.
pub(crate) fn unmap(addr: SocketAddr) -> SocketAddr {
    if let SocketAddr::V6(a) = addr {
        if let Some(v4) = a.ip().to_ipv4_mapped() {
            return SocketAddr::new(IpAddr::V4(v4), a.port());
        }
    }
    addr
}

/// Present `addr` the way a socket of `family` reports it.
fn visible(family: IpFamily, addr: SocketAddr) -> SocketAddr {
    match (family, addr) {
        (IpFamily::V6, SocketAddr::V4(a)) => {
            SocketAddr::new(IpAddr::V6(a.ip().to_ipv6_mapped()), a.port())
        }
        _ => addr,
    }
}

fn check_addr(conn: &Netconn, addr: SocketAddr) -> Result<SocketAddr, Errno> {
    let matches = match conn.family() {
        IpFamily::V4 => addr.is_ipv4(),
        IpFamily::V6 => addr.is_ipv6(),
        IpFamily::Any => true,
    };
    if !matches {
        return Err(NetError::Val.into());
    }
    Ok(unmap(addr))
}

/// Result of `recvmsg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvMeta {
    /// Bytes copied into the vectors
    pub len: usize,
    /// Sender of a datagram
    pub addr: Option<SocketAddr>,
    /// The datagram was larger than the vectors (`MSG_TRUNC`)
    pub truncated: bool,
}

// ── Socket calls ──

/// BSD-style socket calls over one stack.
///
/// Cheap to clone; every clone shares the descriptor table.
#[derive(Clone)]
pub struct Sockets {
    pub(crate) tcpip: TcpipHandle,
    pub(crate) table: Arc<SocketTable>,
}

/// Record the outcome of a call that has no descriptor yet.
fn record<T>(res: Result<T, Errno>) -> Result<T, Errno> {
    set_errno(res.as_ref().err().map_or(0, |e| e.0));
    res
}

impl Sockets {
    pub(crate) fn new(tcpip: TcpipHandle) -> Self {
        let config = tcpip.config();
        let table = SocketTable::new(config.num_sockets, config.socket_offset, config.num_sockets);
        Sockets {
            tcpip,
            table: Arc::new(table),
        }
    }

    /// Number of open descriptors.
    pub fn open_count(&self) -> usize {
        self.table.open_count()
    }

    /// Run `f` on the socket behind `fd` and record its errno on the
    /// descriptor and the calling thread.
    pub(crate) fn with_socket<T>(
        &self,
        fd: Fd,
        f: impl FnOnce(&SocketRef<'_>) -> Result<T, Errno>,
    ) -> Result<T, Errno> {
        let sock = match self.table.get(fd) {
            Ok(sock) => sock,
            Err(e) => {
                set_errno(e.0);
                return Err(e);
            }
        };
        let res = f(&sock);
        let code = res.as_ref().err().map_or(0, |e| e.0);
        // calls still in progress leave SO_ERROR alone
        if !matches!(code, libc::EINPROGRESS | libc::EALREADY | libc::EWOULDBLOCK) {
            sock.set_err(code);
        }
        set_errno(code);
        res
    }

    fn events(&self) -> Arc<dyn ConnEvents> {
        Arc::clone(&self.table) as Arc<dyn ConnEvents>
    }

    /// Create a socket. `domain` is `AF_INET` or `AF_INET6`; `ty` is
    /// `SOCK_STREAM`, `SOCK_DGRAM` or `SOCK_RAW` (with `protocol` as
    /// the IP protocol number).
    pub fn socket(&self, domain: i32, ty: i32, protocol: i32) -> Result<Fd, Errno> {
        record(self.open(domain, ty, protocol))
    }

    fn open(&self, domain: i32, ty: i32, protocol: i32) -> Result<Fd, Errno> {
        let family = match domain {
            libc::AF_INET => IpFamily::V4,
            libc::AF_INET6 => IpFamily::V6,
            _ => return Err(Errno::AFNOSUPPORT),
        };
        let conn_ty = match ty {
            libc::SOCK_STREAM => NetconnType::Tcp,
            libc::SOCK_DGRAM if protocol == libc::IPPROTO_UDPLITE => NetconnType::UdpLite,
            libc::SOCK_DGRAM => NetconnType::Udp,
            libc::SOCK_RAW => NetconnType::Raw(u8::try_from(protocol).map_err(|_| Errno::INVAL)?),
            _ => return Err(Errno::INVAL),
        };

        let conn = Netconn::new_with_callback(&self.tcpip, conn_ty, family, Some(self.events()))
            .map_err(|e| {
                kdebug!("socket: {:?} connection failed: {}", conn_ty, e);
                Errno(libc::ENOBUFS)
            })?;
        let index = self.table.alloc(conn, false).map_err(|_| Errno::NFILE)?;
        let fd = self.table.fd_of(index);
        ktrace!("socket {}: new {:?}/{:?}", fd, conn_ty, family);
        Ok(fd)
    }

    /// Close `fd`. The connection is deleted now; the descriptor is
    /// released once no other call is using it.
    pub fn close(&self, fd: Fd) -> Result<(), Errno> {
        self.with_socket(fd, |sock| {
            self.drop_memberships(sock);
            sock.conn.prepare_delete()?;
            self.table.mark_free(sock.index());
            ktrace!("socket {}: closed", fd);
            Ok(())
        })
    }

    pub fn bind(&self, fd: Fd, addr: SocketAddr) -> Result<(), Errno> {
        self.with_socket(fd, |sock| {
            let addr = check_addr(&sock.conn, addr)?;
            sock.conn.bind(addr)?;
            Ok(())
        })
    }

    /// Connect to `addr`; `None` (AF_UNSPEC) dissolves a datagram
    /// association.
    pub fn connect(&self, fd: Fd, addr: Option<SocketAddr>) -> Result<(), Errno> {
        self.with_socket(fd, |sock| {
            match addr {
                None => sock.conn.disconnect()?,
                Some(addr) => {
                    let addr = check_addr(&sock.conn, addr)?;
                    sock.conn.connect(addr)?;
                }
            }
            Ok(())
        })
    }

    pub fn disconnect(&self, fd: Fd) -> Result<(), Errno> {
        self.connect(fd, None)
    }

    /// Listen with `backlog` clamped to 0..=255.
    pub fn listen(&self, fd: Fd, backlog: i32) -> Result<(), Errno> {
        self.with_socket(fd, |sock| {
            let backlog = backlog.clamp(0, 0xff) as u8;
            sock.conn.listen_with_backlog(backlog).map_err(|e| {
                if sock.conn.ty().is_tcp() {
                    Errno::from(e)
                } else {
                    Errno::OPNOTSUPP
                }
            })
        })
    }

    /// Take the next inbound connection; returns its descriptor and
    /// the peer address.
    pub fn accept(&self, fd: Fd) -> Result<(Fd, SocketAddr), Errno> {
        self.with_socket(fd, |sock| {
            if !sock.conn.ty().is_tcp() {
                return Err(Errno::OPNOTSUPP);
            }
            let newconn = sock.conn.accept().map_err(|e| match e {
                NetError::Closed => Errno::INVAL,
                e => Errno::from(e),
            })?;
            let peer = newconn.peer_addr()?;
            let index = self.table.alloc(newconn, true).map_err(|_| Errno::NFILE)?;
            let newfd = self.table.fd_of(index);
            kdebug!("socket {}: accepted socket {} from {}", fd, newfd, peer);
            Ok((newfd, visible(sock.conn.family(), peer)))
        })
    }

    // ── Receive ──

    pub fn recv(&self, fd: Fd, buf: &mut [u8], flags: i32) -> Result<usize, Errno> {
        self.with_socket(fd, |sock| Ok(self.recv_from(sock, buf, flags, false)?.0))
    }

    /// Like `recv`, also returning the sender (the peer for streams).
    pub fn recvfrom(
        &self,
        fd: Fd,
        buf: &mut [u8],
        flags: i32,
    ) -> Result<(usize, Option<SocketAddr>), Errno> {
        self.with_socket(fd, |sock| self.recv_from(sock, buf, flags, true))
    }

    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize, Errno> {
        self.recv(fd, buf, 0)
    }

    pub fn readv(&self, fd: Fd, bufs: &mut [&mut [u8]]) -> Result<usize, Errno> {
        self.recvmsg(fd, bufs, 0).map(|meta| meta.len)
    }

    /// Scatter one receive over `bufs`.
    pub fn recvmsg(&self, fd: Fd, bufs: &mut [&mut [u8]], flags: i32) -> Result<RecvMeta, Errno> {
        self.with_socket(fd, |sock| {
            if bufs.is_empty() || bufs.len() > IOV_MAX {
                return Err(Errno::MSGSIZE);
            }
            if bufs.iter().any(|b| b.is_empty()) {
                return Err(Errno::INVAL);
            }
            if sock.conn.ty().is_tcp() {
                return self.recv_tcp_vectored(sock, bufs, flags);
            }
            let (len, copied, addr) = self.recv_datagram(sock, bufs, flags)?;
            Ok(RecvMeta {
                len: copied,
                addr,
                truncated: len > copied,
            })
        })
    }

    fn recv_from(
        &self,
        sock: &Socket,
        buf: &mut [u8],
        flags: i32,
        want_addr: bool,
    ) -> Result<(usize, Option<SocketAddr>), Errno> {
        if sock.conn.ty().is_tcp() {
            let n = self.recv_tcp(sock, buf, flags)?;
            let from = if want_addr {
                sock.conn
                    .peer_addr()
                    .ok()
                    .map(|a| visible(sock.conn.family(), a))
            } else {
                None
            };
            return Ok((n, from));
        }
        let (_, copied, from) = self.recv_datagram(sock, &mut [buf], flags)?;
        Ok((copied, from))
    }

    /// Copy stream data into `mem`, blocking only for the first chunk.
    /// End of stream reads as 0.
    fn recv_tcp(&self, sock: &Socket, mem: &mut [u8], flags: i32) -> Result<usize, Errno> {
        let peek = flags & MSG_PEEK != 0;
        let mut apiflags = RecvFlags::NOAUTORCVD;
        if flags & MSG_DONTWAIT != 0 {
            apiflags = apiflags | RecvFlags::DONTBLOCK;
        }

        let mut recvd = 0;
        let mut recv_left = mem.len().min(isize::MAX as usize);
        while recv_left > 0 {
            let mut p = match sock.take_stream() {
                Some(p) => p,
                None => match sock.conn.recv_tcp_pbuf_flags(apiflags) {
                    Ok(p) => p,
                    Err(e) if recvd > 0 => {
                        if e == NetError::Closed {
                            // the EOF was consumed; keep it visible to select
                            self.table.event(sock.conn.inner(), ConnEvent::RcvPlus, 0);
                        }
                        break;
                    }
                    Err(NetError::Closed) => return Ok(0),
                    Err(e) => return Err(e.into()),
                },
            };

            let copylen = recv_left.min(p.tot_len());
            p.copy_partial(&mut mem[recvd..recvd + copylen], 0);
            recvd += copylen;
            recv_left -= copylen;

            if peek {
                sock.put_lastdata(Lastdata::Stream(p));
                break;
            }
            if p.tot_len() > copylen {
                p.free_header(copylen);
                sock.put_lastdata(Lastdata::Stream(p));
            }
            apiflags = apiflags | RecvFlags::DONTBLOCK;
        }

        if recvd > 0 && !peek {
            let _ = sock.conn.tcp_recved(recvd);
        }
        Ok(recvd)
    }

    fn recv_tcp_vectored(
        &self,
        sock: &Socket,
        bufs: &mut [&mut [u8]],
        mut flags: i32,
    ) -> Result<RecvMeta, Errno> {
        let mut total = 0;
        for buf in bufs.iter_mut() {
            let want = buf.len();
            match self.recv_tcp(sock, buf, flags) {
                Ok(n) => {
                    total += n;
                    if n < want {
                        break;
                    }
                }
                Err(e) if total == 0 => return Err(e),
                Err(_) => break,
            }
            flags |= MSG_DONTWAIT;
        }
        Ok(RecvMeta {
            len: total,
            addr: None,
            truncated: false,
        })
    }

    /// Take one datagram into `bufs`. Returns its length, the bytes
    /// copied and the sender.
    fn recv_datagram(
        &self,
        sock: &Socket,
        bufs: &mut [&mut [u8]],
        flags: i32,
    ) -> Result<(usize, usize, Option<SocketAddr>), Errno> {
        let buf = match sock.take_datagram() {
            Some(buf) => buf,
            None => {
                let apiflags = if flags & MSG_DONTWAIT != 0 {
                    RecvFlags::DONTBLOCK
                } else {
                    RecvFlags::NONE
                };
                sock.conn.recv_udp_raw_netbuf_flags(apiflags)?
            }
        };

        let len = buf.len();
        let mut copied = 0;
        for v in bufs.iter_mut() {
            if copied >= len {
                break;
            }
            copied += buf.copy_partial(v, copied);
        }
        let from = buf.addr().map(|a| visible(sock.conn.family(), a));
        if flags & MSG_PEEK != 0 {
            sock.put_lastdata(Lastdata::Datagram(buf));
        }
        Ok((len, copied, from))
    }

    // ── Send ──

    pub fn send(&self, fd: Fd, data: &[u8], flags: i32) -> Result<usize, Errno> {
        self.with_socket(fd, |sock| self.send_to(sock, data, flags, None))
    }

    /// Send a datagram to `to`. Streams ignore the address.
    pub fn sendto(&self, fd: Fd, data: &[u8], flags: i32, to: SocketAddr) -> Result<usize, Errno> {
        self.with_socket(fd, |sock| self.send_to(sock, data, flags, Some(to)))
    }

    pub fn write(&self, fd: Fd, data: &[u8]) -> Result<usize, Errno> {
        self.send(fd, data, 0)
    }

    pub fn writev(&self, fd: Fd, bufs: &[&[u8]]) -> Result<usize, Errno> {
        self.sendmsg(fd, bufs, 0, None)
    }

    /// Gather `bufs` into one write (streams) or one datagram.
    pub fn sendmsg(
        &self,
        fd: Fd,
        bufs: &[&[u8]],
        flags: i32,
        to: Option<SocketAddr>,
    ) -> Result<usize, Errno> {
        self.with_socket(fd, |sock| {
            if flags & !(MSG_DONTWAIT | MSG_MORE) != 0 {
                return Err(Errno::OPNOTSUPP);
            }
            if bufs.is_empty() || bufs.len() > IOV_MAX {
                return Err(Errno::MSGSIZE);
            }
            if sock.conn.ty().is_tcp() {
                let mut written = 0;
                sock.conn
                    .write_vectors_partly(bufs, write_flags(flags), Some(&mut written))?;
                return Ok(written);
            }

            let mut size: usize = 0;
            for b in bufs {
                size = size.checked_add(b.len()).ok_or(Errno::MSGSIZE)?;
            }
            if size > MAX_DATAGRAM {
                return Err(Errno::MSGSIZE);
            }
            self.send_datagram(sock, bufs.concat(), to)
        })
    }

    fn send_to(
        &self,
        sock: &Socket,
        data: &[u8],
        flags: i32,
        to: Option<SocketAddr>,
    ) -> Result<usize, Errno> {
        if sock.conn.ty().is_tcp() {
            let mut written = 0;
            sock.conn
                .write_partly(data, write_flags(flags), Some(&mut written))?;
            return Ok(written);
        }
        if data.len() > MAX_DATAGRAM {
            return Err(Errno::MSGSIZE);
        }
        self.send_datagram(sock, data.to_vec(), to)
    }

    fn send_datagram(
        &self,
        sock: &Socket,
        data: Vec<u8>,
        to: Option<SocketAddr>,
    ) -> Result<usize, Errno> {
        let len = data.len();
        let buf = Netbuf::from(data);
        match to {
            Some(addr) => sock.conn.sendto(buf, check_addr(&sock.conn, addr)?)?,
            None => sock.conn.send(buf)?,
        }
        Ok(len)
    }

    // ── Shutdown & addresses ──

    /// `how` is `SHUT_RD`, `SHUT_WR` or `SHUT_RDWR`.
    pub fn shutdown(&self, fd: Fd, how: i32) -> Result<(), Errno> {
        self.with_socket(fd, |sock| {
            if !sock.conn.ty().is_tcp() {
                return Err(Errno::OPNOTSUPP);
            }
            let (rx, tx) = match how {
                libc::SHUT_RD => (true, false),
                libc::SHUT_WR => (false, true),
                libc::SHUT_RDWR => (true, true),
                _ => return Err(Errno::INVAL),
            };
            sock.conn.shutdown(rx, tx)?;
            Ok(())
        })
    }

    pub fn getsockname(&self, fd: Fd) -> Result<SocketAddr, Errno> {
        self.with_socket(fd, |sock| {
            let addr = sock.conn.local_addr()?;
            Ok(visible(sock.conn.family(), addr))
        })
    }

    pub fn getpeername(&self, fd: Fd) -> Result<SocketAddr, Errno> {
        self.with_socket(fd, |sock| {
            let addr = sock.conn.peer_addr()?;
            Ok(visible(sock.conn.family(), addr))
        })
    }
}

fn write_flags(flags: i32) -> WriteFlags {
    let mut wf = WriteFlags::COPY;
    if flags & MSG_MORE != 0 {
        wf = wf | WriteFlags::MORE;
    }
    if flags & MSG_DONTWAIT != 0 {
        wf = wf | WriteFlags::DONTBLOCK;
    }
    wf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV6};

    #[test]
    fn test_unmap_and_visible() {
        let mapped = SocketAddr::V6(SocketAddrV6::new(
            Ipv4Addr::new(10, 0, 0, 1).to_ipv6_mapped(),
            80,
            0,
            0,
        ));
        let plain: SocketAddr = "10.0.0.1:80".parse().unwrap();
        assert_eq!(unmap(mapped), plain);
        assert_eq!(visible(IpFamily::V6, plain), mapped);
        assert_eq!(visible(IpFamily::V4, plain), plain);

        let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 7);
        assert_eq!(unmap(v6), v6);
    }

    #[test]
    fn test_write_flags() {
        assert_eq!(write_flags(0), WriteFlags::COPY);
        let wf = write_flags(MSG_MORE | MSG_DONTWAIT);
        assert!(wf.contains(WriteFlags::MORE));
        assert!(wf.contains(WriteFlags::DONTBLOCK));
    }

    #[test]
    fn test_fd_mapping() {
        let table = SocketTable::new(4, 100, 4);
        assert_eq!(table.index_of(100), Some(0));
        assert_eq!(table.index_of(103), Some(3));
        assert_eq!(table.index_of(99), None);
        assert_eq!(table.fd_of(2), 102);
        assert!(matches!(table.get(100), Err(Errno::BADF)));
    }
}

//! The sequential netconn API
//!
//! A `Netconn` is used from ordinary threads. Every call that touches
//! the protocol engine is shipped to the engine context and the caller
//! blocks until it has been handled; received data is read straight
//! from the connection's queues.
//!
//! # Example
//!
//! ```rust,ignore
//! let conn = Netconn::new(&tcpip, NetconnType::Tcp, IpFamily::V4)?;
//! conn.connect("127.0.0.1:7".parse()?)?;
//! conn.write(b"ping", WriteFlags::COPY)?;
//! let reply = conn.recv()?;
//! ```

use std::net::{IpAddr, SocketAddr};
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use netconn_core::error::{NetError, NetResult};
use netconn_core::{kdebug, kwarn};
use tcpip_core::{IpFamily, Pbuf, PcbOption, PcbOptions};

use crate::conn::{AcceptMsg, ConnEvent, ConnEvents, ConnInner, NetconnType, RecvMsg, Shut};
use crate::msg::{ApiCall, ApiReply};
use crate::netbuf::Netbuf;
use crate::sys::mbox::FetchError;
use crate::tcpip::TcpipHandle;

/// Backlog used by `Netconn::listen`
pub const DEFAULT_LISTEN_BACKLOG: u8 = 0xff;

/// Flags of a stream write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteFlags(u8);

impl WriteFlags {
    pub const NONE: WriteFlags = WriteFlags(0);
    /// Data is copied into the engine (always the case here)
    pub const COPY: WriteFlags = WriteFlags(0x01);
    /// More data follows; do not push yet
    pub const MORE: WriteFlags = WriteFlags(0x02);
    /// Take what fits now and return
    pub const DONTBLOCK: WriteFlags = WriteFlags(0x04);

    #[inline]
    pub fn contains(&self, other: WriteFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for WriteFlags {
    type Output = WriteFlags;

    fn bitor(self, rhs: WriteFlags) -> WriteFlags {
        WriteFlags(self.0 | rhs.0)
    }
}

/// Flags of a receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecvFlags(u8);

impl RecvFlags {
    pub const NONE: RecvFlags = RecvFlags(0);
    /// Leave window updates to an explicit `tcp_recved`
    pub const NOAUTORCVD: RecvFlags = RecvFlags(0x01);
    /// Return `WouldBlock` instead of waiting
    pub const DONTBLOCK: RecvFlags = RecvFlags(0x02);

    #[inline]
    pub fn contains(&self, other: RecvFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for RecvFlags {
    type Output = RecvFlags;

    fn bitor(self, rhs: RecvFlags) -> RecvFlags {
        RecvFlags(self.0 | rhs.0)
    }
}

/// A connection endpoint.
///
/// Dropping a `Netconn` deletes it; `delete()` does the same but
/// reports the result.
pub struct Netconn {
    tcpip: TcpipHandle,
    conn: Arc<ConnInner>,
    deleted: AtomicBool,
}

impl Netconn {
    pub fn new(tcpip: &TcpipHandle, ty: NetconnType, family: IpFamily) -> NetResult<Netconn> {
        Self::new_with_callback(tcpip, ty, family, None)
    }

    /// Create a connection whose events go to `callback`.
    pub fn new_with_callback(
        tcpip: &TcpipHandle,
        ty: NetconnType,
        family: IpFamily,
        callback: Option<Arc<dyn ConnEvents>>,
    ) -> NetResult<Netconn> {
        let conn = ConnInner::new(tcpip.env(), ty, family, callback)?;
        if let Err(e) = tcpip.call(&conn, ApiCall::NewConn) {
            kdebug!("conn {}: create failed: {}", conn.id(), e);
            if let Some(mbox) = conn.take_recvmbox() {
                mbox.close();
            }
            return Err(e);
        }
        Ok(Self::from_inner(tcpip.clone(), conn))
    }

    fn from_inner(tcpip: TcpipHandle, conn: Arc<ConnInner>) -> Netconn {
        Netconn {
            tcpip,
            conn,
            deleted: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn inner(&self) -> &Arc<ConnInner> {
        &self.conn
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.conn.id()
    }

    #[inline]
    pub fn ty(&self) -> NetconnType {
        self.conn.ty()
    }

    #[inline]
    pub fn family(&self) -> IpFamily {
        self.conn.family()
    }

    fn call(&self, call: ApiCall) -> NetResult<ApiReply> {
        if self.is_deleted() {
            return Err(NetError::Closed);
        }
        self.tcpip.call(&self.conn, call)
    }

    /// Close the connection and detach it from the engine, leaving the
    /// handle to be dropped later. On error (a write or blocking connect
    /// still running, or a non-blocking linger) the connection stays
    /// usable.
    pub fn prepare_delete(&self) -> NetResult<()> {
        if self.is_deleted() {
            return Ok(());
        }
        match self.tcpip.call(&self.conn, ApiCall::DelConn) {
            Ok(_) => {
                self.deleted.store(true, Ordering::Release);
                Ok(())
            }
            Err(NetError::If) => {
                // stack stopped; shutdown already released everything
                self.deleted.store(true, Ordering::Release);
                Err(NetError::If)
            }
            Err(e) => Err(e),
        }
    }

    /// Close and release the connection.
    pub fn delete(&mut self) -> NetResult<()> {
        self.prepare_delete()
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn tcpip(&self) -> &TcpipHandle {
        &self.tcpip
    }

    // ── Addressing ──

    pub fn bind(&self, addr: SocketAddr) -> NetResult<()> {
        self.call(ApiCall::Bind(addr)).map(|_| ())
    }

    /// Connect to `addr`. A non-blocking stream returns `InProgress` and
    /// reports completion through its events.
    pub fn connect(&self, addr: SocketAddr) -> NetResult<()> {
        self.call(ApiCall::Connect(addr)).map(|_| ())
    }

    /// Drop the default peer of a datagram connection.
    pub fn disconnect(&self) -> NetResult<()> {
        self.call(ApiCall::Disconnect).map(|_| ())
    }

    pub fn listen(&self) -> NetResult<()> {
        self.listen_with_backlog(DEFAULT_LISTEN_BACKLOG)
    }

    /// Start listening, or change the backlog of a listener.
    pub fn listen_with_backlog(&self, backlog: u8) -> NetResult<()> {
        self.call(ApiCall::Listen(backlog)).map(|_| ())
    }

    pub fn local_addr(&self) -> NetResult<SocketAddr> {
        self.getaddr(true)
    }

    pub fn peer_addr(&self) -> NetResult<SocketAddr> {
        self.getaddr(false)
    }

    fn getaddr(&self, local: bool) -> NetResult<SocketAddr> {
        match self.call(ApiCall::GetAddr { local })? {
            ApiReply::Addr(addr) => Ok(addr),
            _ => Err(NetError::Val),
        }
    }

    // ── Accept ──

    /// Take the next inbound connection of a listener.
    pub fn accept(&self) -> NetResult<Netconn> {
        let conn = &self.conn;
        if let Some(e) = conn.take_err() {
            return Err(e);
        }
        if conn.is_mbox_closed() {
            return Err(NetError::Closed);
        }
        let mbox = conn.acceptmbox().ok_or(NetError::Closed)?;

        let msg = if conn.is_nonblocking() {
            mbox.tryfetch().ok_or(NetError::WouldBlock)?
        } else {
            match mbox.fetch(conn.recv_timeout()) {
                Ok(msg) => msg,
                Err(FetchError::Timeout) => return Err(NetError::Timeout),
                Err(FetchError::Closed) => return Err(conn.take_err().unwrap_or(NetError::Closed)),
            }
        };
        conn.event(ConnEvent::RcvMinus, 0);

        match msg {
            AcceptMsg::Error(e) => Err(e),
            AcceptMsg::Conn(child) => {
                // frees the backlog slot; a failure only delays the next SYN
                if let Err(e) = self.tcpip.call(&child, ApiCall::Accepted) {
                    kwarn!("conn {}: backlog update for conn {} failed: {}", conn.id(), child.id(), e);
                }
                kdebug!("conn {}: accepted conn {}", conn.id(), child.id());
                Ok(Self::from_inner(self.tcpip.clone(), child))
            }
        }
    }

    // ── Receive ──

    /// Take one element of the inbound-data queue. Stream EOF comes back
    /// as `RecvMsg::Eof`.
    fn recv_data(&self, flags: RecvFlags) -> NetResult<RecvMsg> {
        let conn = &self.conn;
        let Some(mbox) = conn.recvmbox() else {
            return Err(conn.take_err().unwrap_or(NetError::Conn));
        };

        let poll_only = conn.is_nonblocking()
            || flags.contains(RecvFlags::DONTBLOCK)
            || conn.is_mbox_closed()
            || conn.pending_err().is_some();
        let msg = if poll_only {
            match mbox.tryfetch() {
                Some(msg) => msg,
                None => {
                    if let Some(e) = conn.take_err() {
                        return Err(e);
                    }
                    if conn.is_mbox_closed() {
                        return Err(NetError::Conn);
                    }
                    return Err(NetError::WouldBlock);
                }
            }
        } else {
            match mbox.fetch(conn.recv_timeout()) {
                Ok(msg) => msg,
                Err(FetchError::Timeout) => return Err(NetError::Timeout),
                Err(FetchError::Closed) => {
                    return Err(conn.take_err().unwrap_or(NetError::Closed));
                }
            }
        };

        let len = match &msg {
            RecvMsg::Segment(p) => p.tot_len(),
            RecvMsg::Datagram(buf) => buf.len(),
            RecvMsg::Eof | RecvMsg::Error(NetError::Closed) => return Ok(RecvMsg::Eof),
            RecvMsg::Error(e) => return Err(*e),
        };
        conn.recv_avail_sub(len);
        conn.event(ConnEvent::RcvMinus, len);
        Ok(msg)
    }

    fn recv_data_tcp(&self, flags: RecvFlags) -> NetResult<Pbuf> {
        let conn = &self.conn;
        if !conn.has_recvmbox() {
            // after EOF, or on a listener
            return Err(if conn.has_acceptmbox() {
                NetError::Conn
            } else {
                NetError::Closed
            });
        }

        let p = match self.recv_data(flags)? {
            RecvMsg::Segment(p) => Some(p),
            _ => None,
        };
        if !flags.contains(RecvFlags::NOAUTORCVD) {
            let len = p.as_ref().map_or(1, Pbuf::tot_len);
            if let Err(e) = self.call(ApiCall::Recved(len)) {
                kwarn!("conn {}: window update failed: {}", conn.id(), e);
            }
        }
        if let Some(p) = p {
            return Ok(p);
        }

        conn.event(ConnEvent::RcvMinus, 0);
        if !conn.has_pcb() {
            // reset raced with the receive
            return Err(conn.take_err().unwrap_or(NetError::Reset));
        }
        if let Err(e) = self.close_shutdown(Shut::Rd) {
            kwarn!("conn {}: shutdown after EOF failed: {}", conn.id(), e);
        }
        Err(NetError::Closed)
    }

    /// Receive the next buffer. Streams return their data with no
    /// addresses; end of stream is `Err(Closed)`.
    pub fn recv(&self) -> NetResult<Netbuf> {
        if self.ty().is_tcp() {
            let p = self.recv_data_tcp(RecvFlags::NONE)?;
            return Ok(Netbuf::from_pbuf(p, None, None));
        }
        self.recv_udp_raw_netbuf_flags(RecvFlags::NONE)
    }

    pub fn recv_tcp_pbuf(&self) -> NetResult<Pbuf> {
        self.recv_tcp_pbuf_flags(RecvFlags::NONE)
    }

    pub fn recv_tcp_pbuf_flags(&self, flags: RecvFlags) -> NetResult<Pbuf> {
        if !self.ty().is_tcp() {
            return Err(NetError::Arg);
        }
        self.recv_data_tcp(flags)
    }

    pub fn recv_udp_raw_netbuf(&self) -> NetResult<Netbuf> {
        self.recv_udp_raw_netbuf_flags(RecvFlags::NONE)
    }

    pub fn recv_udp_raw_netbuf_flags(&self, flags: RecvFlags) -> NetResult<Netbuf> {
        if self.ty().is_tcp() {
            return Err(NetError::Arg);
        }
        match self.recv_data(flags)? {
            RecvMsg::Datagram(buf) => Ok(buf),
            _ => Err(NetError::Val),
        }
    }

    /// Open the receive window by `len` bytes after reading with
    /// `RecvFlags::NOAUTORCVD`.
    pub fn tcp_recved(&self, len: usize) -> NetResult<()> {
        if !self.ty().is_tcp() {
            return Err(NetError::Arg);
        }
        self.call(ApiCall::Recved(len)).map(|_| ())
    }

    // ── Send ──

    /// Send a datagram to `buf.addr()`, or to the connected peer.
    pub fn send(&self, buf: Netbuf) -> NetResult<()> {
        self.call(ApiCall::Send(buf)).map(|_| ())
    }

    pub fn sendto(&self, mut buf: Netbuf, addr: SocketAddr) -> NetResult<()> {
        buf.set_addr(Some(addr));
        self.send(buf)
    }

    /// Queue all of `data` on a stream, blocking until it is accepted.
    pub fn write(&self, data: &[u8], flags: WriteFlags) -> NetResult<()> {
        self.write_partly(data, flags, None)
    }

    pub fn write_partly(
        &self,
        data: &[u8],
        flags: WriteFlags,
        bytes_written: Option<&mut usize>,
    ) -> NetResult<()> {
        self.write_vectors_partly(&[data], flags, bytes_written)
    }

    /// Queue `vectors` on a stream in order.
    ///
    /// A non-blocking write (connection flag, `DONTBLOCK` or a send
    /// timeout) may queue only part of the data and needs
    /// `bytes_written` to say how much.
    pub fn write_vectors_partly(
        &self,
        vectors: &[&[u8]],
        flags: WriteFlags,
        bytes_written: Option<&mut usize>,
    ) -> NetResult<()> {
        let conn = &self.conn;
        if !conn.ty().is_tcp() {
            return Err(NetError::Val);
        }
        let dontblock = conn.is_nonblocking()
            || flags.contains(WriteFlags::DONTBLOCK)
            || conn.send_timeout().is_some();
        if dontblock && bytes_written.is_none() {
            return Err(NetError::Val);
        }

        let mut size: usize = 0;
        for v in vectors {
            size = size.checked_add(v.len()).ok_or(NetError::Val)?;
        }
        if size == 0 {
            if let Some(w) = bytes_written {
                *w = 0;
            }
            return Ok(());
        }

        // the result must fit a signed count
        let mut budget = size.min(isize::MAX as usize);
        let mut owned = Vec::with_capacity(vectors.len());
        for v in vectors.iter().filter(|v| !v.is_empty()) {
            if budget == 0 {
                break;
            }
            let n = v.len().min(budget);
            owned.push(v[..n].to_vec());
            budget -= n;
        }

        match self.call(ApiCall::Write {
            vectors: owned,
            flags,
        })? {
            ApiReply::Written(n) => {
                if let Some(w) = bytes_written {
                    *w = n;
                }
                Ok(())
            }
            _ => Err(NetError::Val),
        }
    }

    // ── Close ──

    fn close_shutdown(&self, shut: Shut) -> NetResult<()> {
        self.call(ApiCall::Close(shut)).map(|_| ())
    }

    /// Close both directions of a stream. The connection still has to be
    /// deleted.
    pub fn close(&self) -> NetResult<()> {
        self.close_shutdown(Shut::RdWr)
    }

    pub fn shutdown(&self, shut_rx: bool, shut_tx: bool) -> NetResult<()> {
        let shut = Shut::from_flags(shut_rx, shut_tx).ok_or(NetError::Arg)?;
        self.close_shutdown(shut)
    }

    // ── Multicast ──

    pub fn join_leave_group(&self, group: IpAddr, ifaddr: IpAddr, join: bool) -> NetResult<()> {
        self.call(ApiCall::JoinLeave {
            group,
            ifaddr,
            join,
        })
        .map(|_| ())
    }

    // ── State and tunables ──

    /// Read and clear the pending error.
    pub fn err(&self) -> Option<NetError> {
        self.conn.take_err()
    }

    pub fn options(&self) -> NetResult<PcbOptions> {
        match self.call(ApiCall::GetOptions)? {
            ApiReply::Options(opts) => Ok(opts),
            _ => Err(NetError::Val),
        }
    }

    pub fn set_option(&self, opt: PcbOption) -> NetResult<()> {
        self.call(ApiCall::SetOption(opt)).map(|_| ())
    }

    pub fn is_nonblocking(&self) -> bool {
        self.conn.is_nonblocking()
    }

    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.conn.set_nonblocking(nonblocking);
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.conn.send_timeout()
    }

    pub fn set_send_timeout(&self, timeout: Option<Duration>) {
        self.conn.set_send_timeout(timeout);
    }

    pub fn recv_timeout(&self) -> Option<Duration> {
        self.conn.recv_timeout()
    }

    pub fn set_recv_timeout(&self, timeout: Option<Duration>) {
        self.conn.set_recv_timeout(timeout);
    }

    pub fn recv_bufsize(&self) -> usize {
        self.conn.recv_bufsize()
    }

    pub fn set_recv_bufsize(&self, size: usize) {
        self.conn.set_recv_bufsize(size);
    }

    pub fn linger(&self) -> Option<u32> {
        self.conn.linger()
    }

    pub fn set_linger(&self, linger: Option<u32>) {
        self.conn.set_linger(linger);
    }
}

impl Drop for Netconn {
    fn drop(&mut self) {
        match self.delete() {
            Ok(()) | Err(NetError::If) => {}
            Err(NetError::WouldBlock) => {
                // non-blocking linger: wait for it like a blocking close
                self.conn.set_nonblocking(false);
                if let Err(e) = self.delete() {
                    kwarn!("conn {}: delete on drop failed: {}", self.conn.id(), e);
                }
            }
            Err(e) => kwarn!("conn {}: delete on drop failed: {}", self.conn.id(), e),
        }
    }
}

impl std::fmt::Debug for Netconn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Netconn")
            .field("conn", &self.conn)
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

//! The connection object shared between application threads and the
//! engine context.
//!
//! Fields that application threads touch are atomics or sit behind
//! short-lived mutexes. The control-block handle and the operation
//! state (`EngineSide`) are written only from the engine context.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicI8, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use netconn_core::error::{NetError, NetResult};
use netconn_core::pool::{MemPool, PoolSlot};
use netconn_core::ktrace;
use tcpip_core::{IpFamily, Pbuf, PcbId};

use crate::api::WriteFlags;
use crate::config::StackConfig;
use crate::msg::{ApiReply, Completion};
use crate::netbuf::Netbuf;
use crate::sys::mbox::Mbox;

/// Protocol of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetconnType {
    Tcp,
    Udp,
    UdpLite,
    /// UDP without checksums
    UdpNoChksum,
    /// Raw IP with the given protocol number
    Raw(u8),
}

impl NetconnType {
    #[inline]
    pub fn is_tcp(&self) -> bool {
        matches!(self, NetconnType::Tcp)
    }

    #[inline]
    pub fn is_udp(&self) -> bool {
        matches!(
            self,
            NetconnType::Udp | NetconnType::UdpLite | NetconnType::UdpNoChksum
        )
    }

    #[inline]
    pub fn is_raw(&self) -> bool {
        matches!(self, NetconnType::Raw(_))
    }
}

/// What happened on a connection, reported to its `ConnEvents` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    /// Data (or a connection, or EOF) became available
    RcvPlus,
    /// Data was taken by the application
    RcvMinus,
    /// The connection became writable
    SendPlus,
    /// The connection became write-blocked
    SendMinus,
    Error,
}

/// Event hook installed at creation. Called from the engine context
/// and from application threads; must not call back into the netconn
/// API.
pub trait ConnEvents: Send + Sync {
    fn event(&self, conn: &ConnInner, evt: ConnEvent, len: usize);
}

/// Element of the inbound-data queue.
#[derive(Debug)]
pub enum RecvMsg {
    /// Stream data
    Segment(Pbuf),
    /// One datagram with its addresses
    Datagram(Netbuf),
    /// The peer closed its sending side
    Eof,
    Error(NetError),
}

/// Element of the inbound-connection queue.
pub enum AcceptMsg {
    Conn(Arc<ConnInner>),
    Error(NetError),
}

impl fmt::Debug for AcceptMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptMsg::Conn(c) => write!(f, "Conn({})", c.id()),
            AcceptMsg::Error(e) => write!(f, "Error({:?})", e),
        }
    }
}

/// Which direction(s) a close shuts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shut {
    Rd,
    Wr,
    RdWr,
}

impl Shut {
    pub fn from_flags(rx: bool, tx: bool) -> Option<Shut> {
        match (rx, tx) {
            (true, true) => Some(Shut::RdWr),
            (true, false) => Some(Shut::Rd),
            (false, true) => Some(Shut::Wr),
            (false, false) => None,
        }
    }

    #[inline]
    pub fn rx(&self) -> bool {
        matches!(self, Shut::Rd | Shut::RdWr)
    }

    #[inline]
    pub fn tx(&self) -> bool {
        matches!(self, Shut::Wr | Shut::RdWr)
    }
}

/// A blocking write being fed to the engine piece by piece.
pub(crate) struct WriteOp {
    pub vectors: Vec<Vec<u8>>,
    pub vector_idx: usize,
    pub vector_off: usize,
    /// Bytes accepted by the engine so far
    pub offset: usize,
    pub total: usize,
    pub flags: WriteFlags,
    pub time_started: Instant,
    pub done: Arc<Completion<ApiReply>>,
}

/// A close or shutdown waiting for the engine to accept it.
pub(crate) struct CloseOp {
    pub shut: Shut,
    pub time_started: Instant,
    /// Poll budget when no clock timeout applies
    pub polls_left: u32,
    pub done: Arc<Completion<ApiReply>>,
}

/// The long-running operation that owns the connection.
pub(crate) enum ConnState {
    None,
    Listen,
    Write(WriteOp),
    /// `Some` for a blocking connect
    Connect(Option<Arc<Completion<ApiReply>>>),
    Close(CloseOp),
}

impl ConnState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnState::None => "NONE",
            ConnState::Listen => "LISTEN",
            ConnState::Write(_) => "WRITE",
            ConnState::Connect(_) => "CONNECT",
            ConnState::Close(_) => "CLOSE",
        }
    }

    /// Release the caller blocked on this operation, if any.
    pub fn complete(self, result: NetResult<ApiReply>) {
        match self {
            ConnState::Write(op) => op.done.complete(result),
            ConnState::Connect(Some(done)) => done.complete(result),
            ConnState::Close(op) => op.done.complete(result),
            _ => {}
        }
    }
}

/// Engine-owned part of a connection.
pub(crate) struct EngineSide {
    pub pcb: Option<PcbId>,
    pub state: ConnState,
}

/// Connection flags
pub(crate) mod flag {
    pub const NONBLOCKING: u8 = 0x01;
    /// No more data will be posted to the queues
    pub const MBOXCLOSED: u8 = 0x02;
    /// Emit SENDPLUS once the send buffer drains below the low-water marks
    pub const CHECK_WRITESPACE: u8 = 0x04;
    pub const IN_NONBLOCKING_CONNECT: u8 = 0x08;
}

/// What every connection of one stack shares: configuration, the
/// connection pool and the registry used to release waiters when the
/// stack stops.
pub struct ConnEnv {
    pub(crate) config: StackConfig,
    pool: Arc<MemPool>,
    live: Mutex<HashMap<u32, Weak<ConnInner>>>,
}

impl ConnEnv {
    pub(crate) fn new(config: StackConfig) -> Arc<Self> {
        Arc::new(Self {
            pool: Arc::new(MemPool::new("netconn", config.max_netconns)),
            config,
            live: Mutex::new(HashMap::new()),
        })
    }

    pub fn pool(&self) -> &MemPool {
        &self.pool
    }

    /// Strong references to every live connection.
    pub(crate) fn live_conns(&self) -> Vec<Arc<ConnInner>> {
        let live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        live.values().filter_map(Weak::upgrade).collect()
    }
}

pub struct ConnInner {
    slot: PoolSlot,
    ty: NetconnType,
    family: IpFamily,
    pub(crate) env: Arc<ConnEnv>,

    recvmbox: Mutex<Option<Arc<Mbox<RecvMsg>>>>,
    acceptmbox: Mutex<Option<Arc<Mbox<AcceptMsg>>>>,

    /// Sticky error code (0 = none), cleared when read
    pending_err: AtomicI8,
    flags: AtomicU8,

    /// Descriptor index; negative values count RCVPLUS events that
    /// arrived before a descriptor was assigned
    socket: AtomicI32,

    /// Milliseconds, 0 = none
    send_timeout: AtomicU32,
    recv_timeout: AtomicU32,
    recv_bufsize: AtomicUsize,
    pub(crate) recv_avail: AtomicUsize,
    /// Seconds; -1 disabled
    linger: AtomicI32,

    callback: Option<Arc<dyn ConnEvents>>,

    side: Mutex<EngineSide>,
}

impl ConnInner {
    /// Allocate a connection and its inbound-data queue.
    pub(crate) fn new(
        env: &Arc<ConnEnv>,
        ty: NetconnType,
        family: IpFamily,
        callback: Option<Arc<dyn ConnEvents>>,
    ) -> NetResult<Arc<ConnInner>> {
        let slot = env.pool.alloc_slot()?;
        let config = &env.config;
        let size = match ty {
            NetconnType::Tcp => config.tcp_recvmbox_size,
            NetconnType::Raw(_) => config.raw_recvmbox_size,
            _ => config.udp_recvmbox_size,
        };
        let conn = Arc::new(ConnInner {
            slot,
            ty,
            family,
            env: Arc::clone(env),
            recvmbox: Mutex::new(Some(Arc::new(Mbox::new(size)))),
            acceptmbox: Mutex::new(None),
            pending_err: AtomicI8::new(0),
            flags: AtomicU8::new(0),
            socket: AtomicI32::new(-1),
            send_timeout: AtomicU32::new(0),
            recv_timeout: AtomicU32::new(0),
            recv_bufsize: AtomicUsize::new(config.recv_bufsize),
            recv_avail: AtomicUsize::new(0),
            linger: AtomicI32::new(-1),
            callback,
            side: Mutex::new(EngineSide {
                pcb: None,
                state: ConnState::None,
            }),
        });
        env.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(conn.id(), Arc::downgrade(&conn));
        ktrace!("conn {}: new {:?}/{:?}", conn.id(), ty, family);
        Ok(conn)
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.slot.index()
    }

    #[inline]
    pub fn ty(&self) -> NetconnType {
        self.ty
    }

    #[inline]
    pub fn family(&self) -> IpFamily {
        self.family
    }

    pub(crate) fn config(&self) -> &StackConfig {
        &self.env.config
    }

    pub(crate) fn side(&self) -> MutexGuard<'_, EngineSide> {
        self.side.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether the engine still holds a control block for this connection.
    pub fn has_pcb(&self) -> bool {
        self.side().pcb.is_some()
    }

    /// Control block handle, for queries run through `TcpipHandle::with_engine`.
    pub fn pcb(&self) -> Option<PcbId> {
        self.side().pcb
    }

    // ── Queues ──

    pub(crate) fn recvmbox(&self) -> Option<Arc<Mbox<RecvMsg>>> {
        self.recvmbox.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn acceptmbox(&self) -> Option<Arc<Mbox<AcceptMsg>>> {
        self.acceptmbox.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn take_recvmbox(&self) -> Option<Arc<Mbox<RecvMsg>>> {
        self.recvmbox.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub(crate) fn take_acceptmbox(&self) -> Option<Arc<Mbox<AcceptMsg>>> {
        self.acceptmbox.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub(crate) fn set_acceptmbox(&self, mbox: Arc<Mbox<AcceptMsg>>) {
        *self.acceptmbox.lock().unwrap_or_else(|e| e.into_inner()) = Some(mbox);
    }

    pub fn has_recvmbox(&self) -> bool {
        self.recvmbox.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    pub fn has_acceptmbox(&self) -> bool {
        self.acceptmbox.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Messages waiting in the inbound-data queue.
    pub fn queued(&self) -> usize {
        self.recvmbox().map_or(0, |m| m.len())
    }

    // ── Errors ──

    /// Read and clear the pending error.
    pub fn take_err(&self) -> Option<NetError> {
        NetError::from_code(self.pending_err.swap(0, Ordering::AcqRel)).err()
    }

    /// Read the pending error without clearing it.
    pub fn pending_err(&self) -> Option<NetError> {
        NetError::from_code(self.pending_err.load(Ordering::Acquire)).err()
    }

    pub(crate) fn set_pending_err(&self, err: NetError) {
        self.pending_err.store(err.code(), Ordering::Release);
    }

    /// A pending error after which the control block is gone.
    pub(crate) fn fatal_err(&self) -> Option<NetError> {
        self.pending_err().filter(NetError::is_fatal)
    }

    // ── Flags ──

    #[inline]
    pub(crate) fn has_flag(&self, f: u8) -> bool {
        self.flags.load(Ordering::Acquire) & f != 0
    }

    #[inline]
    pub(crate) fn set_flag(&self, f: u8) {
        self.flags.fetch_or(f, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn clear_flag(&self, f: u8) {
        self.flags.fetch_and(!f, Ordering::AcqRel);
    }

    pub fn is_nonblocking(&self) -> bool {
        self.has_flag(flag::NONBLOCKING)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) {
        if nonblocking {
            self.set_flag(flag::NONBLOCKING);
        } else {
            self.clear_flag(flag::NONBLOCKING);
        }
    }

    /// No more data will arrive on the queues.
    pub fn is_mbox_closed(&self) -> bool {
        self.has_flag(flag::MBOXCLOSED)
    }

    // ── Tunables ──

    pub fn send_timeout(&self) -> Option<Duration> {
        ms_to_opt(self.send_timeout.load(Ordering::Relaxed))
    }

    pub fn set_send_timeout(&self, timeout: Option<Duration>) {
        self.send_timeout.store(opt_to_ms(timeout), Ordering::Relaxed);
    }

    pub fn recv_timeout(&self) -> Option<Duration> {
        ms_to_opt(self.recv_timeout.load(Ordering::Relaxed))
    }

    pub fn set_recv_timeout(&self, timeout: Option<Duration>) {
        self.recv_timeout.store(opt_to_ms(timeout), Ordering::Relaxed);
    }

    pub fn recv_bufsize(&self) -> usize {
        self.recv_bufsize.load(Ordering::Relaxed)
    }

    pub fn set_recv_bufsize(&self, size: usize) {
        self.recv_bufsize.store(size, Ordering::Relaxed);
    }

    /// Bytes (datagrams) or pbuf lengths (streams) queued and not yet read.
    pub fn recv_avail(&self) -> usize {
        self.recv_avail.load(Ordering::Relaxed)
    }

    pub(crate) fn recv_avail_sub(&self, len: usize) {
        // the closure never refuses, so both arms carry the old value
        self.recv_avail
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(len)))
            .unwrap_or_else(|v| v);
    }

    /// Linger in seconds: `None` disabled, `Some(0)` abort on close.
    pub fn linger(&self) -> Option<u32> {
        let v = self.linger.load(Ordering::Relaxed);
        (v >= 0).then_some(v as u32)
    }

    pub fn set_linger(&self, linger: Option<u32>) {
        let v = linger.map_or(-1, |s| s.min(i32::MAX as u32) as i32);
        self.linger.store(v, Ordering::Relaxed);
    }

    // ── Descriptor link ──

    /// Descriptor index, if one has been assigned.
    pub fn socket(&self) -> Option<i32> {
        let s = self.socket.load(Ordering::Acquire);
        (s >= 0).then_some(s)
    }

    /// Count an RCVPLUS that arrived before a descriptor was assigned.
    /// Returns the descriptor if one is assigned after all.
    pub fn note_early_rcvplus(&self) -> Option<i32> {
        let mut s = self.socket.load(Ordering::Acquire);
        loop {
            if s >= 0 {
                return Some(s);
            }
            match self
                .socket
                .compare_exchange_weak(s, s - 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return None,
                Err(actual) => s = actual,
            }
        }
    }

    /// Assign the descriptor. Returns how many RCVPLUS events were
    /// counted before.
    pub fn attach_socket(&self, index: i32) -> usize {
        let old = self.socket.swap(index, Ordering::AcqRel);
        if old < 0 {
            (-1 - old) as usize
        } else {
            0
        }
    }

    // ── Events ──

    #[inline]
    pub(crate) fn event(&self, evt: ConnEvent, len: usize) {
        if let Some(cb) = &self.callback {
            cb.event(self, evt, len);
        }
    }

    pub(crate) fn callback(&self) -> Option<Arc<dyn ConnEvents>> {
        self.callback.clone()
    }
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        let id = self.slot.index();
        self.env
            .live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        ktrace!("conn {}: freed", id);
    }
}

impl fmt::Debug for ConnInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnInner")
            .field("id", &self.id())
            .field("ty", &self.ty)
            .field("family", &self.family)
            .field("flags", &self.flags.load(Ordering::Relaxed))
            .field("pending_err", &self.pending_err())
            .finish()
    }
}

fn ms_to_opt(ms: u32) -> Option<Duration> {
    (ms != 0).then(|| Duration::from_millis(ms as u64))
}

fn opt_to_ms(d: Option<Duration>) -> u32 {
    match d {
        Some(d) => d.as_millis().clamp(1, u32::MAX as u128) as u32,
        None => 0,
    }
}

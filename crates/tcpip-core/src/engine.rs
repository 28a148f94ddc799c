//! The protocol engine seam.
//!
//! `ProtocolEngine` is everything the API layer may call on the engine;
//! the handler traits are everything the engine may call back. One
//! handler trait per protocol family. An engine only invokes handlers
//! from `process()` and `tick()`, never from inside another engine
//! call, so a handler may freely call back into the engine it is given.

use std::any::Any;
use std::net::{IpAddr, SocketAddr};
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use netconn_core::error::{NetError, NetResult};

use crate::pbuf::Pbuf;
use crate::pcb::{IpFamily, PcbId, PcbOption, PcbOptions, TcpState};

/// Which TCP callbacks are currently armed on a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpCallbacks(u8);

impl TcpCallbacks {
    pub const NONE: TcpCallbacks = TcpCallbacks(0);
    pub const RECV: TcpCallbacks = TcpCallbacks(0x01);
    pub const SENT: TcpCallbacks = TcpCallbacks(0x02);
    pub const POLL: TcpCallbacks = TcpCallbacks(0x04);
    pub const ERR: TcpCallbacks = TcpCallbacks(0x08);
    pub const ACCEPT: TcpCallbacks = TcpCallbacks(0x10);
    /// Data path of a connected block
    pub const DATA: TcpCallbacks = TcpCallbacks(0x0f);

    #[inline]
    pub fn contains(&self, other: TcpCallbacks) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn remove(&mut self, other: TcpCallbacks) {
        self.0 &= !other.0;
    }

    #[inline]
    pub fn insert(&mut self, other: TcpCallbacks) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for TcpCallbacks {
    type Output = TcpCallbacks;
    fn bitor(self, rhs: TcpCallbacks) -> TcpCallbacks {
        TcpCallbacks(self.0 | rhs.0)
    }
}

impl BitOrAssign for TcpCallbacks {
    fn bitor_assign(&mut self, rhs: TcpCallbacks) {
        self.0 |= rhs.0;
    }
}

/// Flags for `tcp_write`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpWriteFlags(u8);

impl TcpWriteFlags {
    pub const COPY: TcpWriteFlags = TcpWriteFlags(0x01);
    /// More data follows; do not push yet
    pub const MORE: TcpWriteFlags = TcpWriteFlags(0x02);

    #[inline]
    pub fn contains(&self, other: TcpWriteFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TcpWriteFlags {
    type Output = TcpWriteFlags;
    fn bitor(self, rhs: TcpWriteFlags) -> TcpWriteFlags {
        TcpWriteFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for TcpWriteFlags {
    fn bitor_assign(&mut self, rhs: TcpWriteFlags) {
        self.0 |= rhs.0;
    }
}

/// A receive the handler could not take. The engine keeps the data
/// (`None` for a FIN) and offers it again later.
#[derive(Debug)]
pub struct Refused(pub Option<Pbuf>);

/// Callbacks from a TCP block.
pub trait TcpHandler: Send + Sync {
    /// Data arrived (`Some`) or the peer closed its side (`None`).
    fn recv(&self, engine: &mut dyn ProtocolEngine, pcb: PcbId, data: Option<Pbuf>)
        -> Result<(), Refused>;

    /// `len` bytes were acknowledged by the peer.
    fn sent(&self, engine: &mut dyn ProtocolEngine, pcb: PcbId, len: usize);

    /// Periodic poll at the block's poll interval.
    fn poll(&self, engine: &mut dyn ProtocolEngine, pcb: PcbId);

    /// The block is gone. It must not be used again.
    fn err(&self, err: NetError);

    /// A listener produced a connection (or failed to).
    ///
    /// Returning an error makes the engine abort the new block.
    fn accept(
        &self,
        engine: &mut dyn ProtocolEngine,
        listener: PcbId,
        new: NetResult<PcbId>,
    ) -> NetResult<()>;

    /// An active open completed.
    fn connected(&self, engine: &mut dyn ProtocolEngine, pcb: PcbId);
}

/// Callbacks from a UDP block.
pub trait UdpHandler: Send + Sync {
    fn recv(&self, pcb: PcbId, data: Pbuf, src: SocketAddr, dst: SocketAddr);
}

/// Callbacks from a raw block. Returns `true` if the packet was consumed.
pub trait RawHandler: Send + Sync {
    fn recv(&self, pcb: PcbId, data: &Pbuf, src: IpAddr, dst: IpAddr) -> bool;
}

/// Completion of an asynchronous name lookup.
pub trait DnsHandler: Send + Sync {
    fn found(&self, name: &str, addr: Option<IpAddr>);
}

/// The protocol engine, driven only from the engine context.
pub trait ProtocolEngine: Send {
    // ── TCP ──

    fn tcp_new(&mut self, family: IpFamily) -> NetResult<PcbId>;
    fn tcp_set_handler(&mut self, pcb: PcbId, handler: Option<Arc<dyn TcpHandler>>);
    fn tcp_callbacks(&mut self, pcb: PcbId) -> TcpCallbacks;
    fn tcp_set_callbacks(&mut self, pcb: PcbId, callbacks: TcpCallbacks);
    /// Poll interval in slow-timer ticks.
    fn tcp_set_poll_interval(&mut self, pcb: PcbId, interval: u8);
    fn tcp_bind(&mut self, pcb: PcbId, addr: SocketAddr) -> NetResult<()>;
    fn tcp_connect(&mut self, pcb: PcbId, addr: SocketAddr) -> NetResult<()>;
    fn tcp_listen(&mut self, pcb: PcbId, backlog: u8) -> NetResult<()>;
    fn tcp_backlog_set(&mut self, pcb: PcbId, backlog: u8);
    /// The accepted block is waiting in an application queue.
    fn tcp_backlog_delayed(&mut self, pcb: PcbId);
    /// The application took the accepted block.
    fn tcp_backlog_accepted(&mut self, pcb: PcbId);
    fn tcp_write(&mut self, pcb: PcbId, data: &[u8], flags: TcpWriteFlags) -> NetResult<()>;
    fn tcp_output(&mut self, pcb: PcbId) -> NetResult<()>;
    fn tcp_sndbuf(&self, pcb: PcbId) -> usize;
    fn tcp_sndqueuelen(&self, pcb: PcbId) -> usize;
    /// Unsent or unacknowledged data is queued.
    fn tcp_has_pending(&self, pcb: PcbId) -> bool;
    fn tcp_recved(&mut self, pcb: PcbId, len: usize);
    /// Full close. On success the handle belongs to the engine again
    /// unless the caller keeps its handler armed to linger.
    fn tcp_close(&mut self, pcb: PcbId) -> NetResult<()>;
    fn tcp_shutdown(&mut self, pcb: PcbId, shut_rx: bool, shut_tx: bool) -> NetResult<()>;
    /// Reset the connection and free the block. No callback follows.
    fn tcp_abort(&mut self, pcb: PcbId);
    fn tcp_state(&self, pcb: PcbId) -> TcpState;
    fn tcp_rx_closed(&self, pcb: PcbId) -> bool;

    // ── UDP ──

    fn udp_new(&mut self, family: IpFamily) -> NetResult<PcbId>;
    fn udp_set_handler(&mut self, pcb: PcbId, handler: Option<Arc<dyn UdpHandler>>);
    fn udp_bind(&mut self, pcb: PcbId, addr: SocketAddr) -> NetResult<()>;
    fn udp_connect(&mut self, pcb: PcbId, addr: SocketAddr) -> NetResult<()>;
    fn udp_disconnect(&mut self, pcb: PcbId);
    fn udp_send(&mut self, pcb: PcbId, data: Pbuf) -> NetResult<()>;
    fn udp_sendto(&mut self, pcb: PcbId, data: Pbuf, dst: SocketAddr) -> NetResult<()>;
    fn udp_remove(&mut self, pcb: PcbId);

    // ── RAW ──

    fn raw_new(&mut self, family: IpFamily, proto: u8) -> NetResult<PcbId>;
    fn raw_set_handler(&mut self, pcb: PcbId, handler: Option<Arc<dyn RawHandler>>);
    fn raw_bind(&mut self, pcb: PcbId, addr: IpAddr) -> NetResult<()>;
    fn raw_connect(&mut self, pcb: PcbId, addr: IpAddr) -> NetResult<()>;
    fn raw_disconnect(&mut self, pcb: PcbId);
    fn raw_send(&mut self, pcb: PcbId, data: Pbuf) -> NetResult<()>;
    fn raw_sendto(&mut self, pcb: PcbId, data: Pbuf, dst: IpAddr) -> NetResult<()>;
    fn raw_remove(&mut self, pcb: PcbId);

    // ── Common ──

    fn local_addr(&self, pcb: PcbId) -> NetResult<SocketAddr>;
    fn remote_addr(&self, pcb: PcbId) -> NetResult<SocketAddr>;
    fn options(&self, pcb: PcbId) -> NetResult<PcbOptions>;
    fn set_option(&mut self, pcb: PcbId, opt: PcbOption) -> NetResult<()>;

    fn join_group(&mut self, ifaddr: IpAddr, group: IpAddr) -> NetResult<()>;
    fn leave_group(&mut self, ifaddr: IpAddr, group: IpAddr) -> NetResult<()>;

    /// `Ok(Some)` for literals and cache hits, `Ok(None)` when the
    /// handler will be called later.
    fn dns_gethostbyname(
        &mut self,
        name: &str,
        family: IpFamily,
        handler: Arc<dyn DnsHandler>,
    ) -> NetResult<Option<IpAddr>>;

    // ── Driving ──

    /// Deliver queued segments and fire pending callbacks. Returns
    /// `true` if anything happened.
    fn process(&mut self) -> bool;

    /// One slow-timer tick: poll callbacks, handshake retries, DNS.
    fn tick(&mut self);

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_mask() {
        let mut cbs = TcpCallbacks::DATA;
        assert!(cbs.contains(TcpCallbacks::RECV | TcpCallbacks::ERR));
        assert!(!cbs.contains(TcpCallbacks::ACCEPT));
        cbs.remove(TcpCallbacks::RECV);
        assert!(!cbs.contains(TcpCallbacks::RECV));
        assert!(cbs.contains(TcpCallbacks::SENT));
        cbs.insert(TcpCallbacks::ACCEPT);
        assert!(cbs.contains(TcpCallbacks::ACCEPT));
        assert!(TcpCallbacks::NONE.is_empty());
    }

    #[test]
    fn test_write_flags() {
        let flags = TcpWriteFlags::COPY | TcpWriteFlags::MORE;
        assert!(flags.contains(TcpWriteFlags::MORE));
        assert!(!TcpWriteFlags::default().contains(TcpWriteFlags::COPY));
    }
}

//! Control block table of the loopback engine.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use netconn_core::error::NetError;
use tcpip_core::{
    IpFamily, Pbuf, PcbKind, PcbOptions, RawHandler, TcpCallbacks, TcpHandler, TcpState,
    UdpHandler,
};

pub(crate) struct Pcb {
    pub family: IpFamily,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub remote: Option<SocketAddr>,
    pub options: PcbOptions,
    pub proto: Proto,
}

pub(crate) enum Proto {
    Tcp(TcpPcb),
    Udp(UdpPcb),
    Raw(RawPcb),
}

impl Pcb {
    pub fn new(family: IpFamily, proto: Proto) -> Self {
        Self {
            family,
            local_ip: family.unspecified(),
            local_port: 0,
            remote: None,
            options: PcbOptions::default(),
            proto,
        }
    }

    pub fn kind(&self) -> PcbKind {
        match self.proto {
            Proto::Tcp(_) => PcbKind::Tcp,
            Proto::Udp(_) => PcbKind::Udp,
            Proto::Raw(_) => PcbKind::Raw,
        }
    }

    pub fn local(&self) -> SocketAddr {
        SocketAddr::new(self.local_ip, self.local_port)
    }

    /// Whether an address may be used with this block.
    pub fn admits(&self, addr: &IpAddr) -> bool {
        self.family.admits(addr) && !(self.options.v6only && addr.is_ipv4())
    }

    /// Whether a packet for `dst` may land on this block's local address.
    pub fn accepts_dst(&self, dst: &IpAddr) -> bool {
        self.admits(dst) && (self.local_ip.is_unspecified() || self.local_ip == *dst)
    }

    pub fn tcp(&self) -> Option<&TcpPcb> {
        match &self.proto {
            Proto::Tcp(t) => Some(t),
            _ => None,
        }
    }

    pub fn tcp_mut(&mut self) -> Option<&mut TcpPcb> {
        match &mut self.proto {
            Proto::Tcp(t) => Some(t),
            _ => None,
        }
    }
}

/// One unit in a receiver's inbound queue
pub(crate) enum Segment {
    Data(Pbuf),
    Fin,
}

pub(crate) struct TcpPcb {
    pub state: TcpState,
    pub handler: Option<Arc<dyn TcpHandler>>,
    pub callbacks: TcpCallbacks,
    pub poll_interval: u8,
    pub poll_tmr: u8,

    // ── send side ──
    pub unsent: Pbuf,
    pub fin_queued: bool,
    pub fin_sent: bool,

    // ── receive side ──
    pub rcv_wnd: usize,
    /// Accepted by TCP, not yet taken by the handler. A refused
    /// segment goes back to the front.
    pub inbox: VecDeque<Segment>,
    pub rx_closed: bool,
    /// The owner released the block with a successful close
    pub user_closed: bool,

    /// The other end of a loopback connection
    pub peer: Option<u32>,

    // ── listen / accept ──
    pub backlog: u8,
    pub accepts_pending: u8,
    pub listener: Option<u32>,
    pub backlog_pend: bool,

    // ── active open ──
    pub syn_ticks: u32,
    pub syn_due: bool,

    /// Set when the block was torn down; reaped by `process()`
    pub dead: Option<NetError>,
}

impl TcpPcb {
    pub fn new(wnd: usize) -> Self {
        Self {
            state: TcpState::Closed,
            handler: None,
            callbacks: TcpCallbacks::NONE,
            poll_interval: 0,
            poll_tmr: 0,
            unsent: Pbuf::new(),
            fin_queued: false,
            fin_sent: false,
            rcv_wnd: wnd,
            inbox: VecDeque::new(),
            rx_closed: false,
            user_closed: false,
            peer: None,
            backlog: 0,
            accepts_pending: 0,
            listener: None,
            backlog_pend: false,
            syn_ticks: 0,
            syn_due: false,
            dead: None,
        }
    }

    #[inline]
    pub fn alive(&self) -> bool {
        self.dead.is_none()
    }

    /// States in which `tcp_write` is allowed.
    pub fn writable(&self) -> bool {
        self.alive()
            && !self.fin_queued
            && matches!(
                self.state,
                TcpState::Established | TcpState::CloseWait | TcpState::SynSent | TcpState::SynRcvd
            )
    }

    /// Queue our FIN behind the unsent data.
    pub fn queue_fin(&mut self) {
        self.fin_queued = true;
        self.state = match self.state {
            TcpState::CloseWait => TcpState::LastAck,
            _ => TcpState::FinWait1,
        };
    }

    /// Our FIN reached the peer, which acknowledges at once.
    pub fn fin_acked(&mut self) {
        self.fin_sent = true;
        self.state = match self.state {
            TcpState::FinWait1 => TcpState::FinWait2,
            TcpState::Closing => TcpState::TimeWait,
            TcpState::LastAck => TcpState::Closed,
            s => s,
        };
    }

    /// The peer's FIN arrived.
    pub fn fin_received(&mut self) {
        self.state = match self.state {
            TcpState::Established | TcpState::SynRcvd => TcpState::CloseWait,
            TcpState::FinWait1 => TcpState::Closing,
            TcpState::FinWait2 => TcpState::TimeWait,
            s => s,
        };
    }

    /// The owner is done and the connection has run its course.
    pub fn reapable(&self) -> bool {
        self.user_closed
            && self.handler.is_none()
            && self.inbox.is_empty()
            && matches!(self.state, TcpState::TimeWait | TcpState::Closed)
    }
}

pub(crate) struct UdpPcb {
    pub handler: Option<Arc<dyn UdpHandler>>,
}

pub(crate) struct RawPcb {
    pub proto: u8,
    pub handler: Option<Arc<dyn RawHandler>>,
}

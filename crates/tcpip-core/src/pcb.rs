//! Control block identity, TCP states and per-block option bags.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Handle of a protocol control block inside an engine.
///
/// Handles are only meaningful to the engine that issued them and only
/// until the engine reports the block gone (error callback, successful
/// close, abort or remove).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PcbId(pub u32);

impl fmt::Display for PcbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pcb#{}", self.0)
    }
}

/// Protocol family of a control block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PcbKind {
    Tcp,
    Udp,
    Raw,
}

/// Address family a control block was created for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
    /// Dual-stack: accepts either family
    Any,
}

impl IpFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    /// Whether an address of this family may be used with the block.
    pub fn admits(&self, addr: &IpAddr) -> bool {
        match self {
            IpFamily::Any => true,
            fam => *fam == IpFamily::of(addr),
        }
    }

    /// The wildcard address of this family.
    pub fn unspecified(&self) -> IpAddr {
        match self {
            IpFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpFamily::V6 | IpFamily::Any => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

/// TCP connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// States in which our FIN has been queued or sent.
    pub fn fin_sent(&self) -> bool {
        matches!(
            self,
            TcpState::FinWait1
                | TcpState::FinWait2
                | TcpState::Closing
                | TcpState::LastAck
                | TcpState::TimeWait
        )
    }

    /// States in which the peer's FIN has been received.
    pub fn fin_received(&self) -> bool {
        matches!(
            self,
            TcpState::CloseWait | TcpState::Closing | TcpState::LastAck | TcpState::TimeWait
        )
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TcpState::Closed => "CLOSED",
            TcpState::Listen => "LISTEN",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynRcvd => "SYN_RCVD",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT_1",
            TcpState::FinWait2 => "FIN_WAIT_2",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::Closing => "CLOSING",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
        };
        f.write_str(s)
    }
}

/// Socket-visible options stored on a control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcbOptions {
    pub reuse_addr: bool,
    pub keepalive: bool,
    pub broadcast: bool,
    pub ttl: u8,
    pub tos: u8,
    pub nodelay: bool,
    /// Keepalive idle time, milliseconds
    pub keep_idle: u32,
    /// Keepalive probe interval, milliseconds
    pub keep_intvl: u32,
    pub keep_cnt: u32,
    pub mcast_ttl: u8,
    pub mcast_if: Ipv4Addr,
    pub mcast_loop: bool,
    pub no_checksum: bool,
    /// IPv6 block refuses IPv4 traffic
    pub v6only: bool,
}

impl Default for PcbOptions {
    fn default() -> Self {
        Self {
            reuse_addr: false,
            keepalive: false,
            broadcast: false,
            ttl: 255,
            tos: 0,
            nodelay: false,
            keep_idle: 7_200_000,
            keep_intvl: 75_000,
            keep_cnt: 9,
            mcast_ttl: 1,
            mcast_if: Ipv4Addr::UNSPECIFIED,
            mcast_loop: true,
            no_checksum: false,
            v6only: false,
        }
    }
}

/// One option write, applied in the engine context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcbOption {
    ReuseAddr(bool),
    KeepAlive(bool),
    Broadcast(bool),
    Ttl(u8),
    Tos(u8),
    NoDelay(bool),
    KeepIdle(u32),
    KeepIntvl(u32),
    KeepCnt(u32),
    MulticastTtl(u8),
    MulticastIf(Ipv4Addr),
    MulticastLoop(bool),
    NoChecksum(bool),
    V6Only(bool),
}

impl PcbOption {
    /// Options that only make sense on a TCP block.
    pub fn tcp_only(&self) -> bool {
        matches!(
            self,
            PcbOption::NoDelay(_)
                | PcbOption::KeepIdle(_)
                | PcbOption::KeepIntvl(_)
                | PcbOption::KeepCnt(_)
        )
    }

    /// Options that only make sense on a UDP block.
    pub fn udp_only(&self) -> bool {
        matches!(
            self,
            PcbOption::MulticastTtl(_)
                | PcbOption::MulticastIf(_)
                | PcbOption::MulticastLoop(_)
                | PcbOption::NoChecksum(_)
        )
    }
}

impl PcbOptions {
    pub fn apply(&mut self, opt: PcbOption) {
        match opt {
            PcbOption::ReuseAddr(v) => self.reuse_addr = v,
            PcbOption::KeepAlive(v) => self.keepalive = v,
            PcbOption::Broadcast(v) => self.broadcast = v,
            PcbOption::Ttl(v) => self.ttl = v,
            PcbOption::Tos(v) => self.tos = v,
            PcbOption::NoDelay(v) => self.nodelay = v,
            PcbOption::KeepIdle(v) => self.keep_idle = v,
            PcbOption::KeepIntvl(v) => self.keep_intvl = v,
            PcbOption::KeepCnt(v) => self.keep_cnt = v,
            PcbOption::MulticastTtl(v) => self.mcast_ttl = v,
            PcbOption::MulticastIf(v) => self.mcast_if = v,
            PcbOption::MulticastLoop(v) => self.mcast_loop = v,
            PcbOption::NoChecksum(v) => self.no_checksum = v,
            PcbOption::V6Only(v) => self.v6only = v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_admits() {
        let v4: IpAddr = "127.0.0.1".parse().unwrap();
        let v6: IpAddr = "::1".parse().unwrap();
        assert!(IpFamily::V4.admits(&v4));
        assert!(!IpFamily::V4.admits(&v6));
        assert!(IpFamily::Any.admits(&v4));
        assert!(IpFamily::Any.admits(&v6));
        assert!(IpFamily::V4.unspecified().is_unspecified());
    }

    #[test]
    fn test_fin_states() {
        assert!(TcpState::FinWait2.fin_sent());
        assert!(!TcpState::CloseWait.fin_sent());
        assert!(TcpState::Closing.fin_received());
        assert!(!TcpState::Established.fin_received());
        assert_eq!(TcpState::FinWait1.to_string(), "FIN_WAIT_1");
    }

    #[test]
    fn test_options_apply() {
        let mut opts = PcbOptions::default();
        opts.apply(PcbOption::NoDelay(true));
        opts.apply(PcbOption::Ttl(64));
        assert!(opts.nodelay);
        assert_eq!(opts.ttl, 64);
        assert!(PcbOption::KeepCnt(3).tcp_only());
        assert!(PcbOption::NoChecksum(true).udp_only());
        assert!(!PcbOption::Broadcast(true).tcp_only());
    }
}

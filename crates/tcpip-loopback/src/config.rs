//! Loopback engine sizing.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use netconn_core::env::env_get;

/// Default values
pub mod defaults {
    pub const MAX_PCBS: usize = 64;
    pub const MSS: usize = 1460;
    pub const SND_BUF: usize = 8192;
    pub const SND_QUEUELEN: usize = 32;
    pub const WND: usize = 8192;
    /// Slow-timer ticks a SYN may go unanswered
    pub const SYN_MAX_TICKS: u32 = 12;
    pub const DNS_TABLE_SIZE: usize = 4;
    pub const DNS_MAX_REQUESTS: usize = 4;
}

/// Limits of the loopback engine. The TCP numbers play the role of
/// MSS, send buffer, send queue length and receive window.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    pub max_pcbs: usize,
    pub mss: usize,
    pub snd_buf: usize,
    /// Segments a block may have queued before `tcp_write` says `Mem`
    pub snd_queuelen: usize,
    pub wnd: usize,
    pub syn_max_ticks: u32,
    pub dns_table_size: usize,
    /// Callers that may wait on one in-flight name
    pub dns_max_requests: usize,
    /// Addresses owned by the engine besides 127/8 and ::1
    pub local_addrs: Vec<IpAddr>,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            max_pcbs: defaults::MAX_PCBS,
            mss: defaults::MSS,
            snd_buf: defaults::SND_BUF,
            snd_queuelen: defaults::SND_QUEUELEN,
            wnd: defaults::WND,
            syn_max_ticks: defaults::SYN_MAX_TICKS,
            dns_table_size: defaults::DNS_TABLE_SIZE,
            dns_max_requests: defaults::DNS_MAX_REQUESTS,
            local_addrs: vec![
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            ],
        }
    }
}

impl LoopbackConfig {
    /// Defaults overridden by `NETCONN_LOOP_*` variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_pcbs: env_get("NETCONN_LOOP_MAX_PCBS", d.max_pcbs),
            mss: env_get("NETCONN_LOOP_MSS", d.mss),
            snd_buf: env_get("NETCONN_LOOP_SND_BUF", d.snd_buf),
            snd_queuelen: env_get("NETCONN_LOOP_SND_QUEUELEN", d.snd_queuelen),
            wnd: env_get("NETCONN_LOOP_WND", d.wnd),
            syn_max_ticks: env_get("NETCONN_LOOP_SYN_MAX_TICKS", d.syn_max_ticks),
            dns_table_size: env_get("NETCONN_LOOP_DNS_TABLE_SIZE", d.dns_table_size),
            dns_max_requests: env_get("NETCONN_LOOP_DNS_MAX_REQUESTS", d.dns_max_requests),
            local_addrs: d.local_addrs,
        }
    }

    pub fn max_pcbs(mut self, n: usize) -> Self {
        self.max_pcbs = n;
        self
    }

    pub fn snd_buf(mut self, bytes: usize) -> Self {
        self.snd_buf = bytes;
        self
    }

    pub fn wnd(mut self, bytes: usize) -> Self {
        self.wnd = bytes;
        self
    }

    pub fn mss(mut self, bytes: usize) -> Self {
        self.mss = bytes;
        self
    }

    pub fn local_addr(mut self, addr: IpAddr) -> Self {
        if !self.local_addrs.contains(&addr) {
            self.local_addrs.push(addr);
        }
        self
    }

    /// Whether `addr` is delivered locally.
    pub fn is_local(&self, addr: &IpAddr) -> bool {
        addr.is_loopback() || self.local_addrs.contains(addr)
    }
}

//! # tcpip-loopback: an in-process protocol engine
//!
//! `LoopbackEngine` implements `ProtocolEngine` for a host with only
//! local interfaces: every TCP connection has both ends in the same
//! engine, UDP and raw packets are delivered to local blocks, and
//! names resolve from in-memory tables.
//!
//! It is small enough to reason about in tests but keeps the behaviors
//! the API layer depends on:
//!
//! - receive windows and send buffers, so streams apply backpressure
//! - refused data, held and offered again
//! - FIN/RST handling, including reset on data for a closed receiver
//! - listen backlogs that hold SYNs until a slot frees up
//! - per-block poll timers driven by `tick()`
//!
//! Test hooks (`inject_mem_errors`, `reset_port`) reach the engine
//! through `ProtocolEngine::as_any_mut`.

pub mod config;
mod datagram;
mod dns;
mod table;
mod tcp;

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use netconn_core::error::{NetError, NetResult};
use netconn_core::pool::{MemPool, PoolStats};
use netconn_core::{kdebug, kinfo};
use tcpip_core::constants::{LOCAL_PORT_RANGE_END, LOCAL_PORT_RANGE_START};
use tcpip_core::{
    DnsHandler, IpFamily, Pbuf, PcbId, PcbKind, PcbOption, PcbOptions, ProtocolEngine,
    RawHandler, TcpCallbacks, TcpHandler, TcpState, TcpWriteFlags, UdpHandler,
};

pub use config::LoopbackConfig;
pub use datagram::UDP_MAX_PAYLOAD;
pub use dns::DNS_MAX_NAME_LENGTH;

use datagram::Datagram;
use dns::DnsTable;
use table::{Pcb, Proto, RawPcb, TcpPcb, UdpPcb};

pub struct LoopbackEngine {
    pub(crate) config: LoopbackConfig,
    ids: MemPool,
    pub(crate) pcbs: Vec<Option<Pcb>>,
    pub(crate) datagrams: VecDeque<Datagram>,
    /// Joined multicast groups with their join counts
    pub(crate) groups: HashMap<IpAddr, usize>,
    dns: DnsTable,
    next_port: u16,
    pub(crate) mem_faults: u32,
    mem_fault_skip: u32,
    ticks: u64,
}

impl LoopbackEngine {
    pub fn new(config: LoopbackConfig) -> Self {
        kinfo!(
            "loopback engine: {} pcbs, mss {}, snd_buf {}, wnd {}",
            config.max_pcbs,
            config.mss,
            config.snd_buf,
            config.wnd
        );
        let dns = DnsTable::new(config.dns_table_size, config.dns_max_requests);
        Self {
            ids: MemPool::new("pcb", config.max_pcbs),
            pcbs: Vec::new(),
            datagrams: VecDeque::new(),
            groups: HashMap::new(),
            dns,
            next_port: LOCAL_PORT_RANGE_START,
            mem_faults: 0,
            mem_fault_skip: 0,
            ticks: 0,
            config,
        }
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    // ── Test hooks ──

    /// Make the next `n` segment allocations (writes and FINs) fail with `Mem`.
    pub fn inject_mem_errors(&mut self, n: u32) {
        self.inject_mem_errors_after(0, n);
    }

    /// Let `ok` segment allocations succeed, then fail the next `n`.
    pub fn inject_mem_errors_after(&mut self, ok: u32, n: u32) {
        self.mem_fault_skip = ok;
        self.mem_faults = n;
    }

    /// Reset every connection with an end on local `port`.
    /// Returns how many blocks were torn down.
    pub fn reset_port(&mut self, port: u16) -> usize {
        let ends = self.tcp_ids(|pcb, t| {
            pcb.local_port == port
                && !matches!(t.state, TcpState::Listen | TcpState::Closed)
        });
        let mut killed = 0;
        for id in ends {
            let peer = self.tcp(id).and_then(|t| t.peer);
            for victim in std::iter::once(id).chain(peer) {
                if self.tcp(victim).is_some_and(|t| t.alive()) {
                    self.kill(victim, NetError::Reset);
                    killed += 1;
                }
            }
        }
        killed
    }

    /// Register a name answered asynchronously, like a remote server would.
    pub fn add_host(&mut self, name: &str, addr: IpAddr) {
        self.dns.add_zone(name, addr);
    }

    /// Register a name answered synchronously from the local host list.
    pub fn add_local_host(&mut self, name: &str, addr: IpAddr) {
        self.dns.add_local(name, addr);
    }

    /// Live control blocks of every kind.
    pub fn pcb_count(&self) -> usize {
        self.pcbs.iter().filter(|p| p.is_some()).count()
    }

    pub fn pcb_stats(&self) -> PoolStats {
        self.ids.stats()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    // ── Table ──

    pub(crate) fn pcb(&self, id: u32) -> Option<&Pcb> {
        self.pcbs.get(id as usize).and_then(Option::as_ref)
    }

    pub(crate) fn pcb_mut(&mut self, id: u32) -> Option<&mut Pcb> {
        self.pcbs.get_mut(id as usize).and_then(Option::as_mut)
    }

    pub(crate) fn tcp(&self, id: u32) -> Option<&TcpPcb> {
        self.pcb(id)?.tcp()
    }

    pub(crate) fn tcp_mut(&mut self, id: u32) -> Option<&mut TcpPcb> {
        self.pcb_mut(id)?.tcp_mut()
    }

    pub(crate) fn alloc_pcb(&mut self, pcb: Pcb) -> NetResult<u32> {
        let id = self.ids.alloc()?;
        let idx = id as usize;
        if self.pcbs.len() <= idx {
            self.pcbs.resize_with(idx + 1, || None);
        }
        self.pcbs[idx] = Some(pcb);
        Ok(id)
    }

    /// Remove a block from the table and unlink everything that points at it.
    pub(crate) fn free_pcb(&mut self, id: u32) -> Option<Pcb> {
        let pcb = self.pcbs.get_mut(id as usize)?.take()?;
        self.ids.free(id);

        if let Proto::Tcp(t) = &pcb.proto {
            if let Some(p) = t.peer {
                if let Some(pt) = self.tcp_mut(p) {
                    if pt.peer == Some(id) {
                        pt.peer = None;
                    }
                }
            }
            if t.backlog_pend {
                if let Some(l) = t.listener {
                    self.release_backlog(l);
                }
            }
            if t.state == TcpState::Listen {
                for child in self.tcp_ids(|_, c| c.listener == Some(id)) {
                    if let Some(c) = self.tcp_mut(child) {
                        c.listener = None;
                        c.backlog_pend = false;
                    }
                }
                // held SYNs now get their reset
                self.rearm_syns();
            }
        }
        Some(pcb)
    }

    fn release_backlog(&mut self, listener: u32) {
        if let Some(l) = self.tcp_mut(listener) {
            l.accepts_pending = l.accepts_pending.saturating_sub(1);
        }
        self.rearm_syns();
    }

    fn port_in_use(&self, kind: PcbKind, except: u32, ip: &IpAddr, port: u16, reuse: bool) -> bool {
        self.pcbs.iter().enumerate().any(|(i, slot)| {
            let Some(p) = slot else { return false };
            i as u32 != except
                && p.kind() == kind
                && p.local_port == port
                && (p.local_ip.is_unspecified() || ip.is_unspecified() || p.local_ip == *ip)
                && !(reuse && p.options.reuse_addr)
        })
    }

    pub(crate) fn ephemeral_port(&mut self, kind: PcbKind) -> NetResult<u16> {
        let span = (LOCAL_PORT_RANGE_END - LOCAL_PORT_RANGE_START) as usize + 1;
        for _ in 0..span {
            let port = self.next_port;
            self.next_port = if port == LOCAL_PORT_RANGE_END {
                LOCAL_PORT_RANGE_START
            } else {
                port + 1
            };
            let used = self
                .pcbs
                .iter()
                .flatten()
                .any(|p| p.kind() == kind && p.local_port == port);
            if !used {
                return Ok(port);
            }
        }
        Err(NetError::Use)
    }

    fn bind_common(&mut self, id: u32, addr: SocketAddr) -> NetResult<()> {
        let pcb = self.pcb(id).ok_or(NetError::Val)?;
        let kind = pcb.kind();
        let ip = addr.ip();
        if !pcb.admits(&ip) {
            return Err(NetError::Val);
        }
        if !ip.is_unspecified() && !ip.is_multicast() && !self.config.is_local(&ip) {
            return Err(NetError::Val);
        }
        let port = if addr.port() == 0 {
            self.ephemeral_port(kind)?
        } else {
            let reuse = pcb.options.reuse_addr;
            if self.port_in_use(kind, id, &ip, addr.port(), reuse) {
                return Err(NetError::Use);
            }
            addr.port()
        };
        if let Some(p) = self.pcb_mut(id) {
            p.local_ip = ip;
            p.local_port = port;
        }
        kdebug!("pcb#{} bound to {}", id, SocketAddr::new(ip, port));
        Ok(())
    }

    fn take_mem_fault(&mut self) -> NetResult<()> {
        if self.mem_fault_skip > 0 {
            self.mem_fault_skip -= 1;
            return Ok(());
        }
        if self.mem_faults > 0 {
            self.mem_faults -= 1;
            return Err(NetError::Mem);
        }
        Ok(())
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

impl ProtocolEngine for LoopbackEngine {
    // ── TCP ──

    fn tcp_new(&mut self, family: IpFamily) -> NetResult<PcbId> {
        let pcb = Pcb::new(family, Proto::Tcp(TcpPcb::new(self.config.wnd)));
        self.alloc_pcb(pcb).map(PcbId)
    }

    fn tcp_set_handler(&mut self, pcb: PcbId, handler: Option<Arc<dyn TcpHandler>>) {
        if let Some(t) = self.tcp_mut(pcb.0) {
            t.handler = handler;
        }
    }

    fn tcp_callbacks(&mut self, pcb: PcbId) -> TcpCallbacks {
        self.tcp(pcb.0).map(|t| t.callbacks).unwrap_or(TcpCallbacks::NONE)
    }

    fn tcp_set_callbacks(&mut self, pcb: PcbId, callbacks: TcpCallbacks) {
        if let Some(t) = self.tcp_mut(pcb.0) {
            t.callbacks = callbacks;
        }
    }

    fn tcp_set_poll_interval(&mut self, pcb: PcbId, interval: u8) {
        if let Some(t) = self.tcp_mut(pcb.0) {
            t.poll_interval = interval;
        }
    }

    fn tcp_bind(&mut self, pcb: PcbId, addr: SocketAddr) -> NetResult<()> {
        match self.tcp(pcb.0) {
            Some(t) if t.state == TcpState::Closed && t.alive() => {}
            _ => return Err(NetError::Val),
        }
        self.bind_common(pcb.0, addr)
    }

    fn tcp_connect(&mut self, pcb: PcbId, addr: SocketAddr) -> NetResult<()> {
        let id = pcb.0;
        let p = self.pcb(id).ok_or(NetError::Val)?;
        match p.tcp() {
            Some(t) if t.state == TcpState::Closed && t.alive() => {}
            Some(_) => return Err(NetError::IsConn),
            None => return Err(NetError::Val),
        }
        if !p.admits(&addr.ip()) || addr.ip().is_unspecified() {
            return Err(NetError::Val);
        }
        if !self.config.is_local(&addr.ip()) {
            return Err(NetError::Rte);
        }
        if p.local_port == 0 {
            let port = self.ephemeral_port(PcbKind::Tcp)?;
            if let Some(p) = self.pcb_mut(id) {
                p.local_port = port;
            }
        }
        let Some(p) = self.pcb_mut(id) else { return Err(NetError::Val) };
        if p.local_ip.is_unspecified() {
            p.local_ip = addr.ip();
        }
        p.remote = Some(addr);
        if let Some(t) = p.tcp_mut() {
            t.state = TcpState::SynSent;
            t.syn_due = true;
            t.syn_ticks = 0;
        }
        kdebug!("pcb#{} connecting to {}", id, addr);
        Ok(())
    }

    fn tcp_listen(&mut self, pcb: PcbId, backlog: u8) -> NetResult<()> {
        let id = pcb.0;
        match self.tcp(id).map(|t| t.state) {
            Some(TcpState::Closed) => {}
            Some(TcpState::Listen) => {
                self.tcp_backlog_set(pcb, backlog);
                return Ok(());
            }
            Some(_) => return Err(NetError::Closed),
            None => return Err(NetError::Val),
        }
        if self.pcb(id).is_some_and(|p| p.local_port == 0) {
            let port = self.ephemeral_port(PcbKind::Tcp)?;
            if let Some(p) = self.pcb_mut(id) {
                p.local_port = port;
            }
        }
        let p = self.pcb(id).ok_or(NetError::Val)?;
        let (ip, port, reuse) = (p.local_ip, p.local_port, p.options.reuse_addr);
        let clash = self
            .tcp_ids(|other, t| {
                t.state == TcpState::Listen
                    && other.local_port == port
                    && (other.local_ip.is_unspecified()
                        || ip.is_unspecified()
                        || other.local_ip == ip)
                    && !(reuse && other.options.reuse_addr)
            })
            .into_iter()
            .any(|other| other != id);
        if clash {
            return Err(NetError::Use);
        }
        if let Some(t) = self.tcp_mut(id) {
            t.state = TcpState::Listen;
            t.backlog = backlog.max(1);
            t.accepts_pending = 0;
        }
        kdebug!("pcb#{} listening on {}, backlog {}", id, SocketAddr::new(ip, port), backlog.max(1));
        Ok(())
    }

    fn tcp_backlog_set(&mut self, pcb: PcbId, backlog: u8) {
        if let Some(t) = self.tcp_mut(pcb.0) {
            if t.state == TcpState::Listen {
                t.backlog = backlog.max(1);
            }
        }
        self.rearm_syns();
    }

    fn tcp_backlog_delayed(&mut self, pcb: PcbId) {
        let Some(t) = self.tcp_mut(pcb.0) else { return };
        if t.backlog_pend {
            return;
        }
        let Some(l) = t.listener else { return };
        t.backlog_pend = true;
        if let Some(lt) = self.tcp_mut(l) {
            lt.accepts_pending = lt.accepts_pending.saturating_add(1);
        }
    }

    fn tcp_backlog_accepted(&mut self, pcb: PcbId) {
        let Some(t) = self.tcp_mut(pcb.0) else { return };
        if !t.backlog_pend {
            return;
        }
        t.backlog_pend = false;
        let listener = t.listener;
        if let Some(l) = listener {
            self.release_backlog(l);
        }
    }

    fn tcp_write(&mut self, pcb: PcbId, data: &[u8], _flags: TcpWriteFlags) -> NetResult<()> {
        let (snd_buf, queuelen) = (self.config.snd_buf, self.config.snd_queuelen);
        match self.tcp(pcb.0) {
            Some(t) if t.writable() => {
                if data.len() > snd_buf.saturating_sub(t.unsent.tot_len())
                    || t.unsent.segment_count() >= queuelen
                {
                    return Err(NetError::Mem);
                }
            }
            _ => return Err(NetError::Conn),
        }
        self.take_mem_fault()?;
        if let Some(t) = self.tcp_mut(pcb.0) {
            t.unsent.push_segment(data.to_vec());
        }
        Ok(())
    }

    fn tcp_output(&mut self, pcb: PcbId) -> NetResult<()> {
        match self.tcp(pcb.0) {
            Some(t) => match t.dead {
                Some(err) => Err(err),
                None => Ok(()),
            },
            None => Err(NetError::Closed),
        }
    }

    fn tcp_sndbuf(&self, pcb: PcbId) -> usize {
        match self.tcp(pcb.0) {
            Some(t) if t.writable() => self.config.snd_buf.saturating_sub(t.unsent.tot_len()),
            _ => 0,
        }
    }

    fn tcp_sndqueuelen(&self, pcb: PcbId) -> usize {
        self.tcp(pcb.0).map(|t| t.unsent.segment_count()).unwrap_or(0)
    }

    fn tcp_has_pending(&self, pcb: PcbId) -> bool {
        self.tcp(pcb.0)
            .is_some_and(|t| t.alive() && (!t.unsent.is_empty() || (t.fin_queued && !t.fin_sent)))
    }

    fn tcp_recved(&mut self, pcb: PcbId, len: usize) {
        let wnd = self.config.wnd;
        if let Some(t) = self.tcp_mut(pcb.0) {
            t.rcv_wnd = (t.rcv_wnd + len).min(wnd);
        }
    }

    fn tcp_close(&mut self, pcb: PcbId) -> NetResult<()> {
        self.close_tcp(pcb.0)
    }

    fn tcp_shutdown(&mut self, pcb: PcbId, shut_rx: bool, shut_tx: bool) -> NetResult<()> {
        self.shutdown_tcp(pcb.0, shut_rx, shut_tx)
    }

    fn tcp_abort(&mut self, pcb: PcbId) {
        kdebug!("{} aborted", pcb);
        self.abort_tcp(pcb.0);
    }

    fn tcp_state(&self, pcb: PcbId) -> TcpState {
        self.tcp(pcb.0).map(|t| t.state).unwrap_or(TcpState::Closed)
    }

    fn tcp_rx_closed(&self, pcb: PcbId) -> bool {
        self.tcp(pcb.0).map_or(true, |t| t.rx_closed)
    }

    // ── UDP ──

    fn udp_new(&mut self, family: IpFamily) -> NetResult<PcbId> {
        let pcb = Pcb::new(family, Proto::Udp(UdpPcb { handler: None }));
        self.alloc_pcb(pcb).map(PcbId)
    }

    fn udp_set_handler(&mut self, pcb: PcbId, handler: Option<Arc<dyn UdpHandler>>) {
        if let Some(Proto::Udp(u)) = self.pcb_mut(pcb.0).map(|p| &mut p.proto) {
            u.handler = handler;
        }
    }

    fn udp_bind(&mut self, pcb: PcbId, addr: SocketAddr) -> NetResult<()> {
        self.bind_common(pcb.0, addr)
    }

    fn udp_connect(&mut self, pcb: PcbId, addr: SocketAddr) -> NetResult<()> {
        let p = self.pcb(pcb.0).ok_or(NetError::Val)?;
        if !p.admits(&addr.ip()) {
            return Err(NetError::Val);
        }
        if p.local_port == 0 {
            let port = self.ephemeral_port(PcbKind::Udp)?;
            if let Some(p) = self.pcb_mut(pcb.0) {
                p.local_port = port;
            }
        }
        if let Some(p) = self.pcb_mut(pcb.0) {
            p.remote = Some(addr);
        }
        Ok(())
    }

    fn udp_disconnect(&mut self, pcb: PcbId) {
        if let Some(p) = self.pcb_mut(pcb.0) {
            p.remote = None;
        }
    }

    fn udp_send(&mut self, pcb: PcbId, data: Pbuf) -> NetResult<()> {
        let remote = self.pcb(pcb.0).ok_or(NetError::Val)?.remote;
        match remote {
            Some(dst) => self.udp_queue(pcb.0, data, dst),
            None => Err(NetError::Rte),
        }
    }

    fn udp_sendto(&mut self, pcb: PcbId, data: Pbuf, dst: SocketAddr) -> NetResult<()> {
        self.udp_queue(pcb.0, data, dst)
    }

    fn udp_remove(&mut self, pcb: PcbId) {
        self.free_pcb(pcb.0);
    }

    // ── RAW ──

    fn raw_new(&mut self, family: IpFamily, proto: u8) -> NetResult<PcbId> {
        let pcb = Pcb::new(family, Proto::Raw(RawPcb { proto, handler: None }));
        self.alloc_pcb(pcb).map(PcbId)
    }

    fn raw_set_handler(&mut self, pcb: PcbId, handler: Option<Arc<dyn RawHandler>>) {
        if let Some(Proto::Raw(r)) = self.pcb_mut(pcb.0).map(|p| &mut p.proto) {
            r.handler = handler;
        }
    }

    fn raw_bind(&mut self, pcb: PcbId, addr: IpAddr) -> NetResult<()> {
        let p = self.pcb_mut(pcb.0).ok_or(NetError::Val)?;
        if !p.admits(&addr) {
            return Err(NetError::Val);
        }
        p.local_ip = addr;
        Ok(())
    }

    fn raw_connect(&mut self, pcb: PcbId, addr: IpAddr) -> NetResult<()> {
        let p = self.pcb_mut(pcb.0).ok_or(NetError::Val)?;
        if !p.admits(&addr) {
            return Err(NetError::Val);
        }
        p.remote = Some(SocketAddr::new(addr, 0));
        Ok(())
    }

    fn raw_disconnect(&mut self, pcb: PcbId) {
        if let Some(p) = self.pcb_mut(pcb.0) {
            p.remote = None;
        }
    }

    fn raw_send(&mut self, pcb: PcbId, data: Pbuf) -> NetResult<()> {
        let remote = self.pcb(pcb.0).ok_or(NetError::Val)?.remote;
        match remote {
            Some(dst) => self.raw_queue(pcb.0, data, dst.ip()),
            None => Err(NetError::Rte),
        }
    }

    fn raw_sendto(&mut self, pcb: PcbId, data: Pbuf, dst: IpAddr) -> NetResult<()> {
        self.raw_queue(pcb.0, data, dst)
    }

    fn raw_remove(&mut self, pcb: PcbId) {
        self.free_pcb(pcb.0);
    }

    // ── Common ──

    fn local_addr(&self, pcb: PcbId) -> NetResult<SocketAddr> {
        self.pcb(pcb.0).map(Pcb::local).ok_or(NetError::Val)
    }

    fn remote_addr(&self, pcb: PcbId) -> NetResult<SocketAddr> {
        let p = self.pcb(pcb.0).ok_or(NetError::Val)?;
        if let Some(t) = p.tcp() {
            if matches!(t.state, TcpState::Closed | TcpState::Listen) {
                return Err(NetError::Conn);
            }
        }
        p.remote.ok_or(NetError::Conn)
    }

    fn options(&self, pcb: PcbId) -> NetResult<PcbOptions> {
        self.pcb(pcb.0).map(|p| p.options).ok_or(NetError::Val)
    }

    fn set_option(&mut self, pcb: PcbId, opt: PcbOption) -> NetResult<()> {
        let p = self.pcb_mut(pcb.0).ok_or(NetError::Val)?;
        p.options.apply(opt);
        Ok(())
    }

    fn join_group(&mut self, ifaddr: IpAddr, group: IpAddr) -> NetResult<()> {
        self.join(ifaddr, group)
    }

    fn leave_group(&mut self, ifaddr: IpAddr, group: IpAddr) -> NetResult<()> {
        self.leave(ifaddr, group)
    }

    fn dns_gethostbyname(
        &mut self,
        name: &str,
        family: IpFamily,
        handler: Arc<dyn DnsHandler>,
    ) -> NetResult<Option<IpAddr>> {
        self.dns.lookup(name, family, handler)
    }

    // ── Driving ──

    fn process(&mut self) -> bool {
        let mut progress = self.handshake();
        progress |= self.transmit();
        progress |= self.deliver();
        progress |= self.deliver_datagrams();
        progress |= self.reap();
        progress
    }

    fn tick(&mut self) {
        self.ticks += 1;
        self.tcp_tick();
        self.dns.tick();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests;

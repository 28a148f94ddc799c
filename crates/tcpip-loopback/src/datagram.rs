//! UDP and raw delivery.
//!
//! Sends are queued and delivered by `process()`, so receive handlers
//! never run inside the sender's engine call.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use netconn_core::error::{NetError, NetResult};
use netconn_core::ktrace;
use tcpip_core::{Pbuf, PcbId, PcbKind};

use crate::table::Proto;
use crate::LoopbackEngine;

/// UDP payload limit over IPv4
pub const UDP_MAX_PAYLOAD: usize = 65_507;

pub(crate) enum Carrier {
    Udp,
    Raw(u8),
}

pub(crate) struct Datagram {
    pub carrier: Carrier,
    pub from: u32,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub data: Pbuf,
    pub mcast_loop: bool,
}

fn is_broadcast(addr: &IpAddr) -> bool {
    matches!(addr, IpAddr::V4(v4) if v4.is_broadcast())
}

/// The source address used when the block is bound to a wildcard.
fn source_for(dst: &IpAddr) -> IpAddr {
    match dst {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
    }
}

impl LoopbackEngine {
    /// Check a destination and pick a source address for a send from `id`.
    fn route(&self, id: u32, dst: &IpAddr) -> NetResult<(IpAddr, bool)> {
        let pcb = self.pcb(id).ok_or(NetError::Val)?;
        if !pcb.admits(dst) {
            return Err(NetError::Val);
        }
        if is_broadcast(dst) && !pcb.options.broadcast {
            return Err(NetError::Val);
        }
        if !(self.config.is_local(dst) || dst.is_multicast() || is_broadcast(dst)) {
            return Err(NetError::Rte);
        }
        let src = if pcb.local_ip.is_unspecified() {
            source_for(dst)
        } else {
            pcb.local_ip
        };
        Ok((src, pcb.options.mcast_loop))
    }

    pub(crate) fn udp_queue(&mut self, id: u32, data: Pbuf, dst: SocketAddr) -> NetResult<()> {
        if data.tot_len() > UDP_MAX_PAYLOAD {
            return Err(NetError::Mem);
        }
        let (src_ip, mcast_loop) = self.route(id, &dst.ip())?;
        if self.pcb(id).is_some_and(|p| p.local_port == 0) {
            let port = self.ephemeral_port(PcbKind::Udp)?;
            if let Some(p) = self.pcb_mut(id) {
                p.local_port = port;
            }
        }
        let port = self.pcb(id).map(|p| p.local_port).unwrap_or(0);
        ktrace!("pcb#{} udp {} bytes -> {}", id, data.tot_len(), dst);
        self.datagrams.push_back(Datagram {
            carrier: Carrier::Udp,
            from: id,
            src: SocketAddr::new(src_ip, port),
            dst,
            data,
            mcast_loop,
        });
        Ok(())
    }

    pub(crate) fn raw_queue(&mut self, id: u32, data: Pbuf, dst: IpAddr) -> NetResult<()> {
        let proto = match self.pcb(id).map(|p| &p.proto) {
            Some(Proto::Raw(r)) => r.proto,
            _ => return Err(NetError::Val),
        };
        let (src_ip, mcast_loop) = self.route(id, &dst)?;
        self.datagrams.push_back(Datagram {
            carrier: Carrier::Raw(proto),
            from: id,
            src: SocketAddr::new(src_ip, 0),
            dst: SocketAddr::new(dst, 0),
            data,
            mcast_loop,
        });
        Ok(())
    }

    pub(crate) fn deliver_datagrams(&mut self) -> bool {
        let mut progress = false;
        while let Some(dg) = self.datagrams.pop_front() {
            progress = true;
            match dg.carrier {
                Carrier::Udp => self.deliver_udp(dg),
                Carrier::Raw(proto) => self.deliver_raw(proto, dg),
            }
        }
        progress
    }

    fn deliver_udp(&mut self, dg: Datagram) {
        let dst_ip = dg.dst.ip();
        let group = dst_ip.is_multicast();
        let broadcast = is_broadcast(&dst_ip);
        if group && (!dg.mcast_loop || !self.groups.contains_key(&dst_ip)) {
            return;
        }

        let mut matches: Vec<(u32, bool)> = Vec::new();
        for (i, slot) in self.pcbs.iter().enumerate() {
            let Some(pcb) = slot else { continue };
            if !matches!(pcb.proto, Proto::Udp(_)) || pcb.local_port != dg.dst.port() {
                continue;
            }
            if !pcb.admits(&dst_ip) {
                continue;
            }
            let addr_ok = if group || broadcast {
                pcb.local_ip.is_unspecified() || pcb.local_ip == dst_ip
            } else {
                pcb.accepts_dst(&dst_ip)
            };
            let connected = pcb.remote.is_some();
            if addr_ok && pcb.remote.map_or(true, |r| r == dg.src) {
                matches.push((i as u32, connected));
            }
        }
        if !(group || broadcast) {
            // unicast goes to one block, connected ones first
            let best = matches
                .iter()
                .find(|(_, connected)| *connected)
                .or_else(|| matches.first())
                .copied();
            matches = best.into_iter().collect();
        }
        if matches.is_empty() {
            ktrace!("pcb#{} udp to {} dropped, no receiver", dg.from, dg.dst);
        }

        for (id, _) in matches {
            let handler = match self.pcb(id).map(|p| &p.proto) {
                Some(Proto::Udp(u)) => u.handler.clone(),
                _ => None,
            };
            if let Some(h) = handler {
                h.recv(PcbId(id), dg.data.clone(), dg.src, dg.dst);
            }
        }
    }

    fn deliver_raw(&mut self, proto: u8, dg: Datagram) {
        let (src, dst) = (dg.src.ip(), dg.dst.ip());
        ktrace!("pcb#{} raw proto {} -> {}", dg.from, proto, dst);
        if dst.is_multicast() && (!dg.mcast_loop || !self.groups.contains_key(&dst)) {
            return;
        }
        let targets: Vec<u32> = self
            .pcbs
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                let pcb = slot.as_ref()?;
                let Proto::Raw(r) = &pcb.proto else { return None };
                let ok = r.proto == proto
                    && pcb.accepts_dst(&dst)
                    && pcb.remote.map_or(true, |r| r.ip() == src);
                ok.then_some(i as u32)
            })
            .collect();

        for id in targets {
            let handler = match self.pcb(id).map(|p| &p.proto) {
                Some(Proto::Raw(r)) => r.handler.clone(),
                _ => None,
            };
            if let Some(h) = handler {
                if h.recv(PcbId(id), &dg.data, src, dst) {
                    break;
                }
            }
        }
    }

    pub(crate) fn join(&mut self, ifaddr: IpAddr, group: IpAddr) -> NetResult<()> {
        if !group.is_multicast() {
            return Err(NetError::Val);
        }
        if !ifaddr.is_unspecified() && !self.config.is_local(&ifaddr) {
            return Err(NetError::Val);
        }
        *self.groups.entry(group).or_insert(0) += 1;
        Ok(())
    }

    pub(crate) fn leave(&mut self, ifaddr: IpAddr, group: IpAddr) -> NetResult<()> {
        if !ifaddr.is_unspecified() && !self.config.is_local(&ifaddr) {
            return Err(NetError::Val);
        }
        match self.groups.get_mut(&group) {
            Some(n) if *n > 1 => {
                *n -= 1;
                Ok(())
            }
            Some(_) => {
                self.groups.remove(&group);
                Ok(())
            }
            None => Err(NetError::Val),
        }
    }
}

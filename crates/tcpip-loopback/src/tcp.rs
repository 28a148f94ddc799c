//! TCP segment flow between the two ends of a loopback connection.
//!
//! Sending moves bytes from the sender's unsent queue straight into the
//! peer's inbox, bounded by the peer's receive window. Loopback never
//! loses a segment, so the peer acknowledges on arrival and the sender
//! sees its `sent` callback in the same pass.

use std::net::SocketAddr;

use netconn_core::error::{NetError, NetResult};
use netconn_core::{kdebug, ktrace};
use tcpip_core::{PcbId, TcpCallbacks, TcpState};

use crate::table::{Pcb, Proto, Segment, TcpPcb};
use crate::LoopbackEngine;

impl LoopbackEngine {
    /// Ids of live TCP blocks matching `pred`.
    pub(crate) fn tcp_ids<F>(&self, mut pred: F) -> Vec<u32>
    where
        F: FnMut(&Pcb, &TcpPcb) -> bool,
    {
        self.pcbs
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                let pcb = slot.as_ref()?;
                let t = pcb.tcp()?;
                (t.alive() && pred(pcb, t)).then_some(i as u32)
            })
            .collect()
    }

    /// Tear a block down. Its error callback fires on the next `process()`.
    pub(crate) fn kill(&mut self, id: u32, err: NetError) {
        let peer = match self.tcp_mut(id) {
            Some(t) if t.alive() => {
                kdebug!("pcb#{} torn down: {}", id, err);
                t.dead = Some(err);
                t.state = TcpState::Closed;
                t.unsent = Default::default();
                t.inbox.clear();
                t.peer.take()
            }
            _ => return,
        };
        if let Some(p) = peer {
            if let Some(pt) = self.tcp_mut(p) {
                if pt.peer == Some(id) {
                    pt.peer = None;
                }
            }
        }
    }

    /// Full close of a TCP block.
    pub(crate) fn close_tcp(&mut self, id: u32) -> NetResult<()> {
        let wnd = self.config.wnd;
        let Some(t) = self.tcp(id) else {
            return Err(NetError::Val);
        };
        if let Some(err) = t.dead {
            return Err(err);
        }
        let (state, peer) = (t.state, t.peer);
        let unread = t.rcv_wnd != wnd || t.inbox.iter().any(|s| matches!(s, Segment::Data(_)));

        match state {
            TcpState::Closed | TcpState::Listen | TcpState::SynSent => {
                self.free_pcb(id);
                Ok(())
            }
            TcpState::Established | TcpState::CloseWait | TcpState::SynRcvd => {
                // unread data turns the close into a reset
                if unread {
                    kdebug!("pcb#{} closed with unread data, resetting", id);
                    if let Some(p) = peer {
                        self.kill(p, NetError::Reset);
                    }
                    self.free_pcb(id);
                    return Ok(());
                }
                self.take_mem_fault()?;
                if let Some(t) = self.tcp_mut(id) {
                    t.queue_fin();
                    t.rx_closed = true;
                    t.user_closed = true;
                }
                Ok(())
            }
            TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::Closing
            | TcpState::LastAck
            | TcpState::TimeWait => {
                if let Some(t) = self.tcp_mut(id) {
                    t.rx_closed = true;
                    t.user_closed = true;
                }
                Ok(())
            }
        }
    }

    pub(crate) fn shutdown_tcp(&mut self, id: u32, shut_rx: bool, shut_tx: bool) -> NetResult<()> {
        let wnd = self.config.wnd;
        let Some(t) = self.tcp(id) else {
            return Err(NetError::Val);
        };
        if let Some(err) = t.dead {
            return Err(err);
        }
        let state = t.state;
        if state == TcpState::Listen {
            return Err(NetError::Conn);
        }
        if shut_rx {
            if shut_tx {
                return self.close_tcp(id);
            }
            if let Some(t) = self.tcp_mut(id) {
                t.rx_closed = true;
                t.inbox.clear();
                t.rcv_wnd = wnd;
            }
        }
        if shut_tx {
            if !matches!(
                state,
                TcpState::SynRcvd | TcpState::Established | TcpState::CloseWait
            ) {
                return Err(NetError::Conn);
            }
            self.take_mem_fault()?;
            if let Some(t) = self.tcp_mut(id) {
                t.queue_fin();
            }
        }
        Ok(())
    }

    pub(crate) fn find_listener(&self, dst: &SocketAddr) -> Option<u32> {
        let candidates = self.tcp_ids(|pcb, t| {
            t.state == TcpState::Listen
                && pcb.local_port == dst.port()
                && pcb.accepts_dst(&dst.ip())
        });
        // an exact address beats a wildcard
        candidates
            .iter()
            .copied()
            .find(|&id| self.pcb(id).is_some_and(|p| p.local_ip == dst.ip()))
            .or_else(|| candidates.first().copied())
    }

    /// Complete pending active opens against their listeners.
    pub(crate) fn handshake(&mut self) -> bool {
        let mut progress = false;
        let connecting = self.tcp_ids(|_, t| t.state == TcpState::SynSent && t.syn_due);

        for cid in connecting {
            let Some(client) = self.pcb(cid) else { continue };
            let Some(dst) = client.remote else { continue };
            let src = client.local();

            let Some(lid) = self.find_listener(&dst) else {
                kdebug!("pcb#{} connect to {} refused", cid, dst);
                self.kill(cid, NetError::Reset);
                progress = true;
                continue;
            };
            let (family, options, full) = match self.pcb(lid) {
                Some(l) => {
                    let lt = l.tcp().map(|t| t.accepts_pending >= t.backlog).unwrap_or(true);
                    (l.family, l.options, lt)
                }
                None => continue,
            };
            if let Some(t) = self.tcp_mut(cid) {
                t.syn_due = false;
            }
            if full {
                ktrace!("pcb#{} SYN held, backlog of pcb#{} full", cid, lid);
                continue;
            }

            let mut server = TcpPcb::new(self.config.wnd);
            server.state = TcpState::Established;
            server.peer = Some(cid);
            server.listener = Some(lid);
            let mut pcb = Pcb::new(family, Proto::Tcp(server));
            pcb.local_ip = dst.ip();
            pcb.local_port = dst.port();
            pcb.remote = Some(src);
            pcb.options = options;

            let sid = match self.alloc_pcb(pcb) {
                Ok(sid) => sid,
                Err(e) => {
                    // no block for the passive side; the SYN retries on the next tick
                    if let Some(h) = self.accept_handler(lid) {
                        let _ = h.accept(self, PcbId(lid), Err(e));
                    }
                    progress = true;
                    continue;
                }
            };
            if let Some(t) = self.tcp_mut(cid) {
                t.state = TcpState::Established;
                t.peer = Some(sid);
            }
            kdebug!("pcb#{} {} -> {} established as pcb#{}", cid, src, dst, sid);
            progress = true;

            let connected = self.tcp(cid).and_then(|t| t.handler.clone());
            if let Some(h) = connected {
                h.connected(self, PcbId(cid));
            }

            let accepted = match self.accept_handler(lid) {
                Some(h) => h.accept(self, PcbId(lid), Ok(PcbId(sid))).is_ok(),
                None => false,
            };
            if !accepted && self.tcp(sid).is_some_and(|t| t.alive()) {
                self.abort_tcp(sid);
            }
        }
        progress
    }

    fn accept_handler(&self, lid: u32) -> Option<std::sync::Arc<dyn tcpip_core::TcpHandler>> {
        let t = self.tcp(lid)?;
        if t.alive() && t.callbacks.contains(TcpCallbacks::ACCEPT) {
            t.handler.clone()
        } else {
            None
        }
    }

    /// Reset the connection and free the block without a callback.
    pub(crate) fn abort_tcp(&mut self, id: u32) {
        let peer = self.tcp(id).and_then(|t| t.peer);
        if let Some(p) = peer {
            self.kill(p, NetError::Reset);
        }
        self.free_pcb(id);
    }

    /// Move unsent data and FINs across connections.
    pub(crate) fn transmit(&mut self) -> bool {
        let mss = self.config.mss.max(1);
        let mut progress = false;
        let mut acked: Vec<(u32, usize)> = Vec::new();
        let senders = self.tcp_ids(|_, t| {
            t.peer.is_some() && (!t.unsent.is_empty() || (t.fin_queued && !t.fin_sent))
        });

        for sid in senders {
            let mut sent = 0;
            loop {
                let Some(pid) = self.tcp(sid).filter(|t| t.alive()).and_then(|t| t.peer) else {
                    break;
                };
                let (window, rx_closed) = match self.tcp(pid) {
                    Some(p) => (p.rcv_wnd, p.rx_closed),
                    None => break,
                };
                let pending = self.tcp(sid).map(|t| t.unsent.tot_len()).unwrap_or(0);
                if pending == 0 {
                    break;
                }
                if rx_closed {
                    kdebug!("pcb#{} data for closed receiver pcb#{}, resetting", sid, pid);
                    self.kill(pid, NetError::Abort);
                    self.kill(sid, NetError::Reset);
                    progress = true;
                    break;
                }
                let n = pending.min(window).min(mss);
                if n == 0 {
                    break;
                }
                let Some(seg) = self.tcp_mut(sid).map(|t| t.unsent.split_to(n)) else { break };
                if let Some(p) = self.tcp_mut(pid) {
                    p.rcv_wnd -= n;
                    p.inbox.push_back(Segment::Data(seg));
                }
                ktrace!("pcb#{} -> pcb#{}: {} bytes", sid, pid, n);
                sent += n;
                progress = true;
            }
            if sent > 0 {
                acked.push((sid, sent));
            }

            let fin_ready = self.tcp(sid).is_some_and(|t| {
                t.alive() && t.unsent.is_empty() && t.fin_queued && !t.fin_sent
            });
            if fin_ready {
                let Some(pid) = self.tcp(sid).and_then(|t| t.peer) else { continue };
                if let Some(t) = self.tcp_mut(sid) {
                    t.fin_acked();
                }
                if let Some(p) = self.tcp_mut(pid) {
                    p.fin_received();
                    p.inbox.push_back(Segment::Fin);
                }
                ktrace!("pcb#{} -> pcb#{}: FIN", sid, pid);
                progress = true;
            }
        }

        for (sid, len) in acked {
            let handler = self
                .tcp(sid)
                .filter(|t| t.alive() && t.callbacks.contains(TcpCallbacks::SENT))
                .and_then(|t| t.handler.clone());
            if let Some(h) = handler {
                h.sent(self, PcbId(sid), len);
            }
        }
        progress
    }

    /// Hand inbound segments to receive handlers.
    pub(crate) fn deliver(&mut self) -> bool {
        let wnd = self.config.wnd;
        let mut progress = false;
        let receivers = self.tcp_ids(|_, t| !t.inbox.is_empty());

        for rid in receivers {
            loop {
                let Some(t) = self.tcp_mut(rid) else { break };
                if !t.alive() {
                    break;
                }
                let Some(seg) = t.inbox.pop_front() else { break };
                let handler = if t.callbacks.contains(TcpCallbacks::RECV) {
                    t.handler.clone()
                } else {
                    None
                };
                let Some(h) = handler else {
                    // nobody reads: discard and reopen the window
                    if let Segment::Data(p) = seg {
                        t.rcv_wnd = (t.rcv_wnd + p.tot_len()).min(wnd);
                    }
                    progress = true;
                    continue;
                };
                let data = match seg {
                    Segment::Data(p) => Some(p),
                    Segment::Fin => None,
                };
                match h.recv(self, PcbId(rid), data) {
                    Ok(()) => progress = true,
                    Err(refused) => {
                        if let Some(t) = self.tcp_mut(rid) {
                            let seg = match refused.0 {
                                Some(p) => Segment::Data(p),
                                None => Segment::Fin,
                            };
                            t.inbox.push_front(seg);
                        }
                        break;
                    }
                }
            }
        }
        progress
    }

    /// Free torn-down and finished blocks, firing error callbacks.
    pub(crate) fn reap(&mut self) -> bool {
        let mut progress = false;
        for id in 0..self.pcbs.len() as u32 {
            let Some(t) = self.tcp(id) else { continue };
            if let Some(err) = t.dead {
                let handler = if t.callbacks.contains(TcpCallbacks::ERR) {
                    t.handler.clone()
                } else {
                    None
                };
                self.free_pcb(id);
                if let Some(h) = handler {
                    h.err(err);
                }
                progress = true;
            } else if t.reapable() {
                ktrace!("pcb#{} finished in {}", id, t.state);
                self.free_pcb(id);
                progress = true;
            }
        }
        progress
    }

    /// Slow-timer work for TCP: polls and SYN retries.
    pub(crate) fn tcp_tick(&mut self) {
        let syn_max = self.config.syn_max_ticks;
        for id in self.tcp_ids(|_, t| t.state == TcpState::SynSent) {
            if let Some(t) = self.tcp_mut(id) {
                t.syn_ticks += 1;
                t.syn_due = true;
                if t.syn_ticks > syn_max {
                    kdebug!("pcb#{} SYN unanswered after {} ticks", id, syn_max);
                    self.kill(id, NetError::Abort);
                }
            }
        }

        let mut due = Vec::new();
        for id in self.tcp_ids(|_, t| t.callbacks.contains(TcpCallbacks::POLL)) {
            if let Some(t) = self.tcp_mut(id) {
                t.poll_tmr = t.poll_tmr.saturating_add(1);
                if t.poll_tmr >= t.poll_interval.max(1) {
                    t.poll_tmr = 0;
                    if let Some(h) = t.handler.clone() {
                        due.push((id, h));
                    }
                }
            }
        }
        for (id, h) in due {
            if self.tcp(id).is_some_and(|t| t.alive()) {
                h.poll(self, PcbId(id));
            }
        }
    }

    /// Re-arm held SYNs, e.g. after a backlog slot was freed.
    pub(crate) fn rearm_syns(&mut self) {
        for id in self.tcp_ids(|_, t| t.state == TcpState::SynSent) {
            if let Some(t) = self.tcp_mut(id) {
                t.syn_due = true;
            }
        }
    }
}

//! Engine callbacks of a connection.
//!
//! Each control block carries an adapter holding its connection. The
//! engine calls the adapter from `process()`/`tick()`, so these run in
//! the engine context like the handlers in `api_msg`.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use netconn_core::error::{NetError, NetResult};
use netconn_core::{kdebug, ktrace, kwarn};
use tcpip_core::{
    Pbuf, PcbId, ProtocolEngine, RawHandler, Refused, TcpCallbacks, TcpHandler, UdpHandler,
};

use crate::api_msg::{close_internal, close_timeout, writemore};
use crate::conn::{
    flag, AcceptMsg, ConnEvent, ConnInner, ConnState, EngineSide, NetconnType, RecvMsg,
};
use crate::msg::ApiReply;
use crate::netbuf::Netbuf;

pub(crate) struct TcpAdapter(pub Arc<ConnInner>);
pub(crate) struct UdpAdapter(pub Arc<ConnInner>);
pub(crate) struct RawAdapter(pub Arc<ConnInner>);

pub(crate) fn tcp_adapter(conn: &Arc<ConnInner>) -> Arc<dyn TcpHandler> {
    Arc::new(TcpAdapter(Arc::clone(conn)))
}

pub(crate) fn udp_adapter(conn: &Arc<ConnInner>) -> Arc<dyn UdpHandler> {
    Arc::new(UdpAdapter(Arc::clone(conn)))
}

pub(crate) fn raw_adapter(conn: &Arc<ConnInner>) -> Arc<dyn RawHandler> {
    Arc::new(RawAdapter(Arc::clone(conn)))
}

/// Attach a stream block to `conn` with the data callbacks armed.
pub(crate) fn setup_tcp(engine: &mut dyn ProtocolEngine, conn: &Arc<ConnInner>, pcb: PcbId) {
    engine.tcp_set_handler(pcb, Some(tcp_adapter(conn)));
    engine.tcp_set_callbacks(pcb, TcpCallbacks::DATA);
    engine.tcp_set_poll_interval(pcb, conn.config().tcp_poll_interval);
}

/// Whether the send buffer has drained below both low-water marks.
fn write_space(engine: &dyn ProtocolEngine, conn: &ConnInner, pcb: PcbId) -> bool {
    engine.tcp_sndbuf(pcb) > conn.config().tcp_sndlowat
        && engine.tcp_sndqueuelen(pcb) < conn.config().tcp_sndqueuelowat
}

/// Continue whatever operation is parked on the connection.
fn resume(engine: &mut dyn ProtocolEngine, conn: &Arc<ConnInner>, side: &mut EngineSide) {
    match side.state {
        ConnState::Write(_) => writemore(engine, conn, side),
        ConnState::Close(_) => close_internal(engine, conn, side),
        _ => {}
    }
}

impl TcpHandler for TcpAdapter {
    fn recv(
        &self,
        engine: &mut dyn ProtocolEngine,
        pcb: PcbId,
        data: Option<Pbuf>,
    ) -> Result<(), Refused> {
        let conn = &self.0;
        let Some(mbox) = conn.recvmbox() else {
            // reading side already closed, acknowledge and drop
            if let Some(p) = &data {
                engine.tcp_recved(pcb, p.tot_len());
            }
            return Ok(());
        };
        let len = data.as_ref().map_or(0, Pbuf::tot_len);
        let msg = match data {
            Some(p) => RecvMsg::Segment(p),
            None => RecvMsg::Eof,
        };
        match mbox.trypost(msg) {
            Ok(()) => {
                conn.recv_avail.fetch_add(len, Ordering::AcqRel);
                conn.event(ConnEvent::RcvPlus, len);
                Ok(())
            }
            Err(msg) => {
                kdebug!("conn {}: receive queue full, {} bytes refused", conn.id(), len);
                Err(Refused(match msg {
                    RecvMsg::Segment(p) => Some(p),
                    _ => None,
                }))
            }
        }
    }

    fn sent(&self, engine: &mut dyn ProtocolEngine, pcb: PcbId, len: usize) {
        let conn = &self.0;
        let mut side = conn.side();
        resume(engine, conn, &mut side);
        if let Some(pcb) = side.pcb {
            if write_space(engine, conn, pcb) {
                conn.clear_flag(flag::CHECK_WRITESPACE);
                conn.event(ConnEvent::SendPlus, len);
            }
        } else {
            ktrace!("conn {}: sent on released {}", conn.id(), pcb);
        }
    }

    fn poll(&self, engine: &mut dyn ProtocolEngine, _pcb: PcbId) {
        let conn = &self.0;
        let mut side = conn.side();
        if let ConnState::Close(op) = &mut side.state {
            if close_timeout(conn).is_none() && op.polls_left > 0 {
                op.polls_left -= 1;
            }
        }
        resume(engine, conn, &mut side);
        if conn.has_flag(flag::CHECK_WRITESPACE) {
            if let Some(pcb) = side.pcb {
                if write_space(engine, conn, pcb) {
                    conn.clear_flag(flag::CHECK_WRITESPACE);
                    conn.event(ConnEvent::SendPlus, 0);
                }
            }
        }
    }

    fn err(&self, err: NetError) {
        let conn = &self.0;
        kwarn!("conn {}: stream failed: {}", conn.id(), err);
        let old = {
            let mut side = conn.side();
            side.pcb = None;
            conn.set_pending_err(err);
            conn.set_flag(flag::MBOXCLOSED);
            std::mem::replace(&mut side.state, ConnState::None)
        };

        conn.event(ConnEvent::Error, 0);
        conn.event(ConnEvent::RcvPlus, 0);
        conn.event(ConnEvent::SendPlus, 0);

        // wake blocked readers; a full queue already wakes them
        if let Some(mbox) = conn.recvmbox() {
            let _ = mbox.trypost(RecvMsg::Error(err));
        }
        if let Some(mbox) = conn.acceptmbox() {
            let _ = mbox.trypost(AcceptMsg::Error(err));
        }

        conn.clear_flag(flag::IN_NONBLOCKING_CONNECT);
        match old {
            // the block is gone, which is what the close wanted
            ConnState::Close(op) => op.done.complete(Ok(ApiReply::Done)),
            other => other.complete(Err(err)),
        }
    }

    fn accept(
        &self,
        engine: &mut dyn ProtocolEngine,
        _listener: PcbId,
        new: NetResult<PcbId>,
    ) -> NetResult<()> {
        let conn = &self.0;
        let Some(mbox) = conn.acceptmbox() else {
            return Err(NetError::Val);
        };

        let newpcb = match new {
            Ok(pcb) => pcb,
            Err(e) => {
                kdebug!("conn {}: inbound connection failed: {}", conn.id(), e);
                if mbox.trypost(AcceptMsg::Error(NetError::Abort)).is_ok() {
                    conn.event(ConnEvent::RcvPlus, 0);
                }
                return Err(NetError::Val);
            }
        };

        let child = match ConnInner::new(&conn.env, conn.ty(), conn.family(), conn.callback()) {
            Ok(child) => child,
            Err(e) => {
                kwarn!("conn {}: no connection for {}: {}", conn.id(), newpcb, e);
                if mbox.trypost(AcceptMsg::Error(NetError::Abort)).is_ok() {
                    conn.event(ConnEvent::RcvPlus, 0);
                }
                return Err(NetError::Mem);
            }
        };

        child.side().pcb = Some(newpcb);
        setup_tcp(engine, &child, newpcb);
        engine.tcp_backlog_delayed(newpcb);

        if mbox.trypost(AcceptMsg::Conn(Arc::clone(&child))).is_err() {
            kdebug!("conn {}: accept queue full, dropping {}", conn.id(), newpcb);
            engine.tcp_set_handler(newpcb, None);
            engine.tcp_set_callbacks(newpcb, TcpCallbacks::NONE);
            child.side().pcb = None;
            if let Some(m) = child.take_recvmbox() {
                m.close();
            }
            return Err(NetError::Mem);
        }
        ktrace!("conn {}: queued conn {} on {}", conn.id(), child.id(), newpcb);
        conn.event(ConnEvent::RcvPlus, 0);
        Ok(())
    }

    fn connected(&self, engine: &mut dyn ProtocolEngine, pcb: PcbId) {
        let conn = &self.0;
        let state = {
            let mut side = conn.side();
            if !matches!(side.state, ConnState::Connect(_)) {
                return;
            }
            setup_tcp(engine, conn, pcb);
            std::mem::replace(&mut side.state, ConnState::None)
        };
        conn.clear_flag(flag::IN_NONBLOCKING_CONNECT);
        kdebug!("conn {}: connected on {}", conn.id(), pcb);
        conn.event(ConnEvent::SendPlus, 0);
        state.complete(Ok(ApiReply::Done));
    }
}

impl UdpHandler for UdpAdapter {
    fn recv(&self, _pcb: PcbId, data: Pbuf, src: SocketAddr, dst: SocketAddr) {
        deliver(&self.0, data, src, dst);
    }
}

impl RawHandler for RawAdapter {
    fn recv(&self, _pcb: PcbId, data: &Pbuf, src: IpAddr, dst: IpAddr) -> bool {
        let conn = &self.0;
        let proto = match conn.ty() {
            NetconnType::Raw(proto) => u16::from(proto),
            _ => 0,
        };
        deliver(
            conn,
            data.clone(),
            SocketAddr::new(src, proto),
            SocketAddr::new(dst, 0),
        );
        // other raw blocks of the protocol still get the packet
        false
    }
}

/// Queue one datagram, dropping it if the receive budget or the queue
/// is exhausted.
fn deliver(conn: &ConnInner, data: Pbuf, src: SocketAddr, dst: SocketAddr) {
    let Some(mbox) = conn.recvmbox() else { return };
    let len = data.tot_len();
    if conn.recv_avail().saturating_add(len) > conn.recv_bufsize() {
        kdebug!("conn {}: receive budget exhausted, {} bytes dropped", conn.id(), len);
        return;
    }
    let buf = Netbuf::from_pbuf(data, Some(src), Some(dst));
    if mbox.trypost(RecvMsg::Datagram(buf)).is_err() {
        kdebug!("conn {}: receive queue full, {} bytes dropped", conn.id(), len);
        return;
    }
    conn.recv_avail.fetch_add(len, Ordering::AcqRel);
    conn.event(ConnEvent::RcvPlus, len);
}

//! Engine-side halves of the netconn calls.
//!
//! Everything here runs in the engine context with exclusive access to
//! the engine. A handler either answers at once or parks the caller's
//! completion in the connection state (blocking write, connect, close);
//! the engine callbacks in `callbacks` finish the parked operation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use netconn_core::error::{NetError, NetResult};
use netconn_core::{kdebug, ktrace};
use tcpip_core::constants::TCP_WRITE_CHUNK_MAX;
use tcpip_core::{
    IpFamily, PcbId, PcbOption, ProtocolEngine, TcpCallbacks, TcpState, TcpWriteFlags,
};

use crate::api::WriteFlags;
use crate::callbacks::{raw_adapter, setup_tcp, tcp_adapter, udp_adapter};
use crate::conn::{
    flag, AcceptMsg, CloseOp, ConnEvent, ConnInner, ConnState, EngineSide, NetconnType, RecvMsg,
    Shut, WriteOp,
};
use crate::msg::{ApiCall, ApiMsg, ApiReply, Completion};
use crate::netbuf::Netbuf;
use crate::sys::mbox::Mbox;

/// `None` when the handler parked the completion.
type Handled = Option<NetResult<ApiReply>>;

/// Run one API message.
pub(crate) fn dispatch(engine: &mut dyn ProtocolEngine, msg: ApiMsg) {
    let ApiMsg { conn, call, done } = msg;
    ktrace!("conn {}: {}", conn.id(), call.name());
    let result = match call {
        ApiCall::NewConn => Some(do_newconn(engine, &conn)),
        ApiCall::DelConn => do_delconn(engine, &conn, &done),
        ApiCall::Bind(addr) => Some(do_bind(engine, &conn, addr)),
        ApiCall::Connect(addr) => do_connect(engine, &conn, addr, &done),
        ApiCall::Disconnect => Some(do_disconnect(engine, &conn)),
        ApiCall::Listen(backlog) => Some(do_listen(engine, &conn, backlog)),
        ApiCall::Send(buf) => Some(do_send(engine, &conn, buf)),
        ApiCall::Write { vectors, flags } => do_write(engine, &conn, vectors, flags, &done),
        ApiCall::Recved(len) => Some(do_recved(engine, &conn, len)),
        ApiCall::Accepted => Some(do_accepted(engine, &conn)),
        ApiCall::GetAddr { local } => Some(do_getaddr(engine, &conn, local)),
        ApiCall::Close(shut) => do_close(engine, &conn, shut, &done),
        ApiCall::JoinLeave {
            group,
            ifaddr,
            join,
        } => Some(do_join_leave(engine, &conn, group, ifaddr, join)),
        ApiCall::GetOptions => Some(do_getoptions(engine, &conn)),
        ApiCall::SetOption(opt) => Some(do_setoption(engine, &conn, opt)),
    };
    if let Some(result) = result {
        done.complete(result);
    }
}

// ── Create / delete ──

fn do_newconn(engine: &mut dyn ProtocolEngine, conn: &Arc<ConnInner>) -> NetResult<ApiReply> {
    let mut side = conn.side();
    if side.pcb.is_some() {
        return Ok(ApiReply::Done);
    }
    let family = match conn.family() {
        // dual-stack unless IPV6_V6ONLY is set later
        IpFamily::V6 => IpFamily::Any,
        f => f,
    };
    let pcb = match conn.ty() {
        NetconnType::Tcp => {
            let pcb = engine.tcp_new(family)?;
            setup_tcp(engine, conn, pcb);
            pcb
        }
        NetconnType::Raw(proto) => {
            let pcb = engine.raw_new(family, proto)?;
            engine.raw_set_handler(pcb, Some(raw_adapter(conn)));
            pcb
        }
        ty => {
            let pcb = engine.udp_new(family)?;
            if ty == NetconnType::UdpNoChksum {
                if let Err(e) = engine.set_option(pcb, PcbOption::NoChecksum(true)) {
                    engine.udp_remove(pcb);
                    return Err(e);
                }
            }
            engine.udp_set_handler(pcb, Some(udp_adapter(conn)));
            pcb
        }
    };
    kdebug!("conn {}: {:?} on {}", conn.id(), conn.ty(), pcb);
    side.pcb = Some(pcb);
    Ok(ApiReply::Done)
}

fn do_delconn(
    engine: &mut dyn ProtocolEngine,
    conn: &Arc<ConnInner>,
    done: &Arc<Completion<ApiReply>>,
) -> Handled {
    let mut side = conn.side();
    if !matches!(side.state, ConnState::None | ConnState::Listen) {
        kdebug!("conn {}: delete during {}", conn.id(), side.state.name());
    }
    match side.state {
        ConnState::Write(_) | ConnState::Connect(Some(_)) => {
            if !conn.config().full_duplex {
                return Some(Err(NetError::InProgress));
            }
            std::mem::replace(&mut side.state, ConnState::None).complete(Err(NetError::Closed));
        }
        ConnState::Close(_) => return Some(Err(NetError::InProgress)),
        _ => {}
    }

    drain(engine, conn, side.pcb);

    if let Some(pcb) = side.pcb {
        match conn.ty() {
            NetconnType::Tcp => {
                side.state = ConnState::Close(CloseOp {
                    shut: Shut::RdWr,
                    time_started: Instant::now(),
                    polls_left: conn.config().close_poll_retries,
                    done: Arc::clone(done),
                });
                close_internal(engine, conn, &mut side);
                return None;
            }
            NetconnType::Raw(_) => engine.raw_remove(pcb),
            _ => engine.udp_remove(pcb),
        }
        side.pcb = None;
    }
    drop(side);
    conn.event(ConnEvent::RcvPlus, 0);
    conn.event(ConnEvent::SendPlus, 0);
    Some(Ok(ApiReply::Done))
}

/// Empty both queues of a connection that is going away. Stream data is
/// acknowledged to the engine; pending inbound connections are aborted.
pub(crate) fn drain(engine: &mut dyn ProtocolEngine, conn: &ConnInner, pcb: Option<PcbId>) {
    if let Some(mbox) = conn.take_recvmbox() {
        mbox.close();
        while let Some(msg) = mbox.tryfetch() {
            if let RecvMsg::Segment(p) = msg {
                if let (Some(pcb), true) = (pcb, conn.ty().is_tcp()) {
                    engine.tcp_recved(pcb, p.tot_len());
                }
            }
        }
    }

    if let Some(mbox) = conn.take_acceptmbox() {
        mbox.close();
        while let Some(msg) = mbox.tryfetch() {
            if let AcceptMsg::Conn(child) = msg {
                let child_pcb = child.side().pcb.take();
                drain(engine, &child, child_pcb);
                if let Some(child_pcb) = child_pcb {
                    kdebug!("conn {}: aborting unaccepted {}", conn.id(), child_pcb);
                    engine.tcp_abort(child_pcb);
                }
            }
        }
    }
}

// ── Addressing ──

fn do_bind(
    engine: &mut dyn ProtocolEngine,
    conn: &ConnInner,
    addr: SocketAddr,
) -> NetResult<ApiReply> {
    let side = conn.side();
    let pcb = side.pcb.ok_or(NetError::Val)?;
    match conn.ty() {
        NetconnType::Tcp => engine.tcp_bind(pcb, addr)?,
        NetconnType::Raw(_) => engine.raw_bind(pcb, addr.ip())?,
        _ => engine.udp_bind(pcb, addr)?,
    }
    Ok(ApiReply::Done)
}

fn do_connect(
    engine: &mut dyn ProtocolEngine,
    conn: &Arc<ConnInner>,
    addr: SocketAddr,
    done: &Arc<Completion<ApiReply>>,
) -> Handled {
    let mut side = conn.side();
    let Some(pcb) = side.pcb else {
        return Some(Err(NetError::Closed));
    };
    match conn.ty() {
        NetconnType::Raw(_) => Some(engine.raw_connect(pcb, addr.ip()).map(|_| ApiReply::Done)),
        NetconnType::Tcp => {
            match side.state {
                ConnState::None => {}
                ConnState::Connect(_) => return Some(Err(NetError::Already)),
                _ => return Some(Err(NetError::IsConn)),
            }
            setup_tcp(engine, conn, pcb);
            if let Err(e) = engine.tcp_connect(pcb, addr) {
                return Some(Err(e));
            }
            if conn.is_nonblocking() {
                conn.set_flag(flag::IN_NONBLOCKING_CONNECT);
                side.state = ConnState::Connect(None);
                Some(Err(NetError::InProgress))
            } else {
                side.state = ConnState::Connect(Some(Arc::clone(done)));
                None
            }
        }
        _ => Some(engine.udp_connect(pcb, addr).map(|_| ApiReply::Done)),
    }
}

fn do_disconnect(engine: &mut dyn ProtocolEngine, conn: &ConnInner) -> NetResult<ApiReply> {
    let side = conn.side();
    match (conn.ty(), side.pcb) {
        (NetconnType::Tcp, _) => Err(NetError::Val),
        (NetconnType::Raw(_), Some(pcb)) => {
            engine.raw_disconnect(pcb);
            Ok(ApiReply::Done)
        }
        (_, Some(pcb)) => {
            engine.udp_disconnect(pcb);
            Ok(ApiReply::Done)
        }
        (_, None) => Err(NetError::Conn),
    }
}

fn do_listen(
    engine: &mut dyn ProtocolEngine,
    conn: &Arc<ConnInner>,
    backlog: u8,
) -> NetResult<ApiReply> {
    if let Some(e) = conn.fatal_err() {
        return Err(e);
    }
    let mut side = conn.side();
    let pcb = side.pcb.ok_or(NetError::Conn)?;
    if !conn.ty().is_tcp() {
        return Err(NetError::Arg);
    }
    match side.state {
        ConnState::None => {
            if engine.tcp_state(pcb) != TcpState::Closed {
                return Err(NetError::Val);
            }
            engine.tcp_listen(pcb, backlog)?;
            if let Some(mbox) = conn.take_recvmbox() {
                mbox.close();
            }
            if !conn.has_acceptmbox() {
                conn.set_acceptmbox(Arc::new(Mbox::new(conn.config().accept_mbox_size)));
            }
            side.state = ConnState::Listen;
            engine.tcp_set_handler(pcb, Some(tcp_adapter(conn)));
            engine.tcp_set_callbacks(pcb, TcpCallbacks::ACCEPT);
            kdebug!("conn {}: listening, backlog {}", conn.id(), backlog);
            Ok(ApiReply::Done)
        }
        ConnState::Listen => {
            engine.tcp_backlog_set(pcb, backlog);
            Ok(ApiReply::Done)
        }
        _ => Err(NetError::Conn),
    }
}

fn do_getaddr(
    engine: &mut dyn ProtocolEngine,
    conn: &ConnInner,
    local: bool,
) -> NetResult<ApiReply> {
    let side = conn.side();
    let pcb = side.pcb.ok_or(NetError::Conn)?;
    if local {
        let mut addr = engine.local_addr(pcb)?;
        if let NetconnType::Raw(proto) = conn.ty() {
            addr.set_port(u16::from(proto));
        }
        return Ok(ApiReply::Addr(addr));
    }
    if conn.ty().is_raw() {
        return Err(NetError::Conn);
    }
    engine.remote_addr(pcb).map(ApiReply::Addr)
}

// ── Data ──

fn do_send(engine: &mut dyn ProtocolEngine, conn: &ConnInner, buf: Netbuf) -> NetResult<ApiReply> {
    if let Some(e) = conn.take_err() {
        return Err(e);
    }
    let side = conn.side();
    let pcb = side.pcb.ok_or(NetError::Conn)?;
    let dst = buf.addr().filter(|a| !a.ip().is_unspecified());
    let p = buf.into_pbuf();
    match (conn.ty(), dst) {
        (NetconnType::Tcp, _) => return Err(NetError::Conn),
        (NetconnType::Raw(_), Some(dst)) => engine.raw_sendto(pcb, p, dst.ip())?,
        (NetconnType::Raw(_), None) => engine.raw_send(pcb, p)?,
        (_, Some(dst)) => engine.udp_sendto(pcb, p, dst)?,
        (_, None) => engine.udp_send(pcb, p)?,
    }
    Ok(ApiReply::Done)
}

fn do_write(
    engine: &mut dyn ProtocolEngine,
    conn: &Arc<ConnInner>,
    vectors: Vec<Vec<u8>>,
    flags: WriteFlags,
    done: &Arc<Completion<ApiReply>>,
) -> Handled {
    if let Some(e) = conn.take_err() {
        return Some(Err(e));
    }
    if !conn.ty().is_tcp() {
        return Some(Err(NetError::Val));
    }
    let mut side = conn.side();
    if !matches!(side.state, ConnState::None) {
        return Some(Err(NetError::InProgress));
    }
    if side.pcb.is_none() {
        return Some(Err(NetError::Conn));
    }
    let total = vectors.iter().map(Vec::len).sum();
    side.state = ConnState::Write(WriteOp {
        vectors,
        vector_idx: 0,
        vector_off: 0,
        offset: 0,
        total,
        flags,
        time_started: Instant::now(),
        done: Arc::clone(done),
    });
    writemore(engine, conn, &mut side);
    None
}

/// Feed the parked write to the engine as far as the send buffer allows.
/// Completes the write when everything is queued, when a non-blocking
/// write can go no further, or on error.
pub(crate) fn writemore(engine: &mut dyn ProtocolEngine, conn: &ConnInner, side: &mut EngineSide) {
    let Some(pcb) = side.pcb else { return };
    let ConnState::Write(op) = &mut side.state else {
        return;
    };

    let dontblock = conn.is_nonblocking() || op.flags.contains(WriteFlags::DONTBLOCK);
    let timed_out = conn
        .send_timeout()
        .is_some_and(|t| op.time_started.elapsed() >= t);

    let mut finished = None;
    if timed_out {
        kdebug!("conn {}: send timeout after {} bytes", conn.id(), op.offset);
        finished = Some(if op.offset == 0 {
            Err(NetError::WouldBlock)
        } else {
            Ok(())
        });
    }

    if finished.is_none() {
        let mut err = Ok(());
        // ── Step 1: hand over as much as fits ──
        loop {
            let chunk = match op.vectors.get(op.vector_idx) {
                Some(v) => &v[op.vector_off..],
                None => break,
            };
            let diff = chunk.len();
            let mut len = diff.min(TCP_WRITE_CHUNK_MAX);
            let mut apiflags = TcpWriteFlags::COPY;
            if op.flags.contains(WriteFlags::MORE) || diff > TCP_WRITE_CHUNK_MAX {
                apiflags |= TcpWriteFlags::MORE;
            }
            let available = engine.tcp_sndbuf(pcb);
            if available < len {
                len = available;
                if dontblock && len == 0 {
                    err = if op.offset == 0 {
                        Err(NetError::WouldBlock)
                    } else {
                        Ok(())
                    };
                    break;
                }
                apiflags |= TcpWriteFlags::MORE;
            }
            let more_vectors = op.vector_idx + 1 < op.vectors.len();
            let write_more =
                (len == TCP_WRITE_CHUNK_MAX && diff > TCP_WRITE_CHUNK_MAX) || (len == diff && more_vectors);
            if write_more {
                apiflags |= TcpWriteFlags::MORE;
            }
            err = if len == 0 {
                Err(NetError::Mem)
            } else {
                engine.tcp_write(pcb, &chunk[..len], apiflags)
            };
            if err.is_ok() {
                op.offset += len;
                op.vector_off += len;
                if op.vector_off == op.vectors[op.vector_idx].len() {
                    op.vector_idx += 1;
                    op.vector_off = 0;
                }
            }
            if !(write_more && err.is_ok()) {
                break;
            }
        }

        // ── Step 2: writable-state bookkeeping ──
        if matches!(err, Ok(()) | Err(NetError::Mem) | Err(NetError::WouldBlock)) {
            if dontblock && op.offset < op.total {
                conn.event(ConnEvent::SendMinus, 0);
                conn.set_flag(flag::CHECK_WRITESPACE);
            } else if engine.tcp_sndbuf(pcb) <= conn.config().tcp_sndlowat
                || engine.tcp_sndqueuelen(pcb) >= conn.config().tcp_sndqueuelowat
            {
                conn.event(ConnEvent::SendMinus, 0);
            }
        }

        // ── Step 3: push and decide ──
        finished = match err {
            Ok(()) => match engine.tcp_output(pcb) {
                Err(NetError::Rte) => Some(Err(NetError::Rte)),
                _ if op.offset == op.total || dontblock => Some(Ok(())),
                _ => None,
            },
            Err(NetError::Mem) => match engine.tcp_output(pcb) {
                Err(NetError::Rte) => Some(Err(NetError::Rte)),
                _ if dontblock => Some(if op.offset == 0 {
                    Err(NetError::WouldBlock)
                } else {
                    Ok(())
                }),
                _ => None,
            },
            Err(e) => Some(Err(e)),
        };
    }

    if let Some(result) = finished {
        let ConnState::Write(op) = std::mem::replace(&mut side.state, ConnState::None) else {
            return;
        };
        let result = result.map(|_| ApiReply::Written(op.offset));
        ktrace!("conn {}: write finished {:?}", conn.id(), result);
        op.done.complete(result);
    }
}

fn do_recved(engine: &mut dyn ProtocolEngine, conn: &ConnInner, len: usize) -> NetResult<ApiReply> {
    let side = conn.side();
    if let (Some(pcb), true) = (side.pcb, conn.ty().is_tcp()) {
        engine.tcp_recved(pcb, len);
    }
    Ok(ApiReply::Done)
}

fn do_accepted(engine: &mut dyn ProtocolEngine, conn: &ConnInner) -> NetResult<ApiReply> {
    let side = conn.side();
    if let (Some(pcb), true) = (side.pcb, conn.ty().is_tcp()) {
        engine.tcp_backlog_accepted(pcb);
    }
    Ok(ApiReply::Done)
}

// ── Close ──

fn do_close(
    engine: &mut dyn ProtocolEngine,
    conn: &Arc<ConnInner>,
    shut: Shut,
    done: &Arc<Completion<ApiReply>>,
) -> Handled {
    let mut side = conn.side();
    let Some(pcb) = side.pcb else {
        return Some(Err(NetError::Conn));
    };
    if !conn.ty().is_tcp() {
        return Some(Err(NetError::Conn));
    }
    match side.state {
        ConnState::Listen if shut != Shut::RdWr => return Some(Err(NetError::Conn)),
        ConnState::Connect(_) => return Some(Err(NetError::Conn)),
        ConnState::Close(_) => return Some(Err(NetError::InProgress)),
        ConnState::Write(_) => {
            if !conn.config().full_duplex {
                return Some(Err(NetError::InProgress));
            }
            if shut.tx() {
                std::mem::replace(&mut side.state, ConnState::None)
                    .complete(Err(NetError::Closed));
            } else {
                // reading side only, the write keeps going
                return Some(engine.tcp_shutdown(pcb, true, false).map(|_| ApiReply::Done));
            }
        }
        _ => {}
    }

    if shut.rx() {
        drain(engine, conn, Some(pcb));
    }
    side.state = ConnState::Close(CloseOp {
        shut,
        time_started: Instant::now(),
        polls_left: conn.config().close_poll_retries,
        done: Arc::clone(done),
    });
    close_internal(engine, conn, &mut side);
    None
}

/// How long a close may keep retrying after the engine ran out of
/// memory. `None` means count polls instead.
pub(crate) fn close_timeout(conn: &ConnInner) -> Option<Duration> {
    let mut timeout = conn.config().close_timeout;
    if let Some(t) = conn.send_timeout() {
        timeout = Some(t);
    }
    if let Some(secs) = conn.linger() {
        timeout = Some(Duration::from_secs(u64::from(secs)));
    }
    timeout
}

/// Close or shut down the stream for the parked close. Completes it
/// once the engine accepted the close (or gave up); otherwise re-arms
/// the callbacks so `poll`/`sent` retry.
pub(crate) fn close_internal(
    engine: &mut dyn ProtocolEngine,
    conn: &Arc<ConnInner>,
    side: &mut EngineSide,
) {
    let Some(pcb) = side.pcb else { return };
    let ConnState::Close(op) = &mut side.state else {
        return;
    };
    let shut = op.shut;
    let tcp_state = engine.tcp_state(pcb);
    let shut_close = match shut {
        Shut::RdWr => true,
        Shut::Rd => matches!(
            tcp_state,
            TcpState::FinWait1 | TcpState::FinWait2 | TcpState::Closing
        ),
        Shut::Wr => engine.tcp_rx_closed(pcb),
    };

    // ── Step 1: detach the callbacks that no longer apply ──
    if shut_close {
        engine.tcp_set_handler(pcb, None);
    }
    let mut cbs = engine.tcp_callbacks(pcb);
    if tcp_state == TcpState::Listen {
        cbs.remove(TcpCallbacks::ACCEPT);
    } else {
        if shut.rx() {
            cbs.remove(TcpCallbacks::RECV | TcpCallbacks::ACCEPT);
        }
        if shut.tx() {
            cbs.remove(TcpCallbacks::SENT);
        }
        if shut_close {
            cbs.remove(TcpCallbacks::POLL | TcpCallbacks::ERR);
        }
    }
    engine.tcp_set_callbacks(pcb, cbs);

    // ── Step 2: linger ──
    let mut err = Ok(());
    let mut pcb_alive = true;
    let mut linger_wait = false;
    if shut_close {
        if let Some(linger) = conn.linger() {
            if engine.tcp_has_pending(pcb) {
                if linger == 0 {
                    kdebug!("conn {}: linger 0, aborting", conn.id());
                    engine.tcp_abort(pcb);
                    pcb_alive = false;
                } else if conn.is_nonblocking() {
                    err = Err(NetError::WouldBlock);
                } else if op.time_started.elapsed() >= Duration::from_secs(u64::from(linger)) {
                    kdebug!("conn {}: linger expired, aborting", conn.id());
                    engine.tcp_abort(pcb);
                    pcb_alive = false;
                } else {
                    linger_wait = true;
                }
            }
        }
    }

    // ── Step 3: ask the engine ──
    if err.is_ok() && pcb_alive {
        err = if shut_close {
            engine.tcp_close(pcb)
        } else {
            engine.tcp_shutdown(pcb, shut.rx(), shut.tx())
        };
    }

    let finished = match err {
        Ok(()) => !linger_wait,
        Err(NetError::Mem) => {
            let expired = match close_timeout(conn) {
                Some(t) => op.time_started.elapsed() >= t,
                None => op.polls_left == 0,
            };
            if expired {
                kdebug!("conn {}: close timed out", conn.id());
                if shut_close {
                    engine.tcp_abort(pcb);
                    err = Ok(());
                }
            }
            expired
        }
        Err(_) => true,
    };

    if finished {
        let ConnState::Close(op) = std::mem::replace(&mut side.state, ConnState::None) else {
            return;
        };
        if err.is_ok() {
            if shut_close {
                side.pcb = None;
                conn.event(ConnEvent::Error, 0);
            }
            if shut.rx() {
                conn.event(ConnEvent::RcvPlus, 0);
            }
            if shut.tx() {
                conn.event(ConnEvent::SendPlus, 0);
            }
        }
        ktrace!("conn {}: close {:?} finished {:?}", conn.id(), shut, err);
        op.done.complete(err.map(|_| ApiReply::Done));
    } else {
        // retry from poll/sent
        let mut cbs = engine.tcp_callbacks(pcb);
        if shut.tx() {
            cbs.insert(TcpCallbacks::SENT);
        }
        cbs.insert(TcpCallbacks::POLL | TcpCallbacks::ERR);
        engine.tcp_set_callbacks(pcb, cbs);
        engine.tcp_set_poll_interval(pcb, 1);
        engine.tcp_set_handler(pcb, Some(tcp_adapter(conn)));
    }
}

// ── Multicast and options ──

fn do_join_leave(
    engine: &mut dyn ProtocolEngine,
    conn: &ConnInner,
    group: std::net::IpAddr,
    ifaddr: std::net::IpAddr,
    join: bool,
) -> NetResult<ApiReply> {
    let side = conn.side();
    if side.pcb.is_none() {
        return Err(NetError::Conn);
    }
    if !conn.ty().is_udp() {
        return Err(NetError::Val);
    }
    if join {
        engine.join_group(ifaddr, group)?;
    } else {
        engine.leave_group(ifaddr, group)?;
    }
    Ok(ApiReply::Done)
}

fn do_getoptions(engine: &mut dyn ProtocolEngine, conn: &ConnInner) -> NetResult<ApiReply> {
    let side = conn.side();
    let pcb = side.pcb.ok_or(NetError::Conn)?;
    engine.options(pcb).map(ApiReply::Options)
}

fn do_setoption(
    engine: &mut dyn ProtocolEngine,
    conn: &ConnInner,
    opt: PcbOption,
) -> NetResult<ApiReply> {
    let side = conn.side();
    let pcb = side.pcb.ok_or(NetError::Conn)?;
    if (opt.tcp_only() && !conn.ty().is_tcp()) || (opt.udp_only() && !conn.ty().is_udp()) {
        return Err(NetError::Arg);
    }
    engine.set_option(pcb, opt)?;
    Ok(ApiReply::Done)
}

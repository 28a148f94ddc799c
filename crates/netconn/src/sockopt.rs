//! Socket options, `ioctl` and `fcntl`.
//!
//! Options stored on the connection (timeouts, receive buffer, linger)
//! are read and written directly; options stored on the control block
//! go through the engine context.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use netconn_core::error::{Errno, NetError};
use netconn_core::{kdebug, kwarn};
use netconn_runtime::{Netconn, NetconnType, RecvFlags};
use nix::fcntl::OFlag;
use tcpip_core::{IpFamily, PcbOption, PcbOptions};

use crate::socket::{Fd, Lastdata, Socket, Sockets};

/// `SO_NO_CHECK` (Linux value)
pub const SO_NO_CHECK: i32 = 11;

/// Linger times above this are clamped.
const MAX_LINGER_SECS: i32 = 0xffff;

/// Value of a socket option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockOptVal {
    Int(i32),
    /// `SO_SNDTIMEO`/`SO_RCVTIMEO`; zero means no timeout
    Timeout(Duration),
    /// `SO_LINGER`
    Linger { onoff: bool, secs: i32 },
    /// `IP_MULTICAST_IF`
    Addr(Ipv4Addr),
    /// `IP_ADD_MEMBERSHIP`/`IP_DROP_MEMBERSHIP`
    Membership { group: Ipv4Addr, ifaddr: Ipv4Addr },
}

impl SockOptVal {
    fn int(self) -> Result<i32, Errno> {
        match self {
            SockOptVal::Int(v) => Ok(v),
            _ => Err(Errno::INVAL),
        }
    }

    fn flag(self) -> Result<bool, Errno> {
        self.int().map(|v| v != 0)
    }

    fn byte(self) -> Result<u8, Errno> {
        u8::try_from(self.int()?).map_err(|_| Errno::INVAL)
    }
}

/// A multicast group joined through `IP_ADD_MEMBERSHIP`.
pub(crate) struct Membership {
    conn: u32,
    group: Ipv4Addr,
    ifaddr: Ipv4Addr,
}

fn udp_only(conn: &Netconn) -> Result<(), Errno> {
    if conn.ty().is_udp() {
        Ok(())
    } else {
        Err(Errno::NOPROTOOPT)
    }
}

/// Options kept on the control block; a socket without one has none.
fn pcb_options(conn: &Netconn) -> Result<PcbOptions, Errno> {
    if !conn.inner().has_pcb() {
        return Err(Errno::INVAL);
    }
    Ok(conn.options()?)
}

fn set_pcb_option(conn: &Netconn, opt: PcbOption) -> Result<(), Errno> {
    if !conn.inner().has_pcb() {
        return Err(Errno::INVAL);
    }
    Ok(conn.set_option(opt)?)
}

/// TCP-level options need a connected or unconnected stream, not a
/// listener.
fn tcp_level(conn: &Netconn) -> Result<(), Errno> {
    if !conn.ty().is_tcp() {
        return Err(Errno::NOPROTOOPT);
    }
    if !conn.inner().has_pcb() {
        return Err(Errno::INVAL);
    }
    if conn.inner().has_acceptmbox() {
        return Err(Errno::INVAL);
    }
    Ok(())
}

fn no_check(conn: &Netconn) -> Result<(), Errno> {
    match conn.ty() {
        NetconnType::UdpLite => Err(Errno::AFNOSUPPORT),
        ty if ty.is_udp() => Ok(()),
        _ => Err(Errno::NOPROTOOPT),
    }
}

fn v6_only(conn: &Netconn) -> Result<(), Errno> {
    if conn.family() == IpFamily::V6 {
        Ok(())
    } else {
        Err(Errno::NOPROTOOPT)
    }
}

fn int(v: bool) -> SockOptVal {
    SockOptVal::Int(i32::from(v))
}

fn clamp_i32(v: usize) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

impl Sockets {
    // ── getsockopt ──

    pub fn getsockopt(&self, fd: Fd, level: i32, name: i32) -> Result<SockOptVal, Errno> {
        self.with_socket(fd, |sock| get_opt(sock, level, name))
    }

    // ── setsockopt ──

    pub fn setsockopt(&self, fd: Fd, level: i32, name: i32, val: SockOptVal) -> Result<(), Errno> {
        self.with_socket(fd, |sock| self.set_opt(sock, level, name, val))
    }

    fn set_opt(&self, sock: &Socket, level: i32, name: i32, val: SockOptVal) -> Result<(), Errno> {
        let conn = &sock.conn;
        match (level, name) {
            (libc::SOL_SOCKET, libc::SO_BROADCAST) => {
                udp_only(conn)?;
                set_pcb_option(conn, PcbOption::Broadcast(val.flag()?))
            }
            (libc::SOL_SOCKET, libc::SO_KEEPALIVE) => {
                set_pcb_option(conn, PcbOption::KeepAlive(val.flag()?))
            }
            (libc::SOL_SOCKET, libc::SO_REUSEADDR) => {
                set_pcb_option(conn, PcbOption::ReuseAddr(val.flag()?))
            }
            (libc::SOL_SOCKET, libc::SO_SNDTIMEO | libc::SO_RCVTIMEO) => {
                let SockOptVal::Timeout(t) = val else {
                    return Err(Errno::INVAL);
                };
                let t = (!t.is_zero()).then_some(t);
                if name == libc::SO_SNDTIMEO {
                    conn.set_send_timeout(t);
                } else {
                    conn.set_recv_timeout(t);
                }
                Ok(())
            }
            (libc::SOL_SOCKET, libc::SO_RCVBUF) => {
                let size = usize::try_from(val.int()?).map_err(|_| Errno::INVAL)?;
                conn.set_recv_bufsize(size);
                Ok(())
            }
            (libc::SOL_SOCKET, libc::SO_LINGER) => {
                let SockOptVal::Linger { onoff, secs } = val else {
                    return Err(Errno::INVAL);
                };
                if secs < 0 {
                    return Err(Errno::INVAL);
                }
                conn.set_linger(onoff.then(|| secs.min(MAX_LINGER_SECS) as u32));
                Ok(())
            }
            (libc::SOL_SOCKET, SO_NO_CHECK) => {
                no_check(conn)?;
                set_pcb_option(conn, PcbOption::NoChecksum(val.flag()?))
            }

            (libc::IPPROTO_IP, libc::IP_TTL) => set_pcb_option(conn, PcbOption::Ttl(val.byte()?)),
            (libc::IPPROTO_IP, libc::IP_TOS) => set_pcb_option(conn, PcbOption::Tos(val.byte()?)),
            (libc::IPPROTO_IP, libc::IP_MULTICAST_TTL) => {
                udp_only(conn)?;
                set_pcb_option(conn, PcbOption::MulticastTtl(val.byte()?))
            }
            (libc::IPPROTO_IP, libc::IP_MULTICAST_IF) => {
                udp_only(conn)?;
                let SockOptVal::Addr(addr) = val else {
                    return Err(Errno::INVAL);
                };
                set_pcb_option(conn, PcbOption::MulticastIf(addr))
            }
            (libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP) => {
                udp_only(conn)?;
                set_pcb_option(conn, PcbOption::MulticastLoop(val.flag()?))
            }
            (libc::IPPROTO_IP, libc::IP_ADD_MEMBERSHIP | libc::IP_DROP_MEMBERSHIP) => {
                udp_only(conn)?;
                let SockOptVal::Membership { group, ifaddr } = val else {
                    return Err(Errno::INVAL);
                };
                if name == libc::IP_ADD_MEMBERSHIP {
                    self.add_membership(sock, group, ifaddr)
                } else {
                    self.drop_membership(sock, group, ifaddr)
                }
            }

            (libc::IPPROTO_TCP, _) => {
                tcp_level(conn)?;
                let opt = match name {
                    libc::TCP_NODELAY => PcbOption::NoDelay(val.flag()?),
                    libc::TCP_KEEPIDLE => PcbOption::KeepIdle(keep_ms(val)?),
                    libc::TCP_KEEPINTVL => PcbOption::KeepIntvl(keep_ms(val)?),
                    libc::TCP_KEEPCNT => {
                        PcbOption::KeepCnt(u32::try_from(val.int()?).map_err(|_| Errno::INVAL)?)
                    }
                    _ => return Err(Errno::NOPROTOOPT),
                };
                set_pcb_option(conn, opt)
            }

            (libc::IPPROTO_IPV6, libc::IPV6_V6ONLY) => {
                v6_only(conn)?;
                set_pcb_option(conn, PcbOption::V6Only(val.flag()?))
            }

            _ => Err(Errno::NOPROTOOPT),
        }
    }

    // ── Multicast memberships ──

    fn add_membership(&self, sock: &Socket, group: Ipv4Addr, ifaddr: Ipv4Addr) -> Result<(), Errno> {
        let conn = sock.conn.id();
        let slot = self
            .table
            .memberships
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .alloc(Membership {
                conn,
                group,
                ifaddr,
            })
            .map_err(|_| Errno::NOMEM)?;

        if let Err(e) = sock
            .conn
            .join_leave_group(IpAddr::V4(group), IpAddr::V4(ifaddr), true)
        {
            kdebug!("conn {}: join {} failed: {}", conn, group, e);
            self.table
                .memberships
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .free(slot);
            return Err(Errno(libc::EADDRNOTAVAIL));
        }
        Ok(())
    }

    fn drop_membership(&self, sock: &Socket, group: Ipv4Addr, ifaddr: Ipv4Addr) -> Result<(), Errno> {
        let conn = sock.conn.id();
        sock.conn
            .join_leave_group(IpAddr::V4(group), IpAddr::V4(ifaddr), false)
            .map_err(|e| {
                kdebug!("conn {}: leave {} failed: {}", conn, group, e);
                Errno(libc::EADDRNOTAVAIL)
            })?;
        let mut memberships = self
            .table
            .memberships
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(i) =
            memberships.position(|m| m.conn == conn && m.group == group && m.ifaddr == ifaddr)
        {
            memberships.free(i);
        }
        Ok(())
    }

    /// Leave every group the socket joined.
    pub(crate) fn drop_memberships(&self, sock: &Socket) {
        let conn = sock.conn.id();
        let joined = self
            .table
            .memberships
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain_filter(|m| m.conn == conn);
        for m in joined {
            if let Err(e) =
                sock.conn
                    .join_leave_group(IpAddr::V4(m.group), IpAddr::V4(m.ifaddr), false)
            {
                kwarn!("conn {}: leaving {} failed: {}", conn, m.group, e);
            }
        }
    }

    // ── ioctl / fcntl ──

    /// `FIONREAD` stores the readable byte count in `arg` (for
    /// datagrams, the size of the next one); `FIONBIO` sets
    /// non-blocking mode from `arg`.
    pub fn ioctl(&self, fd: Fd, cmd: u64, arg: &mut i32) -> Result<(), Errno> {
        self.with_socket(fd, |sock| {
            if cmd == libc::FIONREAD as u64 {
                *arg = clamp_i32(readable_bytes(sock));
                Ok(())
            } else if cmd == libc::FIONBIO as u64 {
                sock.conn.set_nonblocking(*arg != 0);
                Ok(())
            } else {
                Err(Errno::NOSYS)
            }
        })
    }

    /// `F_GETFL` reports `O_NONBLOCK` and the open directions;
    /// `F_SETFL` accepts only `O_NONBLOCK` (access bits are ignored).
    pub fn fcntl(&self, fd: Fd, cmd: i32, val: i32) -> Result<i32, Errno> {
        self.with_socket(fd, |sock| match cmd {
            libc::F_GETFL => {
                let mut ret = 0;
                if sock.conn.is_nonblocking() {
                    ret |= OFlag::O_NONBLOCK.bits();
                }
                ret |= self.access_mode(&sock.conn)?.bits();
                Ok(ret)
            }
            libc::F_SETFL => {
                let val = val & !OFlag::O_ACCMODE.bits();
                if val & !OFlag::O_NONBLOCK.bits() != 0 {
                    return Err(Errno::NOSYS);
                }
                sock.conn
                    .set_nonblocking(val & OFlag::O_NONBLOCK.bits() != 0);
                Ok(0)
            }
            _ => Err(Errno::NOSYS),
        })
    }

    fn access_mode(&self, conn: &Netconn) -> Result<OFlag, Errno> {
        if !conn.ty().is_tcp() {
            return Ok(OFlag::O_RDWR);
        }
        let Some(pcb) = conn.inner().pcb() else {
            return Ok(OFlag::O_RDONLY);
        };
        let (rx_closed, fin_sent) = self
            .tcpip
            .with_engine(|e| (e.tcp_rx_closed(pcb), e.tcp_state(pcb).fin_sent()))?;
        Ok(match (!rx_closed, !fin_sent) {
            (true, true) => OFlag::O_RDWR,
            (false, true) => OFlag::O_WRONLY,
            _ => OFlag::O_RDONLY,
        })
    }
}

fn get_opt(sock: &Socket, level: i32, name: i32) -> Result<SockOptVal, Errno> {
    let conn = &sock.conn;
    let ty = conn.ty();
    Ok(match (level, name) {
        (libc::SOL_SOCKET, libc::SO_ACCEPTCONN) => {
            if !ty.is_tcp() {
                return Err(Errno::NOPROTOOPT);
            }
            int(conn.inner().has_acceptmbox())
        }
        (libc::SOL_SOCKET, libc::SO_BROADCAST) => {
            udp_only(conn)?;
            int(pcb_options(conn)?.broadcast)
        }
        (libc::SOL_SOCKET, libc::SO_KEEPALIVE) => int(pcb_options(conn)?.keepalive),
        (libc::SOL_SOCKET, libc::SO_REUSEADDR) => int(pcb_options(conn)?.reuse_addr),
        (libc::SOL_SOCKET, libc::SO_TYPE) => SockOptVal::Int(match ty {
            NetconnType::Tcp => libc::SOCK_STREAM,
            NetconnType::Raw(_) => libc::SOCK_RAW,
            _ => libc::SOCK_DGRAM,
        }),
        (libc::SOL_SOCKET, libc::SO_ERROR) => {
            let pending = conn.err().map(|e: NetError| e.to_errno());
            SockOptVal::Int(pending.unwrap_or_else(|| sock.take_err()))
        }
        (libc::SOL_SOCKET, libc::SO_SNDTIMEO) => {
            SockOptVal::Timeout(conn.send_timeout().unwrap_or(Duration::ZERO))
        }
        (libc::SOL_SOCKET, libc::SO_RCVTIMEO) => {
            SockOptVal::Timeout(conn.recv_timeout().unwrap_or(Duration::ZERO))
        }
        (libc::SOL_SOCKET, libc::SO_RCVBUF) => SockOptVal::Int(clamp_i32(conn.recv_bufsize())),
        (libc::SOL_SOCKET, libc::SO_LINGER) => {
            let linger = conn.linger();
            SockOptVal::Linger {
                onoff: linger.is_some(),
                secs: linger.map_or(0, |s| s as i32),
            }
        }
        (libc::SOL_SOCKET, SO_NO_CHECK) => {
            no_check(conn)?;
            int(pcb_options(conn)?.no_checksum)
        }

        (libc::IPPROTO_IP, libc::IP_TTL) => SockOptVal::Int(pcb_options(conn)?.ttl.into()),
        (libc::IPPROTO_IP, libc::IP_TOS) => SockOptVal::Int(pcb_options(conn)?.tos.into()),
        (libc::IPPROTO_IP, libc::IP_MULTICAST_TTL) => {
            udp_only(conn)?;
            SockOptVal::Int(pcb_options(conn)?.mcast_ttl.into())
        }
        (libc::IPPROTO_IP, libc::IP_MULTICAST_IF) => {
            udp_only(conn)?;
            SockOptVal::Addr(pcb_options(conn)?.mcast_if)
        }
        (libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP) => {
            udp_only(conn)?;
            int(pcb_options(conn)?.mcast_loop)
        }

        (libc::IPPROTO_TCP, _) => {
            tcp_level(conn)?;
            let opts = pcb_options(conn)?;
            match name {
                libc::TCP_NODELAY => int(opts.nodelay),
                libc::TCP_KEEPIDLE => SockOptVal::Int((opts.keep_idle / 1000) as i32),
                libc::TCP_KEEPINTVL => SockOptVal::Int((opts.keep_intvl / 1000) as i32),
                libc::TCP_KEEPCNT => SockOptVal::Int(clamp_i32(opts.keep_cnt as usize)),
                _ => return Err(Errno::NOPROTOOPT),
            }
        }

        (libc::IPPROTO_IPV6, libc::IPV6_V6ONLY) => {
            v6_only(conn)?;
            int(pcb_options(conn)?.v6only)
        }

        _ => return Err(Errno::NOPROTOOPT),
    })
}

/// Keepalive times are set in seconds and kept in milliseconds.
fn keep_ms(val: SockOptVal) -> Result<u32, Errno> {
    let secs = u32::try_from(val.int()?).map_err(|_| Errno::INVAL)?;
    secs.checked_mul(1000).ok_or(Errno::INVAL)
}

/// Bytes a `recv` could return without blocking.
fn readable_bytes(sock: &Socket) -> usize {
    let conn = &sock.conn;
    if conn.ty().is_tcp() {
        return conn.inner().recv_avail() + sock.lastdata_len();
    }
    if sock.has_lastdata() {
        return sock.lastdata_len();
    }
    // look at the next datagram and keep it for the next recv
    match conn.recv_udp_raw_netbuf_flags(RecvFlags::DONTBLOCK) {
        Ok(buf) => {
            let len = buf.len();
            sock.put_lastdata(Lastdata::Datagram(buf));
            len
        }
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_accessors() {
        assert_eq!(SockOptVal::Int(3).int(), Ok(3));
        assert_eq!(SockOptVal::Int(0).flag(), Ok(false));
        assert_eq!(SockOptVal::Int(64).byte(), Ok(64));
        assert_eq!(SockOptVal::Int(256).byte(), Err(Errno::INVAL));
        assert_eq!(SockOptVal::Timeout(Duration::ZERO).int(), Err(Errno::INVAL));
    }

    #[test]
    fn test_keepalive_seconds() {
        assert_eq!(keep_ms(SockOptVal::Int(75)), Ok(75_000));
        assert_eq!(keep_ms(SockOptVal::Int(-1)), Err(Errno::INVAL));
        assert_eq!(keep_ms(SockOptVal::Int(i32::MAX)), Err(Errno::INVAL));
    }
}

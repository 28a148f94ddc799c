use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::thread;
use std::time::{Duration, Instant};

use libc::{AF_INET, AF_INET6, SOCK_DGRAM, SOCK_RAW, SOCK_STREAM};
use nix::poll::PollFlags;
use tcpip_loopback::LoopbackEngine;

use crate::socket::{MSG_DONTWAIT, MSG_PEEK};
use crate::sockopt::SO_NO_CHECK;
use crate::{
    errno, AddrInfoHints, Errno, Fd, FdSet, NetdbError, PollFd, ProtocolEngine, SockOptVal, Sockets,
    Stack, StackConfig,
};

fn config() -> StackConfig {
    StackConfig::new().slow_timer_interval(Duration::from_millis(10))
}

fn stack() -> Stack {
    stack_with(config())
}

fn stack_with(config: StackConfig) -> Stack {
    Stack::new(Box::new(LoopbackEngine::default()), config).unwrap()
}

fn loopback(engine: &mut dyn ProtocolEngine) -> &mut LoopbackEngine {
    engine.as_any_mut().downcast_mut::<LoopbackEngine>().unwrap()
}

fn localhost(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

fn udp(s: &Sockets) -> (Fd, SocketAddr) {
    let fd = s.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    s.bind(fd, localhost(0)).unwrap();
    let addr = s.getsockname(fd).unwrap();
    (fd, addr)
}

/// Listener, client and accepted server descriptors of one connection.
fn tcp_pair(s: &Sockets) -> (Fd, Fd, Fd) {
    let l = s.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    s.bind(l, localhost(0)).unwrap();
    s.listen(l, 4).unwrap();
    let addr = s.getsockname(l).unwrap();
    let c = s.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    s.connect(c, Some(addr)).unwrap();
    let (srv, _) = s.accept(l).unwrap();
    (l, c, srv)
}

fn recv_exact(s: &Sockets, fd: Fd, want: usize) -> Vec<u8> {
    let mut out = vec![0u8; want];
    let mut got = 0;
    while got < want {
        let n = s.recv(fd, &mut out[got..], 0).unwrap();
        assert!(n > 0, "eof after {} of {} bytes", got, want);
        got += n;
    }
    out
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ── Descriptor table ──

#[test]
fn test_socket_table_limits() {
    let stack = stack_with(config().num_sockets(2).socket_offset(10));
    let a = stack.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    let b = stack.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    assert_eq!((a, b), (10, 11));
    assert_eq!(stack.open_count(), 2);

    assert_eq!(stack.socket(AF_INET, SOCK_DGRAM, 0), Err(Errno::NFILE));
    assert_eq!(errno(), libc::ENFILE);

    stack.close(a).unwrap();
    assert_eq!(errno(), 0);
    assert_eq!(stack.close(a), Err(Errno::BADF));
    assert_eq!(stack.bind(9, localhost(0)), Err(Errno::BADF));
    assert_eq!(errno(), libc::EBADF);

    assert_eq!(stack.socket(AF_INET, SOCK_DGRAM, 0), Ok(10));
    assert_eq!(stack.socket(libc::AF_UNIX, SOCK_DGRAM, 0), Err(Errno::AFNOSUPPORT));
    stack.close(10).unwrap();
    assert_eq!(stack.socket(AF_INET, libc::SOCK_SEQPACKET, 0), Err(Errno::INVAL));
}

#[test]
fn test_close_waits_for_last_user() {
    let stack = stack_with(config().num_sockets(4));
    let sockets = stack.sockets().clone();
    let (fd, _) = udp(&sockets);

    thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut buf = [0u8; 16];
            sockets.recv(fd, &mut buf, 0)
        });
        thread::sleep(Duration::from_millis(50));
        stack.close(fd).unwrap();
        assert!(reader.join().unwrap().is_err());
    });

    assert_eq!(stack.open_count(), 0);
    assert_eq!(stack.recv(fd, &mut [0u8; 4], 0), Err(Errno::BADF));
    // the slot is free again once the reader has left
    assert_eq!(stack.socket(AF_INET, SOCK_DGRAM, 0), Ok(fd));
}

// ── Streams ──

#[test]
fn test_nonblocking_connect_and_transfer() {
    let stack = stack();
    let l = stack.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    stack.bind(l, localhost(0)).unwrap();
    stack.listen(l, 0).unwrap();
    let addr = stack.getsockname(l).unwrap();
    assert_ne!(addr.port(), 0);

    let c = stack.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    stack.fcntl(c, libc::F_SETFL, libc::O_NONBLOCK).unwrap();
    assert_eq!(stack.connect(c, Some(addr)), Err(Errno(libc::EINPROGRESS)));
    assert_eq!(errno(), libc::EINPROGRESS);
    let again = stack.connect(c, Some(addr)).unwrap_err();
    assert!(again == Errno(libc::EALREADY) || again == Errno(libc::EISCONN));

    let (srv, peer) = stack.accept(l).unwrap();
    assert_eq!(peer, stack.getsockname(c).unwrap());
    assert_eq!(stack.getpeername(srv).unwrap(), peer);

    // wait for the handshake to finish on the client side
    let mut ws = FdSet::new();
    ws.insert(c);
    assert_eq!(
        stack.select(c + 1, None, Some(&mut ws), None, Some(Duration::from_secs(5))),
        Ok(1)
    );
    assert_eq!(stack.getsockopt(c, libc::SOL_SOCKET, libc::SO_ERROR), Ok(SockOptVal::Int(0)));
    assert_eq!(stack.getpeername(c).unwrap(), addr);

    let mut off = 0;
    stack.ioctl(c, libc::FIONBIO as u64, &mut off).unwrap();
    let data = pattern(30_000);
    thread::scope(|s| {
        let writer = s.spawn(|| stack.write(c, &data));
        assert_eq!(recv_exact(&stack, srv, data.len()), data);
        assert_eq!(writer.join().unwrap(), Ok(data.len()));
    });
}

#[test]
fn test_recv_peek_and_leftover() {
    let stack = stack();
    let (_l, c, srv) = tcp_pair(&stack);
    stack.send(c, b"hello world", 0).unwrap();

    let mut buf = [0u8; 5];
    assert_eq!(stack.recv(srv, &mut buf, MSG_PEEK), Ok(5));
    assert_eq!(&buf, b"hello");
    assert_eq!(stack.recv(srv, &mut buf, 0), Ok(5));
    assert_eq!(&buf, b"hello");

    let mut avail = 0;
    stack.ioctl(srv, libc::FIONREAD as u64, &mut avail).unwrap();
    assert_eq!(avail, 6);

    let mut rest = [0u8; 64];
    assert_eq!(stack.read(srv, &mut rest), Ok(6));
    assert_eq!(&rest[..6], b" world");
    assert_eq!(stack.recv(srv, &mut rest, MSG_DONTWAIT), Err(Errno::WOULDBLOCK));
    assert_eq!(errno(), libc::EWOULDBLOCK);
    // a would-block result is not a socket error
    assert_eq!(stack.getsockopt(srv, libc::SOL_SOCKET, libc::SO_ERROR), Ok(SockOptVal::Int(0)));
}

#[test]
fn test_vectored_io() {
    let stack = stack();
    let (_l, c, srv) = tcp_pair(&stack);
    let out: [&[u8]; 3] = [b"abc", b"", b"defgh"];
    assert_eq!(stack.writev(c, &out), Ok(8));

    let (mut a, mut b) = ([0u8; 3], [0u8; 10]);
    let mut bufs: [&mut [u8]; 2] = [&mut a, &mut b];
    let mut got = stack.readv(srv, &mut bufs).unwrap();
    assert!(got >= 3);
    while got < 8 {
        got += stack.recv(srv, &mut b[got - 3..], 0).unwrap();
    }
    assert_eq!(&a, b"abc");
    assert_eq!(&b[..5], b"defgh");

    assert_eq!(stack.readv(srv, &mut []), Err(Errno::MSGSIZE));
    let mut empty: [&mut [u8]; 1] = [&mut []];
    assert_eq!(stack.readv(srv, &mut empty), Err(Errno::INVAL));
    let one: [&[u8]; 1] = [b"x"];
    assert_eq!(stack.sendmsg(c, &one, MSG_PEEK, None), Err(Errno::OPNOTSUPP));
}

#[test]
fn test_shutdown_write_gives_eof() {
    let stack = stack();
    let (_l, c, srv) = tcp_pair(&stack);
    stack.send(c, b"last", 0).unwrap();
    stack.sockets().shutdown(c, libc::SHUT_WR).unwrap();

    assert_eq!(recv_exact(&stack, srv, 4), b"last");
    let mut buf = [0u8; 8];
    assert_eq!(stack.recv(srv, &mut buf, 0), Ok(0));
    assert_eq!(stack.recv(srv, &mut buf, 0), Ok(0));

    // the other direction still flows
    stack.send(srv, b"reply", 0).unwrap();
    assert_eq!(recv_exact(&stack, c, 5), b"reply");

    let flags = stack.fcntl(c, libc::F_GETFL, 0).unwrap();
    assert_eq!(flags & libc::O_ACCMODE, libc::O_RDONLY);
    let flags = stack.fcntl(srv, libc::F_GETFL, 0).unwrap();
    assert_eq!(flags & libc::O_ACCMODE, libc::O_RDWR);
    stack.sockets().shutdown(srv, libc::SHUT_RD).unwrap();
    let flags = stack.fcntl(srv, libc::F_GETFL, 0).unwrap();
    assert_eq!(flags & libc::O_ACCMODE, libc::O_WRONLY);

    assert_eq!(stack.sockets().shutdown(c, 42), Err(Errno::INVAL));
    let (u, _) = udp(&stack);
    assert_eq!(stack.sockets().shutdown(u, libc::SHUT_RDWR), Err(Errno::OPNOTSUPP));
}

#[test]
fn test_partial_writes_survive_mem_errors() {
    let stack = stack();
    let (_l, c, srv) = tcp_pair(&stack);
    stack
        .tcpip()
        .with_engine(|e| loopback(e).inject_mem_errors_after(1, 4))
        .unwrap();

    let data = pattern(20_000);
    thread::scope(|s| {
        let writer = s.spawn(|| stack.write(c, &data));
        assert_eq!(recv_exact(&stack, srv, data.len()), data);
        assert_eq!(writer.join().unwrap(), Ok(data.len()));
    });
}

#[test]
fn test_nonblocking_write_backpressure() {
    let stack = stack();
    let (_l, c, srv) = tcp_pair(&stack);
    stack.fcntl(c, libc::F_SETFL, libc::O_NONBLOCK).unwrap();

    let data = pattern(64 * 1024);
    let n = stack.write(c, &data).unwrap();
    assert!(n > 0 && n < data.len());

    let mut ws = FdSet::new();
    ws.insert(c);
    assert_eq!(stack.select(c + 1, None, Some(&mut ws), None, Some(Duration::ZERO)), Ok(0));
    assert!(ws.is_empty());

    assert_eq!(recv_exact(&stack, srv, n), &data[..n]);
    ws.insert(c);
    assert_eq!(
        stack.select(c + 1, None, Some(&mut ws), None, Some(Duration::from_secs(5))),
        Ok(1)
    );
    assert!(ws.contains(c));
}

// ── Fatal errors ──

#[test]
fn test_reset_wakes_blocked_calls() {
    let stack = stack();
    let sockets = stack.sockets().clone();
    let (l, reader_c, reader_s) = tcp_pair(&sockets);
    let port = sockets.getsockname(l).unwrap().port();
    let (_l2, writer_c, _writer_s) = tcp_pair(&sockets);

    thread::scope(|s| {
        let reader = s.spawn(|| sockets.recv(reader_s, &mut [0u8; 64], 0));
        let writer = s.spawn(|| sockets.write(writer_c, &pattern(200_000)));
        thread::sleep(Duration::from_millis(50));

        let killed = stack
            .tcpip()
            .with_engine(|e| loopback(e).reset_port(port))
            .unwrap();
        assert_eq!(killed, 2);
        assert_eq!(reader.join().unwrap(), Err(Errno(libc::ECONNRESET)));

        let wport = sockets.getsockname(writer_c).unwrap().port();
        stack
            .tcpip()
            .with_engine(|e| loopback(e).reset_port(wport))
            .unwrap();
        assert!(writer.join().unwrap().is_err());
    });

    assert_eq!(
        sockets.recv(reader_c, &mut [0u8; 8], 0),
        Err(Errno(libc::ECONNRESET))
    );
    assert_eq!(
        sockets.getsockopt(reader_c, libc::SOL_SOCKET, libc::SO_ERROR),
        Ok(SockOptVal::Int(libc::ECONNRESET))
    );
}

#[test]
fn test_stack_shutdown_wakes_accept() {
    let mut stack = stack();
    let sockets = stack.sockets().clone();
    let l = sockets.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    sockets.bind(l, localhost(0)).unwrap();
    sockets.listen(l, 1).unwrap();

    thread::scope(|s| {
        let acceptor = s.spawn(|| sockets.accept(l).map(|(fd, _)| fd));
        thread::sleep(Duration::from_millis(50));
        stack.shutdown();
        assert_eq!(acceptor.join().unwrap(), Err(Errno(libc::ENETDOWN)));
    });
    assert_eq!(sockets.open_count(), 0);
    assert_eq!(sockets.socket(AF_INET, SOCK_DGRAM, 0), Err(Errno::NOBUFS));
}

// ── Datagrams ──

#[test]
fn test_datagram_order_and_sender() {
    let stack = stack();
    let (a, a_addr) = udp(&stack);
    let (b, b_addr) = udp(&stack);

    for i in 0..8u8 {
        assert_eq!(stack.sendto(b, &[i; 10], 0, a_addr), Ok(10));
    }
    for i in 0..8u8 {
        let mut buf = [0u8; 32];
        let (n, from) = stack.recvfrom(a, &mut buf, 0).unwrap();
        assert_eq!(n, 10);
        assert_eq!(buf[..n], [i; 10]);
        assert_eq!(from, Some(b_addr));
    }
}

#[test]
fn test_datagram_peek_and_truncation() {
    let stack = stack();
    let (a, a_addr) = udp(&stack);
    let (b, b_addr) = udp(&stack);
    stack.sendto(b, b"0123456789", 0, a_addr).unwrap();

    let mut avail = 0;
    thread::sleep(Duration::from_millis(20));
    stack.ioctl(a, libc::FIONREAD as u64, &mut avail).unwrap();
    assert_eq!(avail, 10);

    let mut small = [0u8; 4];
    assert_eq!(stack.recv(a, &mut small, MSG_PEEK), Ok(4));
    assert_eq!(&small, b"0123");

    let (mut x, mut y) = ([0u8; 2], [0u8; 3]);
    let mut bufs: [&mut [u8]; 2] = [&mut x, &mut y];
    let meta = stack.recvmsg(a, &mut bufs, 0).unwrap();
    assert_eq!(meta.len, 5);
    assert!(meta.truncated);
    assert_eq!(meta.addr, Some(b_addr));
    assert_eq!((&x, &y), (b"01", b"234"));

    // the rest of a truncated datagram is gone
    assert_eq!(stack.recv(a, &mut small, MSG_DONTWAIT), Err(Errno::WOULDBLOCK));

    let big = vec![0u8; 0x10000];
    assert_eq!(stack.sendto(b, &big, 0, a_addr), Err(Errno::MSGSIZE));
}

#[test]
fn test_datagram_receive_budget() {
    let stack = stack();
    let (a, a_addr) = udp(&stack);
    let (b, _) = udp(&stack);
    stack
        .setsockopt(a, libc::SOL_SOCKET, libc::SO_RCVBUF, SockOptVal::Int(100))
        .unwrap();
    assert_eq!(
        stack.getsockopt(a, libc::SOL_SOCKET, libc::SO_RCVBUF),
        Ok(SockOptVal::Int(100))
    );

    for _ in 0..5 {
        stack.sendto(b, &[7u8; 60], 0, a_addr).unwrap();
    }
    thread::sleep(Duration::from_millis(20));
    let mut got = 0;
    let mut buf = [0u8; 64];
    while stack.recv(a, &mut buf, MSG_DONTWAIT).is_ok() {
        got += 1;
    }
    assert!((1..5).contains(&got), "received {}", got);
}

#[test]
fn test_connected_datagram_socket() {
    let stack = stack();
    let (a, a_addr) = udp(&stack);
    let (b, b_addr) = udp(&stack);
    stack.connect(b, Some(a_addr)).unwrap();
    assert_eq!(stack.getpeername(b), Ok(a_addr));
    assert_eq!(stack.send(b, b"ping", 0), Ok(4));
    let parts: [&[u8]; 2] = [b"po", b"ng"];
    assert_eq!(stack.writev(b, &parts), Ok(4));

    let mut buf = [0u8; 8];
    assert_eq!(stack.recvfrom(a, &mut buf, 0), Ok((4, Some(b_addr))));
    assert_eq!(stack.recvfrom(a, &mut buf, 0), Ok((4, Some(b_addr))));
    assert_eq!(&buf[..4], b"pong");

    stack.connect(b, None).unwrap();
    assert_eq!(stack.getpeername(b), Err(Errno::NOTCONN));
}

#[test]
fn test_raw_socket_roundtrip() {
    let stack = stack();
    let a = stack.socket(AF_INET, SOCK_RAW, 253).unwrap();
    let b = stack.socket(AF_INET, SOCK_RAW, 253).unwrap();
    stack.bind(a, localhost(0)).unwrap();

    stack.sendto(b, b"raw!", 0, localhost(0)).unwrap();
    let mut buf = [0u8; 16];
    let (n, _) = stack.recvfrom(a, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], b"raw!");
    assert_eq!(
        stack.getsockopt(a, libc::SOL_SOCKET, libc::SO_TYPE),
        Ok(SockOptVal::Int(SOCK_RAW))
    );
}

#[test]
fn test_ipv6_socket_sees_mapped_addresses() {
    let stack = stack();
    let (a, a_addr) = udp(&stack);
    let b = stack.socket(AF_INET6, SOCK_DGRAM, 0).unwrap();
    stack
        .setsockopt(b, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, SockOptVal::Int(0))
        .unwrap();
    assert_eq!(
        stack.getsockopt(b, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY),
        Ok(SockOptVal::Int(0))
    );
    assert_eq!(
        stack.getsockopt(a, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY),
        Err(Errno::NOPROTOOPT)
    );

    let mapped = SocketAddr::new(IpAddr::V6(Ipv4Addr::LOCALHOST.to_ipv6_mapped()), a_addr.port());
    stack.sendto(b, b"v6", 0, mapped).unwrap();
    let mut buf = [0u8; 4];
    let (_, from) = stack.recvfrom(a, &mut buf, 0).unwrap();
    assert!(from.is_some_and(|f| f.is_ipv4()));

    // a v4 socket refuses v6 addresses
    let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 9);
    assert_eq!(stack.sendto(a, b"x", 0, v6), Err(Errno::INVAL));
}

// ── select / poll ──

#[test]
fn test_select_wakes_on_data() {
    let stack = stack();
    let sockets = stack.sockets().clone();
    let (a, a_addr) = udp(&sockets);
    let (b, _) = udp(&sockets);

    let mut rs = FdSet::new();
    rs.insert(a);
    assert_eq!(
        sockets.select(a + 1, Some(&mut rs), None, None, Some(Duration::from_millis(30))),
        Ok(0)
    );
    assert!(rs.is_empty());

    thread::scope(|s| {
        let waiter = s.spawn(|| {
            let mut rs = FdSet::new();
            rs.insert(a);
            let n = sockets.select(a + 1, Some(&mut rs), None, None, Some(Duration::from_secs(5)));
            (n, rs.contains(a))
        });
        thread::sleep(Duration::from_millis(50));
        sockets.sendto(b, b"wake", 0, a_addr).unwrap();
        assert_eq!(waiter.join().unwrap(), (Ok(1), true));
    });

    // datagram sockets are always writable
    let mut rs: FdSet = [a, b].into_iter().collect();
    let mut ws: FdSet = [a, b].into_iter().collect();
    let n = sockets.select(b + 1, Some(&mut rs), Some(&mut ws), None, Some(Duration::ZERO));
    assert_eq!(n, Ok(3));
    assert!(rs.contains(a) && !rs.contains(b));
    assert_eq!(ws.len(), 2);

    let mut rs: FdSet = [a, 12].into_iter().collect();
    assert_eq!(
        sockets.select(13, Some(&mut rs), None, None, Some(Duration::ZERO)),
        Err(Errno::BADF)
    );
    assert_eq!(sockets.select(-1, None, None, None, Some(Duration::ZERO)), Err(Errno::INVAL));
}

#[test]
fn test_poll_matches_select() {
    let stack = stack();
    let (a, a_addr) = udp(&stack);
    let (b, _) = udp(&stack);
    let closed = stack.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    stack.close(closed).unwrap();

    let mut fds = [
        PollFd::new(a, PollFlags::POLLIN),
        PollFd::new(-1, PollFlags::POLLIN),
        PollFd::new(closed, PollFlags::POLLIN),
        PollFd::new(b, PollFlags::POLLOUT),
    ];
    assert_eq!(stack.poll(&mut fds, Some(Duration::ZERO)), Ok(2));
    assert!(fds[0].revents.is_empty());
    assert!(fds[1].revents.is_empty());
    assert_eq!(fds[2].revents, PollFlags::POLLNVAL);
    assert_eq!(fds[3].revents, PollFlags::POLLOUT);

    stack.sendto(b, b"x", 0, a_addr).unwrap();
    let start = Instant::now();
    let mut fds = [PollFd::new(a, PollFlags::POLLIN)];
    assert_eq!(stack.poll(&mut fds, Some(Duration::from_secs(5))), Ok(1));
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(fds[0].revents, PollFlags::POLLIN);

    let mut fds = [PollFd::new(a, PollFlags::POLLIN | PollFlags::POLLOUT)];
    assert_eq!(stack.poll(&mut fds, Some(Duration::ZERO)), Ok(1));
    assert_eq!(fds[0].revents, PollFlags::POLLIN | PollFlags::POLLOUT);

    let mut rs = FdSet::new();
    rs.insert(a);
    assert_eq!(stack.select(a + 1, Some(&mut rs), None, None, Some(Duration::ZERO)), Ok(1));
}

#[test]
fn test_poll_reports_reset() {
    let stack = stack();
    let (l, c, _srv) = tcp_pair(&stack);
    let port = stack.getsockname(l).unwrap().port();
    stack
        .tcpip()
        .with_engine(|e| loopback(e).reset_port(port))
        .unwrap();

    let mut fds = [PollFd::new(c, PollFlags::POLLIN)];
    assert_eq!(stack.poll(&mut fds, Some(Duration::from_secs(5))), Ok(1));
    assert!(fds[0].revents.contains(PollFlags::POLLERR));
    assert!(fds[0].revents.contains(PollFlags::POLLIN));

    let mut es = FdSet::new();
    es.insert(c);
    assert_eq!(stack.select(c + 1, None, None, Some(&mut es), Some(Duration::ZERO)), Ok(1));
}

// ── Options ──

#[test]
fn test_socket_level_options() {
    let stack = stack();
    let fd = stack.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    let get = |level, name| stack.getsockopt(fd, level, name);

    assert_eq!(get(libc::SOL_SOCKET, libc::SO_TYPE), Ok(SockOptVal::Int(SOCK_STREAM)));
    assert_eq!(get(libc::SOL_SOCKET, libc::SO_ACCEPTCONN), Ok(SockOptVal::Int(0)));
    assert_eq!(get(libc::SOL_SOCKET, libc::SO_BROADCAST), Err(Errno::NOPROTOOPT));
    assert_eq!(get(libc::SOL_SOCKET, 9999), Err(Errno::NOPROTOOPT));

    stack
        .setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, SockOptVal::Int(1))
        .unwrap();
    assert_eq!(get(libc::SOL_SOCKET, libc::SO_REUSEADDR), Ok(SockOptVal::Int(1)));
    stack
        .setsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, SockOptVal::Int(1))
        .unwrap();
    assert_eq!(get(libc::SOL_SOCKET, libc::SO_KEEPALIVE), Ok(SockOptVal::Int(1)));

    let t = Duration::from_millis(250);
    stack
        .setsockopt(fd, libc::SOL_SOCKET, libc::SO_RCVTIMEO, SockOptVal::Timeout(t))
        .unwrap();
    assert_eq!(get(libc::SOL_SOCKET, libc::SO_RCVTIMEO), Ok(SockOptVal::Timeout(t)));
    assert_eq!(get(libc::SOL_SOCKET, libc::SO_SNDTIMEO), Ok(SockOptVal::Timeout(Duration::ZERO)));
    assert_eq!(
        stack.setsockopt(fd, libc::SOL_SOCKET, libc::SO_RCVTIMEO, SockOptVal::Int(5)),
        Err(Errno::INVAL)
    );

    let linger = SockOptVal::Linger {
        onoff: true,
        secs: 70_000,
    };
    stack.setsockopt(fd, libc::SOL_SOCKET, libc::SO_LINGER, linger).unwrap();
    assert_eq!(
        get(libc::SOL_SOCKET, libc::SO_LINGER),
        Ok(SockOptVal::Linger {
            onoff: true,
            secs: 0xffff
        })
    );
    let negative = SockOptVal::Linger {
        onoff: true,
        secs: -1,
    };
    assert_eq!(
        stack.setsockopt(fd, libc::SOL_SOCKET, libc::SO_LINGER, negative),
        Err(Errno::INVAL)
    );

    stack
        .setsockopt(fd, libc::IPPROTO_IP, libc::IP_TTL, SockOptVal::Int(9))
        .unwrap();
    assert_eq!(get(libc::IPPROTO_IP, libc::IP_TTL), Ok(SockOptVal::Int(9)));
    assert_eq!(
        stack.setsockopt(fd, libc::IPPROTO_IP, libc::IP_TOS, SockOptVal::Int(300)),
        Err(Errno::INVAL)
    );

    stack.bind(fd, localhost(0)).unwrap();
    stack.listen(fd, 1).unwrap();
    assert_eq!(get(libc::SOL_SOCKET, libc::SO_ACCEPTCONN), Ok(SockOptVal::Int(1)));
}

#[test]
fn test_tcp_level_options() {
    let stack = stack();
    let (l, c, _srv) = tcp_pair(&stack);

    stack
        .setsockopt(c, libc::IPPROTO_TCP, libc::TCP_NODELAY, SockOptVal::Int(1))
        .unwrap();
    assert_eq!(
        stack.getsockopt(c, libc::IPPROTO_TCP, libc::TCP_NODELAY),
        Ok(SockOptVal::Int(1))
    );
    stack
        .setsockopt(c, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, SockOptVal::Int(30))
        .unwrap();
    assert_eq!(
        stack.getsockopt(c, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE),
        Ok(SockOptVal::Int(30))
    );
    stack
        .setsockopt(c, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, SockOptVal::Int(4))
        .unwrap();
    assert_eq!(
        stack.getsockopt(c, libc::IPPROTO_TCP, libc::TCP_KEEPCNT),
        Ok(SockOptVal::Int(4))
    );

    assert_eq!(
        stack.getsockopt(l, libc::IPPROTO_TCP, libc::TCP_NODELAY),
        Err(Errno::INVAL)
    );
    assert_eq!(
        stack.getsockopt(c, libc::IPPROTO_TCP, 9999),
        Err(Errno::NOPROTOOPT)
    );
    let (u, _) = udp(&stack);
    assert_eq!(
        stack.getsockopt(u, libc::IPPROTO_TCP, libc::TCP_NODELAY),
        Err(Errno::NOPROTOOPT)
    );
}

#[test]
fn test_datagram_options() {
    let stack = stack();
    let (u, _) = udp(&stack);
    stack
        .setsockopt(u, libc::SOL_SOCKET, libc::SO_BROADCAST, SockOptVal::Int(1))
        .unwrap();
    assert_eq!(
        stack.getsockopt(u, libc::SOL_SOCKET, libc::SO_BROADCAST),
        Ok(SockOptVal::Int(1))
    );
    stack
        .setsockopt(u, libc::SOL_SOCKET, SO_NO_CHECK, SockOptVal::Int(1))
        .unwrap();
    assert_eq!(
        stack.getsockopt(u, libc::SOL_SOCKET, SO_NO_CHECK),
        Ok(SockOptVal::Int(1))
    );
    stack
        .setsockopt(u, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, SockOptVal::Int(4))
        .unwrap();
    assert_eq!(
        stack.getsockopt(u, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL),
        Ok(SockOptVal::Int(4))
    );
    assert_eq!(
        stack.getsockopt(u, libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP),
        Ok(SockOptVal::Int(1))
    );
    let ifaddr = SockOptVal::Addr(Ipv4Addr::LOCALHOST);
    stack
        .setsockopt(u, libc::IPPROTO_IP, libc::IP_MULTICAST_IF, ifaddr)
        .unwrap();
    assert_eq!(stack.getsockopt(u, libc::IPPROTO_IP, libc::IP_MULTICAST_IF), Ok(ifaddr));

    let lite = stack
        .socket(AF_INET, SOCK_DGRAM, libc::IPPROTO_UDPLITE)
        .unwrap();
    assert_eq!(
        stack.setsockopt(lite, libc::SOL_SOCKET, SO_NO_CHECK, SockOptVal::Int(1)),
        Err(Errno::AFNOSUPPORT)
    );
    let tcp = stack.socket(AF_INET, SOCK_STREAM, 0).unwrap();
    assert_eq!(
        stack.getsockopt(tcp, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL),
        Err(Errno::NOPROTOOPT)
    );
}

#[test]
fn test_multicast_membership() {
    let stack = stack();
    let group = Ipv4Addr::new(239, 1, 2, 3);
    let a = stack.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    stack
        .bind(a, SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5353))
        .unwrap();
    let (b, _) = udp(&stack);
    let dst = SocketAddr::new(IpAddr::V4(group), 5353);
    let membership = SockOptVal::Membership {
        group,
        ifaddr: Ipv4Addr::UNSPECIFIED,
    };

    stack
        .setsockopt(a, libc::IPPROTO_IP, libc::IP_ADD_MEMBERSHIP, membership)
        .unwrap();
    stack.sendto(b, b"group", 0, dst).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(stack.recv(a, &mut buf, 0), Ok(5));

    stack
        .setsockopt(a, libc::IPPROTO_IP, libc::IP_DROP_MEMBERSHIP, membership)
        .unwrap();
    stack.sendto(b, b"group", 0, dst).unwrap();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(stack.recv(a, &mut buf, MSG_DONTWAIT), Err(Errno::WOULDBLOCK));

    let unicast = SockOptVal::Membership {
        group: Ipv4Addr::LOCALHOST,
        ifaddr: Ipv4Addr::UNSPECIFIED,
    };
    assert_eq!(
        stack.setsockopt(a, libc::IPPROTO_IP, libc::IP_ADD_MEMBERSHIP, unicast),
        Err(Errno(libc::EADDRNOTAVAIL))
    );

    // closing leaves the remaining groups
    stack
        .setsockopt(a, libc::IPPROTO_IP, libc::IP_ADD_MEMBERSHIP, membership)
        .unwrap();
    stack.close(a).unwrap();
    let c = stack.socket(AF_INET, SOCK_DGRAM, 0).unwrap();
    stack
        .bind(c, SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5353))
        .unwrap();
    stack.sendto(b, b"group", 0, dst).unwrap();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(stack.recv(c, &mut buf, MSG_DONTWAIT), Err(Errno::WOULDBLOCK));
}

#[test]
fn test_fcntl_and_ioctl() {
    let stack = stack();
    let (u, _) = udp(&stack);
    assert_eq!(stack.fcntl(u, libc::F_GETFL, 0), Ok(libc::O_RDWR));
    stack
        .fcntl(u, libc::F_SETFL, libc::O_NONBLOCK | libc::O_RDWR)
        .unwrap();
    assert_eq!(stack.fcntl(u, libc::F_GETFL, 0), Ok(libc::O_RDWR | libc::O_NONBLOCK));
    assert_eq!(stack.recv(u, &mut [0u8; 4], 0), Err(Errno::WOULDBLOCK));

    assert_eq!(stack.fcntl(u, libc::F_SETFL, libc::O_APPEND), Err(Errno::NOSYS));
    assert_eq!(stack.fcntl(u, libc::F_GETFD, 0), Err(Errno::NOSYS));

    let mut arg = 0;
    stack.ioctl(u, libc::FIONBIO as u64, &mut arg).unwrap();
    assert_eq!(stack.fcntl(u, libc::F_GETFL, 0), Ok(libc::O_RDWR));
    stack.ioctl(u, libc::FIONREAD as u64, &mut arg).unwrap();
    assert_eq!(arg, 0);
    assert_eq!(stack.ioctl(u, 0x1234, &mut arg), Err(Errno::NOSYS));

    let (_l, c, _srv) = tcp_pair(&stack);
    assert_eq!(stack.fcntl(c, libc::F_GETFL, 0), Ok(libc::O_RDWR));
}

// ── Name resolution ──

#[test]
fn test_name_resolution() {
    let stack = stack();
    let remote = IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3));
    stack
        .tcpip()
        .with_engine(|e| loopback(e).add_host("example.test", remote))
        .unwrap();

    let host = stack.gethostbyname("example.test").unwrap();
    assert_eq!(host.addrs, vec![remote]);
    assert_eq!(
        stack.gethostbyname("missing.test"),
        Err(NetdbError::HostNotFound)
    );

    let res = stack.getaddrinfo(Some("example.test"), Some("80"), None).unwrap();
    assert_eq!(res[0].addr, SocketAddr::new(remote, 80));
    assert_eq!(res[0].family, AF_INET);
    assert_eq!(res[0].canonname.as_deref(), Some("example.test"));

    let numeric = AddrInfoHints {
        flags: libc::AI_NUMERICHOST,
        ..AddrInfoHints::default()
    };
    let res = stack.getaddrinfo(Some("::1"), None, Some(&numeric)).unwrap();
    assert_eq!(res[0].addr, SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 0));
    assert_eq!(res[0].family, AF_INET6);
    assert_eq!(
        stack.getaddrinfo(Some("not-a-number"), None, Some(&numeric)),
        Err(NetdbError::NoName)
    );

    let passive = AddrInfoHints {
        flags: libc::AI_PASSIVE,
        family: AF_INET6,
        ..AddrInfoHints::default()
    };
    let res = stack.getaddrinfo(None, Some("8080"), Some(&passive)).unwrap();
    assert_eq!(res[0].addr, "[::]:8080".parse().unwrap());
    let res = stack.getaddrinfo(None, Some("7"), None).unwrap();
    assert_eq!(res[0].addr, localhost(7));

    assert_eq!(stack.getaddrinfo(None, None, None), Err(NetdbError::NoName));
    assert_eq!(
        stack.getaddrinfo(None, Some("http"), None),
        Err(NetdbError::Service)
    );
    let bad_family = AddrInfoHints {
        family: libc::AF_UNIX,
        ..AddrInfoHints::default()
    };
    assert_eq!(
        stack.getaddrinfo(Some("example.test"), None, Some(&bad_family)),
        Err(NetdbError::Family)
    );
    assert_eq!(
        stack.getaddrinfo(Some("missing.test"), None, None),
        Err(NetdbError::Fail)
    );
}

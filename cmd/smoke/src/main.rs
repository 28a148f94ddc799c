//! Netconn End-to-End Smoke Test
//!
//! Runs the whole stack over the loopback engine, once per dispatch
//! mode:
//!   Part A: Netconn API: stream and datagram exchange
//!   Part B: Socket layer: descriptors, connect/accept, shutdown
//!   Part C: Options: socket, IP and TCP levels, ioctl, fcntl
//!   Part D: Multiplexing: select and poll
//!   Part E: Name resolution: gethostbyname, getaddrinfo
//!
//! Run: ./target/release/netconn-smoke

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use netconn::socket::MSG_DONTWAIT;
use netconn::{
    AddrInfoHints, DispatchMode, Errno, FdSet, IpFamily, Netbuf, Netconn, NetconnType, PollFd,
    ProtocolEngine, SockOptVal, Stack, StackConfig, WriteFlags,
};
use nix::poll::PollFlags;
use tcpip_loopback::{LoopbackConfig, LoopbackEngine};

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    /// Pass when `res` is `Ok`, fail with its error otherwise.
    fn ok<T, E: std::fmt::Display>(&mut self, name: &str, res: Result<T, E>) -> Option<T> {
        match res {
            Ok(v) => {
                self.pass(name);
                Some(v)
            }
            Err(e) => {
                self.fail(name, &e.to_string());
                None
            }
        }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

fn localhost(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

fn loopback(engine: &mut dyn ProtocolEngine) -> Option<&mut LoopbackEngine> {
    engine.as_any_mut().downcast_mut::<LoopbackEngine>()
}

// ── Part A: Netconn API ──

fn test_netconn(t: &mut TestRunner, stack: &Stack) {
    t.section("Part A: Netconn API");
    let tcpip = stack.tcpip();

    let Some(l) = t.ok("tcp listener create", Netconn::new(tcpip, NetconnType::Tcp, IpFamily::V4)) else {
        return;
    };
    t.ok("tcp listener bind", l.bind(localhost(0)));
    t.ok("tcp listener listen", l.listen());
    let Some(addr) = t.ok("tcp listener local_addr", l.local_addr()) else {
        return;
    };

    let Some(client) = t.ok("tcp client create", Netconn::new(tcpip, NetconnType::Tcp, IpFamily::V4)) else {
        return;
    };
    t.ok("tcp client connect", client.connect(addr));
    let Some(server) = t.ok("tcp accept", l.accept()) else {
        return;
    };
    t.ok("tcp write", client.write(b"netconn smoke", WriteFlags::COPY));
    match server.recv() {
        Ok(buf) => t.check(
            "tcp recv matches write",
            buf.to_vec() == b"netconn smoke",
            "payload differs",
        ),
        Err(e) => t.fail("tcp recv matches write", &e.to_string()),
    }
    t.ok("tcp client close", client.close());
    t.check(
        "tcp peer sees end of stream",
        server.recv().is_err(),
        "recv after close returned data",
    );

    let a = Netconn::new(tcpip, NetconnType::Udp, IpFamily::V4);
    let b = Netconn::new(tcpip, NetconnType::Udp, IpFamily::V4);
    let (Some(a), Some(b)) = (t.ok("udp create a", a), t.ok("udp create b", b)) else {
        return;
    };
    t.ok("udp bind", a.bind(localhost(0)));
    let Some(a_addr) = t.ok("udp local_addr", a.local_addr()) else {
        return;
    };
    t.ok("udp sendto", b.sendto(Netbuf::from(b"datagram".to_vec()), a_addr));
    match a.recv() {
        Ok(buf) => t.check(
            "udp recv matches sendto",
            buf.to_vec() == b"datagram" && buf.addr().is_some(),
            "payload or sender missing",
        ),
        Err(e) => t.fail("udp recv matches sendto", &e.to_string()),
    }
}

// ── Part B: Socket layer ──

fn test_sockets(t: &mut TestRunner, stack: &Stack) {
    t.section("Part B: Socket layer");

    let Some(l) = t.ok("socket(AF_INET, SOCK_STREAM)", stack.socket(libc::AF_INET, libc::SOCK_STREAM, 0)) else {
        return;
    };
    t.ok("bind 127.0.0.1:0", stack.bind(l, localhost(0)));
    t.ok("listen backlog 0", stack.listen(l, 0));
    let Some(addr) = t.ok("getsockname", stack.getsockname(l)) else {
        return;
    };
    t.check("ephemeral port assigned", addr.port() != 0, "port is 0");

    let Some(c) = t.ok("client socket", stack.socket(libc::AF_INET, libc::SOCK_STREAM, 0)) else {
        return;
    };
    t.ok("fcntl O_NONBLOCK", stack.fcntl(c, libc::F_SETFL, libc::O_NONBLOCK));
    t.check(
        "nonblocking connect in progress",
        stack.connect(c, Some(addr)) == Err(Errno(libc::EINPROGRESS)),
        "expected EINPROGRESS",
    );
    let again = stack.connect(c, Some(addr));
    t.check(
        "second connect rejected",
        again == Err(Errno(libc::EALREADY)) || again == Err(Errno(libc::EISCONN)),
        "expected EALREADY or EISCONN",
    );
    let Some((srv, peer)) = t.ok("accept", stack.accept(l)) else {
        return;
    };
    t.check(
        "accepted peer is the client",
        stack.getsockname(c).ok() == Some(peer),
        "peer address differs",
    );

    let mut ws = FdSet::new();
    ws.insert(c);
    t.check(
        "client becomes writable",
        stack.select(c + 1, None, Some(&mut ws), None, Some(Duration::from_secs(5))) == Ok(1),
        "select timed out",
    );
    t.ok("back to blocking", stack.fcntl(c, libc::F_SETFL, 0));

    let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let sent = std::thread::scope(|s| {
        let writer = s.spawn(|| stack.write(c, &data));
        let mut got = vec![0u8; data.len()];
        let mut off = 0;
        while off < got.len() {
            match stack.recv(srv, &mut got[off..], 0) {
                Ok(0) | Err(_) => break,
                Ok(n) => off += n,
            }
        }
        t.check("20000 bytes arrive intact", got == data, "stream corrupted");
        writer.join().ok().and_then(|r| r.ok())
    });
    t.check("write reports every byte", sent == Some(data.len()), "short write");

    t.ok("shutdown SHUT_WR", stack.sockets().shutdown(c, libc::SHUT_WR));
    t.check(
        "peer reads end of stream",
        stack.recv(srv, &mut [0u8; 8], 0) == Ok(0),
        "expected 0",
    );
    t.ok("close client", stack.close(c));
    t.check("closed descriptor is invalid", stack.close(c) == Err(Errno::BADF), "expected EBADF");
    t.ok("close server", stack.close(srv));
    t.ok("close listener", stack.close(l));
    t.check("no descriptors left", stack.open_count() == 0, "descriptors still open");
}

// ── Part C: Options ──

fn test_options(t: &mut TestRunner, stack: &Stack) {
    t.section("Part C: Options");

    let Some(fd) = t.ok("socket(AF_INET, SOCK_DGRAM)", stack.socket(libc::AF_INET, libc::SOCK_DGRAM, 0)) else {
        return;
    };
    t.check(
        "SO_TYPE is SOCK_DGRAM",
        stack.getsockopt(fd, libc::SOL_SOCKET, libc::SO_TYPE) == Ok(SockOptVal::Int(libc::SOCK_DGRAM)),
        "wrong type",
    );
    t.ok("IP_TTL set", stack.setsockopt(fd, libc::IPPROTO_IP, libc::IP_TTL, SockOptVal::Int(17)));
    t.check(
        "IP_TTL reads back",
        stack.getsockopt(fd, libc::IPPROTO_IP, libc::IP_TTL) == Ok(SockOptVal::Int(17)),
        "ttl differs",
    );
    t.check(
        "TCP option on datagram socket",
        stack.getsockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY) == Err(Errno::NOPROTOOPT),
        "expected ENOPROTOOPT",
    );
    let timeout = SockOptVal::Timeout(Duration::from_millis(20));
    t.ok("SO_RCVTIMEO set", stack.setsockopt(fd, libc::SOL_SOCKET, libc::SO_RCVTIMEO, timeout));
    t.ok("bind", stack.bind(fd, localhost(0)));
    t.check(
        "recv times out",
        stack.recv(fd, &mut [0u8; 4], 0) == Err(Errno::WOULDBLOCK),
        "expected EWOULDBLOCK",
    );

    let mut avail = -1;
    t.ok("ioctl FIONREAD", stack.ioctl(fd, libc::FIONREAD as u64, &mut avail));
    t.check("nothing readable", avail == 0, "expected 0");
    let mut on = 1;
    t.ok("ioctl FIONBIO", stack.ioctl(fd, libc::FIONBIO as u64, &mut on));
    t.check(
        "F_GETFL reports O_NONBLOCK",
        stack.fcntl(fd, libc::F_GETFL, 0) == Ok(libc::O_RDWR | libc::O_NONBLOCK),
        "flags differ",
    );
    t.check(
        "unknown ioctl",
        stack.ioctl(fd, 0x1234, &mut on) == Err(Errno::NOSYS),
        "expected ENOSYS",
    );

    let group = SockOptVal::Membership {
        group: Ipv4Addr::new(239, 0, 0, 1),
        ifaddr: Ipv4Addr::UNSPECIFIED,
    };
    t.ok("IP_ADD_MEMBERSHIP", stack.setsockopt(fd, libc::IPPROTO_IP, libc::IP_ADD_MEMBERSHIP, group));
    t.ok("IP_DROP_MEMBERSHIP", stack.setsockopt(fd, libc::IPPROTO_IP, libc::IP_DROP_MEMBERSHIP, group));
    t.ok("close", stack.close(fd));
}

// ── Part D: Multiplexing ──

fn test_multiplexing(t: &mut TestRunner, stack: &Stack) {
    t.section("Part D: Multiplexing");

    let a = stack.socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
    let b = stack.socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
    let (Some(a), Some(b)) = (t.ok("socket a", a), t.ok("socket b", b)) else {
        return;
    };
    t.ok("bind a", stack.bind(a, localhost(0)));
    let Some(a_addr) = t.ok("getsockname a", stack.getsockname(a)) else {
        return;
    };

    let mut rs = FdSet::new();
    rs.insert(a);
    t.check(
        "select times out when idle",
        stack.select(a + 1, Some(&mut rs), None, None, Some(Duration::from_millis(20))) == Ok(0),
        "expected 0",
    );
    t.ok("sendto a", stack.sendto(b, b"ready", 0, a_addr));
    rs.insert(a);
    t.check(
        "select reports readable",
        stack.select(a + 1, Some(&mut rs), None, None, Some(Duration::from_secs(5))) == Ok(1)
            && rs.contains(a),
        "not readable",
    );

    let mut fds = [
        PollFd::new(a, PollFlags::POLLIN),
        PollFd::new(b, PollFlags::POLLOUT),
        PollFd::new(a.max(b) + 100, PollFlags::POLLIN),
    ];
    t.check(
        "poll counts ready and invalid entries",
        stack.poll(&mut fds, Some(Duration::ZERO)) == Ok(3),
        "expected 3",
    );
    t.check("poll POLLIN", fds[0].revents == PollFlags::POLLIN, "missing POLLIN");
    t.check("poll POLLOUT", fds[1].revents == PollFlags::POLLOUT, "missing POLLOUT");
    t.check("poll POLLNVAL", fds[2].revents == PollFlags::POLLNVAL, "missing POLLNVAL");

    t.check(
        "recv with MSG_DONTWAIT",
        stack.recv(a, &mut [0u8; 8], MSG_DONTWAIT) == Ok(5),
        "expected 5 bytes",
    );
    let _ = stack.close(a);
    let _ = stack.close(b);
}

// ── Part E: Name resolution ──

fn test_netdb(t: &mut TestRunner, stack: &Stack) {
    t.section("Part E: Name resolution");

    let remote = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7));
    let added = stack.tcpip().with_engine(|e| match loopback(e) {
        Some(lo) => {
            lo.add_host("smoke.test", remote);
            true
        }
        None => false,
    });
    t.check("register host", added == Ok(true), "engine is not the loopback engine");

    match stack.gethostbyname("smoke.test") {
        Ok(h) => t.check("gethostbyname", h.addrs == vec![remote], "wrong address"),
        Err(e) => t.fail("gethostbyname", &e.to_string()),
    }
    t.check(
        "gethostbyname unknown name",
        stack.gethostbyname("nowhere.test").is_err(),
        "unexpected answer",
    );

    let numeric = AddrInfoHints {
        flags: libc::AI_NUMERICHOST,
        ..AddrInfoHints::default()
    };
    match stack.getaddrinfo(Some("127.0.0.1"), Some("8080"), Some(&numeric)) {
        Ok(res) => t.check(
            "getaddrinfo numeric host",
            res.first().map(|ai| ai.addr) == Some(localhost(8080)),
            "wrong address",
        ),
        Err(e) => t.fail("getaddrinfo numeric host", &e.to_string()),
    }
    t.check(
        "getaddrinfo bad service",
        stack.getaddrinfo(None, Some("echo"), None).is_err(),
        "service accepted",
    );
}

fn run(t: &mut TestRunner, dispatch: DispatchMode) {
    println!("\n=== dispatch: {:?} ===", dispatch);
    let config = StackConfig::from_env()
        .slow_timer_interval(Duration::from_millis(10))
        .dispatch(dispatch);
    let engine = LoopbackEngine::new(LoopbackConfig::from_env());
    let mut stack = match Stack::new(Box::new(engine), config) {
        Ok(s) => s,
        Err(e) => {
            t.fail("stack start", &e.to_string());
            return;
        }
    };

    test_netconn(t, &stack);
    test_sockets(t, &stack);
    test_options(t, &stack);
    test_multiplexing(t, &stack);
    test_netdb(t, &stack);

    stack.shutdown();
    t.check("engine stopped", !stack.tcpip().is_running(), "still running");
}

fn main() {
    println!("=== Netconn End-to-End Smoke Test ===");

    let mut t = TestRunner::new();
    run(&mut t, DispatchMode::Mailbox);
    run(&mut t, DispatchMode::CoreLock);

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}

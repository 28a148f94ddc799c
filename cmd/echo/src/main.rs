//! Netconn Echo Server
//!
//! Single-threaded TCP echo server written against the socket layer.
//! The listener and every accepted connection are multiplexed with
//! `select`; client threads in the same process connect over the
//! loopback engine, send numbered lines and check the echoes.
//!
//! Usage:
//!     cargo build --release -p netconn-echo
//!     ./target/release/netconn-echo [clients] [rounds] [mailbox|corelock]
//!
//! Environment:
//!     NETCONN_*         stack configuration
//!     NETCONN_LOOP_*    loopback engine sizing
//!     NETCONN_LOG_LEVEL error|warn|info|debug|trace

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use netconn::socket::MSG_DONTWAIT;
use netconn::{kerror, kinfo, DispatchMode, Errno, Fd, FdSet, Sockets, Stack, StackConfig};
use tcpip_loopback::{LoopbackConfig, LoopbackEngine};

// ── Defaults ──
const PORT: u16 = 7;
const CLIENTS: usize = 4;
const ROUNDS: usize = 1000;
const BUF_SIZE: usize = 4096;
const SELECT_TIMEOUT: Duration = Duration::from_millis(100);
const STATS_INTERVAL: Duration = Duration::from_secs(5);

// ── Stats ──
struct Stats {
    accepts: u64,
    recvs: u64,
    sends: u64,
    closes: u64,
    bytes_in: u64,
    bytes_out: u64,
    errors: u64,
}

impl Stats {
    fn new() -> Self {
        Self { accepts: 0, recvs: 0, sends: 0, closes: 0, bytes_in: 0, bytes_out: 0, errors: 0 }
    }

    fn print(&self, conns: usize, elapsed_secs: f64) {
        eprintln!(
            "[{:.1}s] conns={} accepts={} recv={} send={} close={} bytes_in={} bytes_out={} err={}",
            elapsed_secs,
            conns,
            self.accepts, self.recvs, self.sends, self.closes,
            self.bytes_in, self.bytes_out, self.errors,
        );
    }
}

// ── Server ──

fn setup_listener(sockets: &Sockets, port: u16, backlog: i32) -> Result<Fd, Errno> {
    let fd = sockets.socket(libc::AF_INET, libc::SOCK_STREAM, 0)?;
    sockets.setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, netconn::SockOptVal::Int(1))?;
    sockets.bind(fd, SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))?;
    sockets.listen(fd, backlog)?;
    Ok(fd)
}

/// Write all of `data`, looping over partial writes.
fn send_all(sockets: &Sockets, fd: Fd, data: &[u8]) -> Result<usize, Errno> {
    let mut off = 0;
    while off < data.len() {
        off += sockets.send(fd, &data[off..], 0)?;
    }
    Ok(off)
}

fn serve(sockets: &Sockets, listener: Fd, clients_done: &AtomicUsize, clients: usize) -> Stats {
    let mut stats = Stats::new();
    let mut conns: Vec<Fd> = Vec::new();
    let mut buf = vec![0u8; BUF_SIZE];
    let start = Instant::now();
    let mut last_stats = start;

    while RUNNING.load(Ordering::Relaxed)
        && (clients_done.load(Ordering::Acquire) < clients || !conns.is_empty())
    {
        let mut rs: FdSet = conns.iter().copied().chain([listener]).collect();
        let maxfdp1 = rs.iter().max().map_or(0, |fd| fd + 1);
        match sockets.select(maxfdp1, Some(&mut rs), None, None, Some(SELECT_TIMEOUT)) {
            Ok(0) => {}
            Ok(_) => {
                if rs.contains(listener) {
                    match sockets.accept(listener) {
                        Ok((fd, peer)) => {
                            stats.accepts += 1;
                            kinfo!("accepted {} from {}", fd, peer);
                            conns.push(fd);
                        }
                        Err(e) => {
                            stats.errors += 1;
                            kerror!("accept failed: {}", e);
                        }
                    }
                }

                let mut closed = Vec::new();
                for fd in conns.iter().copied().filter(|fd| rs.contains(*fd)) {
                    match sockets.recv(fd, &mut buf, MSG_DONTWAIT) {
                        Ok(0) => closed.push(fd),
                        Ok(n) => {
                            stats.recvs += 1;
                            stats.bytes_in += n as u64;
                            match send_all(sockets, fd, &buf[..n]) {
                                Ok(sent) => {
                                    stats.sends += 1;
                                    stats.bytes_out += sent as u64;
                                }
                                Err(e) => {
                                    stats.errors += 1;
                                    kerror!("send on {} failed: {}", fd, e);
                                    closed.push(fd);
                                }
                            }
                        }
                        Err(Errno::WOULDBLOCK) => {}
                        Err(e) => {
                            stats.errors += 1;
                            kerror!("recv on {} failed: {}", fd, e);
                            closed.push(fd);
                        }
                    }
                }
                for fd in closed {
                    let _ = sockets.close(fd);
                    stats.closes += 1;
                    conns.retain(|c| *c != fd);
                }
            }
            Err(e) => {
                stats.errors += 1;
                kerror!("select failed: {}", e);
                break;
            }
        }

        let now = Instant::now();
        if now.duration_since(last_stats) >= STATS_INTERVAL {
            stats.print(conns.len(), now.duration_since(start).as_secs_f64());
            last_stats = now;
        }
    }

    for fd in conns {
        let _ = sockets.close(fd);
        stats.closes += 1;
    }
    stats
}

// ── Clients ──

fn run_client(sockets: &Sockets, id: usize, server: SocketAddr, rounds: usize) -> Result<u64, Errno> {
    let fd = sockets.socket(libc::AF_INET, libc::SOCK_STREAM, 0)?;
    let res = (|| {
        sockets.connect(fd, Some(server))?;
        let mut bytes = 0u64;
        let mut reply = vec![0u8; 64];
        for round in 0..rounds {
            if !RUNNING.load(Ordering::Relaxed) {
                break;
            }
            let line = format!("ping {} {}\n", id, round);
            send_all(sockets, fd, line.as_bytes())?;
            let mut got = 0;
            while got < line.len() {
                let n = sockets.recv(fd, &mut reply[got..line.len()], 0)?;
                if n == 0 {
                    return Err(Errno::NOTCONN);
                }
                got += n;
            }
            if &reply[..got] != line.as_bytes() {
                return Err(Errno::INVAL);
            }
            bytes += got as u64;
        }
        Ok(bytes)
    })();
    let _ = sockets.close(fd);
    res
}

// ── Main ──

static RUNNING: AtomicBool = AtomicBool::new(true);

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let clients: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(CLIENTS);
    let rounds: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(ROUNDS);
    let dispatch = match args.get(3).map(String::as_str) {
        Some("corelock") => DispatchMode::CoreLock,
        _ => DispatchMode::Mailbox,
    };

    // SIGINT handler for clean shutdown
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
        libc::signal(libc::SIGTERM, handle_sigint as usize);
    }

    // listener + two descriptors per client
    let needed = 2 * clients + 1;
    let mut config = StackConfig::from_env().dispatch(dispatch);
    if config.num_sockets < needed {
        config = config.num_sockets(needed);
    }
    if config.max_netconns < needed {
        config = config.max_netconns(needed);
    }
    if let Err(e) = config.validate() {
        eprintln!("netconn-echo: bad configuration: {}", e);
        std::process::exit(2);
    }
    config.print();

    let mut engine_config = LoopbackConfig::from_env();
    if engine_config.max_pcbs < needed {
        engine_config = engine_config.max_pcbs(needed);
    }

    let mut stack = match Stack::new(Box::new(LoopbackEngine::new(engine_config)), config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("netconn-echo: stack failed to start: {}", e);
            std::process::exit(1);
        }
    };
    let sockets = stack.sockets().clone();

    let backlog = i32::try_from(clients).unwrap_or(i32::MAX);
    let listener = match setup_listener(&sockets, PORT, backlog) {
        Ok(fd) => fd,
        Err(e) => {
            eprintln!("netconn-echo: listener setup failed: {}", e);
            std::process::exit(1);
        }
    };
    let server = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), PORT);
    eprintln!(
        "netconn-echo: listening on 0.0.0.0:{} ({} clients x {} rounds, {:?})",
        PORT, clients, rounds, dispatch
    );

    let start = Instant::now();
    let clients_done = AtomicUsize::new(0);
    let mut failures = 0;
    let mut echoed = 0u64;

    let stats = thread::scope(|s| {
        let workers: Vec<_> = (0..clients)
            .map(|id| {
                let sockets = &sockets;
                let clients_done = &clients_done;
                s.spawn(move || {
                    let res = run_client(sockets, id, server, rounds);
                    clients_done.fetch_add(1, Ordering::Release);
                    res
                })
            })
            .collect();

        let stats = serve(&sockets, listener, &clients_done, clients);

        for (id, w) in workers.into_iter().enumerate() {
            match w.join() {
                Ok(Ok(bytes)) => echoed += bytes,
                Ok(Err(e)) => {
                    failures += 1;
                    eprintln!("netconn-echo: client {} failed: {}", id, e);
                }
                Err(_) => {
                    failures += 1;
                    eprintln!("netconn-echo: client {} panicked", id);
                }
            }
        }
        stats
    });

    // Shutdown
    let elapsed = start.elapsed().as_secs_f64();
    eprintln!("\nnetconn-echo: shutting down...");
    stats.print(0, elapsed);
    let _ = sockets.close(listener);
    let engine = stack.tcpip().stats();
    eprintln!(
        "netconn-echo: {} bytes echoed in {:.2}s ({:.1} KB/s), engine messages={} ticks={}",
        echoed,
        elapsed,
        echoed as f64 / 1024.0 / elapsed.max(f64::EPSILON),
        engine.messages,
        engine.ticks,
    );
    stack.shutdown();
    eprintln!("netconn-echo: done.");
    std::process::exit(if failures > 0 { 1 } else { 0 });
}

extern "C" fn handle_sigint(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

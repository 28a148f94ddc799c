use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use netconn_core::error::{NetError, NetResult};
use tcpip_core::{
    IpFamily, Pbuf, PcbId, PcbOption, ProtocolEngine, RawHandler, Refused, TcpCallbacks,
    TcpHandler, TcpState, TcpWriteFlags, UdpHandler,
};

use crate::{LoopbackConfig, LoopbackEngine};

#[derive(Debug, Clone, PartialEq)]
enum Ev {
    Data(PcbId, Vec<u8>),
    Fin(PcbId),
    Sent(PcbId, usize),
    Poll(PcbId),
    Err(NetError),
    Accepted(PcbId),
    AcceptFailed(NetError),
    Connected(PcbId),
}

/// Records every callback. Accepted blocks get the same recorder.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Ev>>,
    refuse: AtomicBool,
    reject_accept: AtomicBool,
    me: Mutex<Option<Arc<Recorder>>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        let r = Arc::new(Recorder::default());
        *r.me.lock().unwrap() = Some(r.clone());
        r
    }

    fn take(&self) -> Vec<Ev> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    fn push(&self, ev: Ev) {
        self.events.lock().unwrap().push(ev);
    }
}

impl TcpHandler for Recorder {
    fn recv(&self, _e: &mut dyn ProtocolEngine, pcb: PcbId, data: Option<Pbuf>) -> Result<(), Refused> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Refused(data));
        }
        match data {
            Some(p) => self.push(Ev::Data(pcb, p.to_vec())),
            None => self.push(Ev::Fin(pcb)),
        }
        Ok(())
    }

    fn sent(&self, _e: &mut dyn ProtocolEngine, pcb: PcbId, len: usize) {
        self.push(Ev::Sent(pcb, len));
    }

    fn poll(&self, _e: &mut dyn ProtocolEngine, pcb: PcbId) {
        self.push(Ev::Poll(pcb));
    }

    fn err(&self, err: NetError) {
        self.push(Ev::Err(err));
    }

    fn accept(&self, e: &mut dyn ProtocolEngine, _l: PcbId, new: NetResult<PcbId>) -> NetResult<()> {
        match new {
            Ok(pcb) => {
                if self.reject_accept.load(Ordering::SeqCst) {
                    return Err(NetError::Mem);
                }
                let me: Option<Arc<dyn TcpHandler>> =
                    self.me.lock().unwrap().clone().map(|m| m as Arc<dyn TcpHandler>);
                e.tcp_set_handler(pcb, me);
                e.tcp_set_callbacks(pcb, stream());
                self.push(Ev::Accepted(pcb));
                Ok(())
            }
            Err(err) => {
                self.push(Ev::AcceptFailed(err));
                Err(err)
            }
        }
    }

    fn connected(&self, _e: &mut dyn ProtocolEngine, pcb: PcbId) {
        self.push(Ev::Connected(pcb));
    }
}

/// Data-path callbacks without the poll timer
fn stream() -> TcpCallbacks {
    TcpCallbacks::RECV | TcpCallbacks::SENT | TcpCallbacks::ERR
}

fn run(e: &mut LoopbackEngine) {
    while e.process() {}
}

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn arm(e: &mut LoopbackEngine, pcb: PcbId, rec: &Arc<Recorder>, cbs: TcpCallbacks) {
    e.tcp_set_handler(pcb, Some(rec.clone() as Arc<dyn TcpHandler>));
    e.tcp_set_callbacks(pcb, cbs);
}

/// Listener on an ephemeral port plus an established client.
fn connected_pair(e: &mut LoopbackEngine, rec: &Arc<Recorder>) -> (PcbId, PcbId, PcbId) {
    let l = e.tcp_new(IpFamily::V4).unwrap();
    e.tcp_bind(l, addr("127.0.0.1:0")).unwrap();
    e.tcp_listen(l, 4).unwrap();
    arm(e, l, rec, TcpCallbacks::ACCEPT);
    let port = e.local_addr(l).unwrap().port();

    let c = e.tcp_new(IpFamily::V4).unwrap();
    arm(e, c, rec, stream());
    e.tcp_connect(c, SocketAddr::new("127.0.0.1".parse().unwrap(), port)).unwrap();
    run(e);

    let evs = rec.take();
    assert!(evs.contains(&Ev::Connected(c)));
    let s = evs
        .iter()
        .find_map(|ev| match ev {
            Ev::Accepted(p) => Some(*p),
            _ => None,
        })
        .expect("accepted");
    (l, c, s)
}

#[test]
fn test_handshake_and_data() {
    let mut e = LoopbackEngine::default();
    let rec = Recorder::new();
    let (_l, c, s) = connected_pair(&mut e, &rec);
    assert_eq!(e.tcp_state(c), TcpState::Established);
    assert_eq!(e.remote_addr(s).unwrap(), e.local_addr(c).unwrap());

    e.tcp_write(c, b"ping", TcpWriteFlags::COPY).unwrap();
    e.tcp_output(c).unwrap();
    assert!(e.tcp_has_pending(c));
    run(&mut e);
    let evs = rec.take();
    assert!(evs.contains(&Ev::Data(s, b"ping".to_vec())));
    assert!(evs.contains(&Ev::Sent(c, 4)));
    assert!(!e.tcp_has_pending(c));
}

#[test]
fn test_window_backpressure() {
    let cfg = LoopbackConfig::default().wnd(1000).snd_buf(4000).mss(500);
    let mut e = LoopbackEngine::new(cfg);
    let rec = Recorder::new();
    let (_l, c, s) = connected_pair(&mut e, &rec);

    e.tcp_write(c, &[7u8; 3000], TcpWriteFlags::COPY).unwrap();
    run(&mut e);
    let got: usize = rec
        .take()
        .iter()
        .map(|ev| match ev {
            Ev::Data(p, d) if *p == s => d.len(),
            _ => 0,
        })
        .sum();
    assert_eq!(got, 1000);
    assert_eq!(e.tcp_sndbuf(c), 2000);
    assert_eq!(e.tcp_write(c, &[0u8; 2001], TcpWriteFlags::COPY), Err(NetError::Mem));

    e.tcp_recved(s, 1000);
    run(&mut e);
    let evs = rec.take();
    assert!(evs.contains(&Ev::Sent(c, 1000)));
    assert_eq!(e.tcp_sndbuf(c), 3000);
}

#[test]
fn test_refused_data_redelivered() {
    let mut e = LoopbackEngine::default();
    let rec = Recorder::new();
    let (_l, c, s) = connected_pair(&mut e, &rec);

    rec.refuse.store(true, Ordering::SeqCst);
    e.tcp_write(c, b"abc", TcpWriteFlags::COPY).unwrap();
    run(&mut e);
    assert!(!rec.take().iter().any(|ev| matches!(ev, Ev::Data(..))));

    rec.refuse.store(false, Ordering::SeqCst);
    run(&mut e);
    assert_eq!(rec.take(), vec![Ev::Data(s, b"abc".to_vec())]);
}

#[test]
fn test_orderly_close_frees_both_ends() {
    let mut e = LoopbackEngine::default();
    let rec = Recorder::new();
    let (l, c, s) = connected_pair(&mut e, &rec);
    assert_eq!(e.pcb_count(), 3);

    e.tcp_set_handler(c, None);
    e.tcp_set_callbacks(c, TcpCallbacks::NONE);
    e.tcp_close(c).unwrap();
    run(&mut e);
    assert_eq!(rec.take(), vec![Ev::Fin(s)]);
    assert_eq!(e.tcp_state(s), TcpState::CloseWait);
    assert_eq!(e.tcp_state(c), TcpState::FinWait2);

    e.tcp_recved(s, 1);
    e.tcp_set_handler(s, None);
    e.tcp_close(s).unwrap();
    run(&mut e);
    assert_eq!(e.pcb_count(), 1);

    e.tcp_close(l).unwrap();
    assert_eq!(e.pcb_count(), 0);
}

#[test]
fn test_close_with_unread_data_resets_peer() {
    let mut e = LoopbackEngine::default();
    let rec = Recorder::new();
    let (_l, c, s) = connected_pair(&mut e, &rec);

    e.tcp_write(c, b"unread", TcpWriteFlags::COPY).unwrap();
    run(&mut e);
    rec.take();
    e.tcp_set_handler(s, None);
    e.tcp_close(s).unwrap();
    run(&mut e);
    assert_eq!(rec.take(), vec![Ev::Err(NetError::Reset)]);
    assert_eq!(e.tcp_state(c), TcpState::Closed);
}

#[test]
fn test_connect_without_listener_resets() {
    let mut e = LoopbackEngine::default();
    let rec = Recorder::new();
    let c = e.tcp_new(IpFamily::V4).unwrap();
    arm(&mut e, c, &rec, stream());
    e.tcp_connect(c, addr("127.0.0.1:9")).unwrap();
    run(&mut e);
    assert_eq!(rec.take(), vec![Ev::Err(NetError::Reset)]);
    assert_eq!(e.pcb_count(), 0);

    let d = e.tcp_new(IpFamily::V4).unwrap();
    assert_eq!(e.tcp_connect(d, addr("192.0.2.1:80")), Err(NetError::Rte));
}

#[test]
fn test_backlog_holds_syn_until_accepted() {
    let mut e = LoopbackEngine::default();
    let rec = Recorder::new();
    let l = e.tcp_new(IpFamily::V4).unwrap();
    e.tcp_bind(l, addr("127.0.0.1:0")).unwrap();
    e.tcp_listen(l, 0).unwrap();
    arm(&mut e, l, &rec, TcpCallbacks::ACCEPT);
    let dst = e.local_addr(l).unwrap();

    let c1 = e.tcp_new(IpFamily::V4).unwrap();
    let c2 = e.tcp_new(IpFamily::V4).unwrap();
    e.tcp_connect(c1, dst).unwrap();
    run(&mut e);
    let s1 = match rec.take().as_slice() {
        [Ev::Accepted(s)] => *s,
        other => panic!("unexpected {:?}", other),
    };
    e.tcp_backlog_delayed(s1);

    e.tcp_connect(c2, dst).unwrap();
    run(&mut e);
    assert!(rec.take().is_empty());
    assert_eq!(e.tcp_state(c2), TcpState::SynSent);

    e.tcp_backlog_accepted(s1);
    run(&mut e);
    assert!(matches!(rec.take().as_slice(), [Ev::Accepted(_)]));
    assert_eq!(e.tcp_state(c2), TcpState::Established);
}

#[test]
fn test_rejected_accept_resets_client() {
    let mut e = LoopbackEngine::default();
    let rec = Recorder::new();
    rec.reject_accept.store(true, Ordering::SeqCst);
    let l = e.tcp_new(IpFamily::V4).unwrap();
    e.tcp_listen(l, 1).unwrap();
    arm(&mut e, l, &rec, TcpCallbacks::ACCEPT);
    let port = e.local_addr(l).unwrap().port();

    let c = e.tcp_new(IpFamily::V4).unwrap();
    arm(&mut e, c, &rec, stream());
    e.tcp_connect(c, SocketAddr::new("127.0.0.1".parse().unwrap(), port)).unwrap();
    run(&mut e);
    let evs = rec.take();
    assert!(evs.contains(&Ev::Connected(c)));
    assert_eq!(evs.last(), Some(&Ev::Err(NetError::Reset)));
    assert_eq!(e.pcb_count(), 1);
}

#[test]
fn test_data_after_shutdown_rx_resets() {
    let mut e = LoopbackEngine::default();
    let rec = Recorder::new();
    let (_l, c, s) = connected_pair(&mut e, &rec);

    e.tcp_shutdown(s, true, false).unwrap();
    assert!(e.tcp_rx_closed(s));
    e.tcp_write(c, b"late", TcpWriteFlags::COPY).unwrap();
    run(&mut e);
    let evs = rec.take();
    assert!(evs.contains(&Ev::Err(NetError::Reset)));
    assert!(evs.contains(&Ev::Err(NetError::Abort)));
}

#[test]
fn test_injected_mem_errors() {
    let mut e = LoopbackEngine::default();
    let rec = Recorder::new();
    let (_l, c, _s) = connected_pair(&mut e, &rec);

    e.inject_mem_errors(2);
    assert_eq!(e.tcp_write(c, b"x", TcpWriteFlags::COPY), Err(NetError::Mem));
    assert_eq!(e.tcp_close(c), Err(NetError::Mem));
    assert_eq!(e.tcp_state(c), TcpState::Established);
    e.tcp_write(c, b"x", TcpWriteFlags::COPY).unwrap();
    e.tcp_close(c).unwrap();
    assert_eq!(e.tcp_state(c), TcpState::FinWait1);
    assert_eq!(e.tcp_write(c, b"y", TcpWriteFlags::COPY), Err(NetError::Conn));
}

#[test]
fn test_reset_port_and_poll() {
    let mut e = LoopbackEngine::default();
    let rec = Recorder::new();
    let (l, c, _s) = connected_pair(&mut e, &rec);
    e.tcp_set_callbacks(c, TcpCallbacks::DATA);
    e.tcp_set_poll_interval(c, 2);

    e.tick();
    run(&mut e);
    assert!(rec.take().is_empty());
    e.tick();
    run(&mut e);
    assert_eq!(rec.take(), vec![Ev::Poll(c)]);

    let port = e.local_addr(l).unwrap().port();
    assert_eq!(e.reset_port(port), 2);
    run(&mut e);
    assert_eq!(rec.take(), vec![Ev::Err(NetError::Reset), Ev::Err(NetError::Reset)]);
}

#[test]
fn test_syn_timeout_aborts() {
    let cfg = LoopbackConfig { syn_max_ticks: 2, ..Default::default() };
    let mut e = LoopbackEngine::new(cfg);
    let rec = Recorder::new();
    let l = e.tcp_new(IpFamily::V4).unwrap();
    e.tcp_listen(l, 1).unwrap();
    arm(&mut e, l, &rec, TcpCallbacks::ACCEPT);
    let dst = SocketAddr::new("127.0.0.1".parse().unwrap(), e.local_addr(l).unwrap().port());

    // fill the backlog so the second SYN is held
    let c1 = e.tcp_new(IpFamily::V4).unwrap();
    e.tcp_connect(c1, dst).unwrap();
    run(&mut e);
    if let [Ev::Accepted(s1)] = rec.take().as_slice() {
        e.tcp_backlog_delayed(*s1);
    }
    let c2 = e.tcp_new(IpFamily::V4).unwrap();
    arm(&mut e, c2, &rec, stream());
    e.tcp_connect(c2, dst).unwrap();
    for _ in 0..3 {
        e.tick();
        run(&mut e);
    }
    assert_eq!(rec.take(), vec![Ev::Err(NetError::Abort)]);
}

#[test]
fn test_bind_conflicts() {
    let mut e = LoopbackEngine::default();
    let a = e.tcp_new(IpFamily::V4).unwrap();
    let b = e.tcp_new(IpFamily::V4).unwrap();
    e.tcp_bind(a, addr("127.0.0.1:7000")).unwrap();
    assert_eq!(e.tcp_bind(b, addr("0.0.0.0:7000")), Err(NetError::Use));

    e.set_option(a, PcbOption::ReuseAddr(true)).unwrap();
    e.set_option(b, PcbOption::ReuseAddr(true)).unwrap();
    e.tcp_bind(b, addr("0.0.0.0:7000")).unwrap();

    let v6 = e.tcp_new(IpFamily::V6).unwrap();
    assert_eq!(e.tcp_bind(v6, addr("127.0.0.1:1")), Err(NetError::Val));
}

#[derive(Default)]
struct Inbox(Mutex<Vec<(PcbId, Vec<u8>, SocketAddr)>>);

impl UdpHandler for Inbox {
    fn recv(&self, pcb: PcbId, data: Pbuf, src: SocketAddr, _dst: SocketAddr) {
        self.0.lock().unwrap().push((pcb, data.to_vec(), src));
    }
}

impl RawHandler for Inbox {
    fn recv(&self, pcb: PcbId, data: &Pbuf, src: IpAddr, _dst: IpAddr) -> bool {
        self.0.lock().unwrap().push((pcb, data.to_vec(), SocketAddr::new(src, 0)));
        false
    }
}

#[test]
fn test_udp_unicast_and_connected_filter() {
    let mut e = LoopbackEngine::default();
    let inbox = Arc::new(Inbox::default());
    let rx = e.udp_new(IpFamily::V4).unwrap();
    e.udp_bind(rx, addr("127.0.0.1:5300")).unwrap();
    e.udp_set_handler(rx, Some(inbox.clone() as Arc<dyn UdpHandler>));

    let tx = e.udp_new(IpFamily::V4).unwrap();
    assert_eq!(e.udp_send(tx, Pbuf::from_slice(b"x")), Err(NetError::Rte));
    e.udp_sendto(tx, Pbuf::from_slice(b"one"), addr("127.0.0.1:5300")).unwrap();
    e.udp_sendto(tx, Pbuf::from_slice(b"two"), addr("127.0.0.1:5300")).unwrap();
    run(&mut e);
    let got: Vec<Vec<u8>> = inbox.0.lock().unwrap().drain(..).map(|m| m.1).collect();
    assert_eq!(got, vec![b"one".to_vec(), b"two".to_vec()]);

    // connected receiver only hears its peer
    e.udp_connect(rx, addr("127.0.0.1:1")).unwrap();
    e.udp_sendto(tx, Pbuf::from_slice(b"three"), addr("127.0.0.1:5300")).unwrap();
    run(&mut e);
    assert!(inbox.0.lock().unwrap().is_empty());
}

#[test]
fn test_udp_multicast_needs_membership() {
    let mut e = LoopbackEngine::default();
    let inbox = Arc::new(Inbox::default());
    let group: IpAddr = "239.1.2.3".parse().unwrap();
    let rx = e.udp_new(IpFamily::V4).unwrap();
    e.udp_bind(rx, addr("0.0.0.0:6000")).unwrap();
    e.udp_set_handler(rx, Some(inbox.clone() as Arc<dyn UdpHandler>));
    let tx = e.udp_new(IpFamily::V4).unwrap();
    let dst = SocketAddr::new(group, 6000);

    e.udp_sendto(tx, Pbuf::from_slice(b"a"), dst).unwrap();
    run(&mut e);
    assert!(inbox.0.lock().unwrap().is_empty());

    e.join_group("0.0.0.0".parse().unwrap(), group).unwrap();
    e.udp_sendto(tx, Pbuf::from_slice(b"b"), dst).unwrap();
    run(&mut e);
    assert_eq!(inbox.0.lock().unwrap().len(), 1);

    e.leave_group("0.0.0.0".parse().unwrap(), group).unwrap();
    assert_eq!(
        e.leave_group("0.0.0.0".parse().unwrap(), group),
        Err(NetError::Val)
    );
}

#[test]
fn test_raw_same_protocol_only() {
    let mut e = LoopbackEngine::default();
    let inbox = Arc::new(Inbox::default());
    let icmp = e.raw_new(IpFamily::V4, 1).unwrap();
    let other = e.raw_new(IpFamily::V4, 17).unwrap();
    e.raw_set_handler(icmp, Some(inbox.clone() as Arc<dyn RawHandler>));
    e.raw_set_handler(other, Some(inbox.clone() as Arc<dyn RawHandler>));

    e.raw_sendto(icmp, Pbuf::from_slice(b"echo"), "127.0.0.1".parse().unwrap()).unwrap();
    run(&mut e);
    let got = inbox.0.lock().unwrap().clone();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0, icmp);
    assert_eq!(got[0].1, b"echo".to_vec());
}

#[test]
fn test_pcb_pool_exhaustion() {
    let mut e = LoopbackEngine::new(LoopbackConfig::default().max_pcbs(2));
    let a = e.udp_new(IpFamily::V4).unwrap();
    e.tcp_new(IpFamily::V4).unwrap();
    assert_eq!(e.udp_new(IpFamily::V4), Err(NetError::Mem));
    e.udp_remove(a);
    assert!(e.raw_new(IpFamily::V4, 1).is_ok());
    assert_eq!(e.pcb_stats().failures, 1);
}

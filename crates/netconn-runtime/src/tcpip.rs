//! The engine context
//!
//! One thread ("tcpip") owns the protocol engine. Application threads
//! reach it in one of two ways, chosen by `StackConfig::dispatch`:
//!
//! - **Mailbox**: the call is posted to the engine mailbox and the
//!   engine thread runs it; the caller blocks on the call's completion.
//! - **CoreLock**: the caller takes the global core lock and runs the
//!   handler itself, then blocks on the completion only if the handler
//!   deferred it (blocking write, connect, close).
//!
//! Either way the handler runs with exclusive access to the engine, and
//! the engine is driven (`process()` until idle) before the lock is
//! released. The engine thread also runs the slow timer.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use netconn_core::error::{NetError, NetResult};
use netconn_core::{kdebug, kerror, kinfo, ktrace, kwarn};
use tcpip_core::{DnsHandler, IpFamily, ProtocolEngine};

use crate::api_msg;
use crate::config::{DispatchMode, StackConfig};
use crate::conn::{flag, ConnEnv, ConnEvent, ConnInner, ConnState};
use crate::msg::{ApiCall, ApiMsg, ApiReply, Completion, TcpipMsg};
use crate::sys::mbox::{FetchError, Mbox};

/// Upper bound on `process()` rounds after one message
const MAX_DRIVE_ROUNDS: usize = 10_000;

struct TcpipCore {
    /// `None` once the stack has stopped
    engine: Option<Box<dyn ProtocolEngine>>,
}

/// Counters of the engine context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpipStats {
    pub messages: u64,
    pub ticks: u64,
}

struct TcpipShared {
    core: Mutex<TcpipCore>,
    mbox: Mbox<TcpipMsg>,
    running: AtomicBool,
    env: Arc<ConnEnv>,
    messages: AtomicU64,
    ticks: AtomicU64,
}

/// Cloneable access to a running stack.
#[derive(Clone)]
pub struct TcpipHandle {
    shared: Arc<TcpipShared>,
}

/// Owner of the engine thread. Dropping it stops the stack.
pub struct Tcpip {
    handle: TcpipHandle,
    thread: Option<JoinHandle<()>>,
}

impl Tcpip {
    /// Validate `config`, take ownership of `engine` and start the
    /// engine thread.
    pub fn start(engine: Box<dyn ProtocolEngine>, config: StackConfig) -> NetResult<Tcpip> {
        if let Err(e) = config.validate() {
            kerror!("{}", e);
            return Err(NetError::Val);
        }
        let shared = Arc::new(TcpipShared {
            core: Mutex::new(TcpipCore {
                engine: Some(engine),
            }),
            mbox: Mbox::new(config.tcpip_mbox_size),
            running: AtomicBool::new(true),
            env: ConnEnv::new(config),
            messages: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
        });
        let handle = TcpipHandle { shared };

        let loop_handle = handle.clone();
        let thread = thread::Builder::new()
            .name("tcpip".to_string())
            .spawn(move || loop_handle.engine_loop())
            .map_err(|e| {
                kerror!("failed to spawn tcpip thread: {}", e);
                NetError::Mem
            })?;

        kinfo!(
            "tcpip started ({:?} dispatch, tick {:?})",
            handle.config().dispatch,
            handle.config().slow_timer_interval
        );
        Ok(Tcpip {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &TcpipHandle {
        &self.handle
    }

    /// Stop the engine thread and release every waiter with `If`.
    pub fn shutdown(&mut self) {
        let shared = &self.handle.shared;
        if !shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        kinfo!("tcpip shutting down");

        // ── Step 1: stop the engine thread ──
        shared.mbox.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                kerror!("tcpip thread panicked");
            }
        }

        // ── Step 2: fail messages nobody will run ──
        while let Some(msg) = shared.mbox.tryfetch() {
            msg.abandon();
        }

        // ── Step 3: take the engine away from late callers ──
        let engine = shared.lock_core().engine.take();

        // ── Step 4: release blocked operations and queue readers ──
        for conn in shared.env.live_conns() {
            release_conn(&conn);
        }

        // Pending DNS waiters complete from their drop
        drop(engine);
        kinfo!("tcpip stopped");
    }
}

impl Drop for Tcpip {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::ops::Deref for Tcpip {
    type Target = TcpipHandle;

    fn deref(&self) -> &TcpipHandle {
        &self.handle
    }
}

/// Fail whatever a connection is blocked on.
fn release_conn(conn: &ConnInner) {
    let state = {
        let mut side = conn.side();
        side.pcb = None;
        std::mem::replace(&mut side.state, ConnState::None)
    };
    state.complete(Err(NetError::If));
    conn.set_pending_err(NetError::If);
    conn.set_flag(flag::MBOXCLOSED);
    if let Some(mbox) = conn.recvmbox() {
        mbox.close();
    }
    if let Some(mbox) = conn.acceptmbox() {
        mbox.close();
    }
    conn.event(ConnEvent::Error, 0);
    conn.event(ConnEvent::RcvPlus, 0);
    conn.event(ConnEvent::SendPlus, 0);
}

impl TcpipShared {
    fn lock_core(&self) -> MutexGuard<'_, TcpipCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run one message with the engine locked, then drive the engine.
    fn run_locked(&self, msg: TcpipMsg) {
        let mut core = self.lock_core();
        let Some(engine) = core.engine.as_deref_mut() else {
            drop(core);
            msg.abandon();
            return;
        };
        self.messages.fetch_add(1, Ordering::Relaxed);
        ktrace!("run {:?}", msg);
        match msg {
            TcpipMsg::Api(m) => api_msg::dispatch(engine, m),
            TcpipMsg::Callback(f) => f(Some(engine)),
        }
        drive(engine);
    }
}

/// Let the engine deliver everything it has queued.
fn drive(engine: &mut dyn ProtocolEngine) {
    let mut rounds = 0;
    while engine.process() {
        rounds += 1;
        if rounds >= MAX_DRIVE_ROUNDS {
            kwarn!("engine still busy after {} rounds", rounds);
            break;
        }
    }
}

impl TcpipHandle {
    pub fn config(&self) -> &StackConfig {
        &self.shared.env.config
    }

    pub fn env(&self) -> &Arc<ConnEnv> {
        &self.shared.env
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> TcpipStats {
        TcpipStats {
            messages: self.shared.messages.load(Ordering::Relaxed),
            ticks: self.shared.ticks.load(Ordering::Relaxed),
        }
    }

    /// Run `call` for `conn` in the engine context and wait for its result.
    pub(crate) fn call(&self, conn: &Arc<ConnInner>, call: ApiCall) -> NetResult<ApiReply> {
        if !self.is_running() {
            return Err(NetError::If);
        }
        let done = Completion::new();
        let msg = TcpipMsg::Api(ApiMsg {
            conn: Arc::clone(conn),
            call,
            done: Arc::clone(&done),
        });
        match self.config().dispatch {
            DispatchMode::Mailbox => {
                if let Err(msg) = self.shared.mbox.post(msg) {
                    msg.abandon();
                }
            }
            DispatchMode::CoreLock => self.shared.run_locked(msg),
        }
        done.wait()
    }

    /// Queue `f` to run in the engine context and return at once.
    pub fn callback<F>(&self, f: F) -> NetResult<()>
    where
        F: FnOnce(Option<&mut dyn ProtocolEngine>) + Send + 'static,
    {
        if !self.is_running() {
            return Err(NetError::If);
        }
        self.shared
            .mbox
            .post(TcpipMsg::Callback(Box::new(f)))
            .map_err(|_| NetError::If)
    }

    /// Like `callback` but fails with `Mem` instead of blocking on a
    /// full mailbox. Usable from the engine context.
    pub fn trycallback<F>(&self, f: F) -> NetResult<()>
    where
        F: FnOnce(Option<&mut dyn ProtocolEngine>) + Send + 'static,
    {
        if !self.is_running() {
            return Err(NetError::If);
        }
        self.shared
            .mbox
            .trypost(TcpipMsg::Callback(Box::new(f)))
            .map_err(|_| NetError::Mem)
    }

    /// Run `f` on the engine under the core lock, then drive the engine.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut dyn ProtocolEngine) -> R) -> NetResult<R> {
        let mut core = self.shared.lock_core();
        let engine = core.engine.as_deref_mut().ok_or(NetError::If)?;
        let r = f(engine);
        drive(engine);
        Ok(r)
    }

    /// Resolve `name` through the engine's DNS service.
    pub fn gethostbyname(&self, name: &str, family: IpFamily) -> NetResult<IpAddr> {
        let done: Arc<Completion<IpAddr>> = Completion::new();
        let waiter = Arc::new(DnsWait {
            done: Arc::clone(&done),
        });
        let name = name.to_string();
        let f = move |engine: Option<&mut dyn ProtocolEngine>| {
            let Some(engine) = engine else {
                waiter.done.complete(Err(NetError::If));
                return;
            };
            let handler: Arc<dyn DnsHandler> = waiter.clone();
            match engine.dns_gethostbyname(&name, family, handler) {
                Ok(Some(addr)) => waiter.done.complete(Ok(addr)),
                Ok(None) => kdebug!("dns: {} pending", name),
                Err(e) => waiter.done.complete(Err(e)),
            }
        };
        match self.config().dispatch {
            DispatchMode::Mailbox => self.callback(f)?,
            DispatchMode::CoreLock => {
                if !self.is_running() {
                    return Err(NetError::If);
                }
                self.shared.run_locked(TcpipMsg::Callback(Box::new(f)));
            }
        }
        done.wait()
    }

    fn engine_loop(&self) {
        let interval = self.config().slow_timer_interval;
        let mut next_tick = Instant::now() + interval;
        kdebug!("engine loop running");
        loop {
            let now = Instant::now();
            if now >= next_tick {
                self.shared.ticks.fetch_add(1, Ordering::Relaxed);
                let _ = self.with_engine(|engine| engine.tick());
                next_tick += interval;
                if next_tick <= now {
                    next_tick = now + interval;
                }
                continue;
            }
            match self.shared.mbox.fetch(Some(next_tick - now)) {
                Ok(msg) => self.shared.run_locked(msg),
                Err(FetchError::Timeout) => {}
                Err(FetchError::Closed) => break,
            }
        }
        kdebug!("engine loop exiting");
    }
}

/// Completes a blocking `gethostbyname` when the engine answers.
struct DnsWait {
    done: Arc<Completion<IpAddr>>,
}

impl DnsHandler for DnsWait {
    fn found(&self, name: &str, addr: Option<IpAddr>) {
        kdebug!("dns: {} -> {:?}", name, addr);
        self.done.complete(addr.ok_or(NetError::Val));
    }
}

impl Drop for DnsWait {
    fn drop(&mut self) {
        // engine dropped the request without answering
        self.done.complete(Err(NetError::If));
    }
}

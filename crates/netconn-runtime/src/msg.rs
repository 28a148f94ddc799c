//! Messages between application threads and the engine context.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use netconn_core::error::{NetError, NetResult};
use tcpip_core::{PcbOption, PcbOptions, ProtocolEngine};

use crate::api::WriteFlags;
use crate::conn::{ConnInner, Shut};
use crate::netbuf::Netbuf;
use crate::sys::{PlatformSemaphore, Semaphore};

/// One-shot completion a caller blocks on.
///
/// The first `complete()` wins; later ones are ignored, so a completion
/// can be handed to several release paths (callback, abort, shutdown).
pub struct Completion<T> {
    sem: PlatformSemaphore,
    completed: AtomicBool,
    result: Mutex<Option<NetResult<T>>>,
}

impl<T> Completion<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sem: PlatformSemaphore::new(0),
            completed: AtomicBool::new(false),
            result: Mutex::new(None),
        })
    }

    pub fn complete(&self, result: NetResult<T>) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.result.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
        self.sem.signal();
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Block until completed.
    pub fn wait(&self) -> NetResult<T> {
        self.sem.wait(None);
        self.result
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .unwrap_or(Err(NetError::If))
    }
}

/// What a connection call asks the engine context to do.
pub(crate) enum ApiCall {
    NewConn,
    DelConn,
    Bind(SocketAddr),
    Connect(SocketAddr),
    Disconnect,
    Listen(u8),
    Send(Netbuf),
    Write { vectors: Vec<Vec<u8>>, flags: WriteFlags },
    Recved(usize),
    Accepted,
    GetAddr { local: bool },
    Close(Shut),
    JoinLeave { group: IpAddr, ifaddr: IpAddr, join: bool },
    GetOptions,
    SetOption(PcbOption),
}

impl ApiCall {
    pub fn name(&self) -> &'static str {
        match self {
            ApiCall::NewConn => "newconn",
            ApiCall::DelConn => "delconn",
            ApiCall::Bind(_) => "bind",
            ApiCall::Connect(_) => "connect",
            ApiCall::Disconnect => "disconnect",
            ApiCall::Listen(_) => "listen",
            ApiCall::Send(_) => "send",
            ApiCall::Write { .. } => "write",
            ApiCall::Recved(_) => "recved",
            ApiCall::Accepted => "accepted",
            ApiCall::GetAddr { .. } => "getaddr",
            ApiCall::Close(_) => "close",
            ApiCall::JoinLeave { .. } => "join_leave",
            ApiCall::GetOptions => "getoptions",
            ApiCall::SetOption(_) => "setoption",
        }
    }
}

/// Successful result of an `ApiCall`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ApiReply {
    Done,
    Written(usize),
    Addr(SocketAddr),
    Options(PcbOptions),
}

pub(crate) struct ApiMsg {
    pub conn: Arc<ConnInner>,
    pub call: ApiCall,
    pub done: Arc<Completion<ApiReply>>,
}

/// Closure run in the engine context; `None` when the stack has stopped.
pub type EngineCallback = Box<dyn FnOnce(Option<&mut dyn ProtocolEngine>) + Send>;

/// Engine mailbox message
pub(crate) enum TcpipMsg {
    Api(ApiMsg),
    Callback(EngineCallback),
}

impl TcpipMsg {
    /// Release whoever waits on this message without running it.
    pub fn abandon(self) {
        match self {
            TcpipMsg::Api(msg) => msg.done.complete(Err(NetError::If)),
            TcpipMsg::Callback(f) => f(None),
        }
    }
}

impl fmt::Debug for TcpipMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TcpipMsg::Api(msg) => write!(f, "Api({}, conn {})", msg.call.name(), msg.conn.id()),
            TcpipMsg::Callback(_) => write!(f, "Callback"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_first_completion_wins() {
        let done: Arc<Completion<u32>> = Completion::new();
        done.complete(Ok(1));
        done.complete(Err(NetError::If));
        assert!(done.is_completed());
        assert_eq!(done.wait(), Ok(1));
    }

    #[test]
    fn test_wait_across_threads() {
        let done: Arc<Completion<u32>> = Completion::new();
        let waiter = {
            let done = Arc::clone(&done);
            thread::spawn(move || done.wait())
        };
        thread::sleep(Duration::from_millis(20));
        done.complete(Err(NetError::Reset));
        assert_eq!(waiter.join().unwrap(), Err(NetError::Reset));
    }
}

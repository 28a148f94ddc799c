//! # netconn - sequential sockets over a single-threaded TCP/IP engine
//!
//! Application threads talk to a protocol engine that runs on one
//! thread of its own, through blocking connection handles (`Netconn`)
//! or BSD-style socket descriptors (`Stack`).
//!
//! ## Features
//!
//! - **Descriptor table**: fixed size, use-counted slots, deferred free
//! - **Multiplexing**: `select` and `poll` driven by connection events
//! - **Socket options**: `SOL_SOCKET`, `IPPROTO_IP`, `IPPROTO_TCP`,
//!   `IPPROTO_IPV6` levels, multicast memberships, `ioctl`, `fcntl`
//! - **Name resolution**: `gethostbyname`, `getaddrinfo`
//! - **Two dispatchers**: engine mailbox or caller-side core lock
//!
//! ## Quick Start
//!
//! ```ignore
//! use netconn::{Stack, StackConfig};
//! use tcpip_loopback::LoopbackEngine;
//!
//! let stack = Stack::new(Box::new(LoopbackEngine::default()), StackConfig::from_env())?;
//! let fd = stack.socket(libc::AF_INET, libc::SOCK_STREAM, 0)?;
//! stack.bind(fd, "127.0.0.1:7".parse()?)?;
//! stack.listen(fd, 4)?;
//! let (conn, peer) = stack.accept(fd)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Application threads                       │
//! │    socket calls (Stack)          Netconn handles            │
//! └─────────────────────────────────────────────────────────────┘
//!            │ descriptor table, select/poll     │
//!            ▼                                   ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │        netconn-runtime: mailbox / core lock dispatch        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │       tcpip thread: ProtocolEngine + adapters + timer       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod errno;
pub mod netdb;
pub mod select;
pub mod socket;
pub mod sockopt;

#[cfg(test)]
mod tests;

// Re-export core types
pub use netconn_core::{Errno, NetError, NetResult};

// Re-export kprint macros for logging
pub use netconn_core::{kdebug, kerror, kinfo, kprintln, ktrace, kwarn};
pub use netconn_core::kprint::{init as init_logging, set_flush_enabled, set_log_level, LogLevel};

// Re-export env utilities
pub use netconn_core::{env_get, env_get_bool, env_get_opt};

// Re-export runtime types
pub use netconn_runtime::{
    ConnEvent, DispatchMode, Netbuf, Netconn, NetconnType, RecvFlags, StackConfig, Tcpip,
    TcpipHandle, WriteFlags,
};
pub use tcpip_core::{IpFamily, ProtocolEngine};

pub use errno::{errno, set_errno};
pub use netdb::{AddrInfo, AddrInfoHints, HostEnt, NetdbError};
pub use select::{FdSet, PollFd};
pub use socket::{Fd, RecvMeta, Sockets};
pub use sockopt::SockOptVal;

/// A running stack with its socket layer.
///
/// Dereferences to `Sockets` for the socket calls. Dropping it closes
/// every descriptor and stops the engine thread.
pub struct Stack {
    tcpip: Tcpip,
    sockets: Sockets,
}

impl Stack {
    /// Start the engine thread on `engine` and set up an empty
    /// descriptor table of `config.num_sockets` entries.
    pub fn new(engine: Box<dyn ProtocolEngine>, config: StackConfig) -> NetResult<Stack> {
        let tcpip = Tcpip::start(engine, config)?;
        let sockets = Sockets::new(tcpip.handle().clone());
        Ok(Stack { tcpip, sockets })
    }

    pub fn tcpip(&self) -> &TcpipHandle {
        self.tcpip.handle()
    }

    /// Shareable socket layer for other threads.
    pub fn sockets(&self) -> &Sockets {
        &self.sockets
    }

    /// Close every descriptor, then stop the engine. Calls still
    /// blocked fail with `If`.
    pub fn shutdown(&mut self) {
        let slots = self.sockets.table.drain();
        if !slots.is_empty() {
            kdebug!("closing {} open sockets", slots.len());
        }
        drop(slots);
        self.tcpip.shutdown();
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::ops::Deref for Stack {
    type Target = Sockets;

    fn deref(&self) -> &Sockets {
        &self.sockets
    }
}

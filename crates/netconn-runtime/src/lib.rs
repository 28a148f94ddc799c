//! # netconn-runtime
//!
//! The sequential connection API on top of a single-threaded protocol
//! engine.
//!
//! This crate provides:
//! - The engine context: the "tcpip" thread, its mailbox, the slow timer
//!   and the optional core lock (`Tcpip`, `TcpipHandle`)
//! - `Netconn`, a blocking connection handle for application threads
//! - The per-connection state machine that turns engine callbacks into
//!   queued data, completed calls and `ConnEvent`s
//! - `Netbuf` datagram buffers
//! - Semaphores and bounded mailboxes (futex on Linux, Condvar elsewhere)
//!
//! ## Example
//!
//! ```rust,ignore
//! use netconn_runtime::{Netconn, NetconnType, StackConfig, Tcpip};
//! use tcpip_core::IpFamily;
//! use tcpip_loopback::LoopbackEngine;
//!
//! let tcpip = Tcpip::start(Box::new(LoopbackEngine::default()), StackConfig::from_env())?;
//! let conn = Netconn::new(&tcpip, NetconnType::Udp, IpFamily::V4)?;
//! conn.bind("127.0.0.1:0".parse()?)?;
//! ```

pub mod config;
pub mod sys;
pub mod conn;
pub mod netbuf;
pub mod api;
mod msg;
mod tcpip;
mod api_msg;
mod callbacks;


// Re-exports
pub use api::{Netconn, RecvFlags, WriteFlags, DEFAULT_LISTEN_BACKLOG};
pub use config::{ConfigError, DispatchMode, StackConfig};
pub use conn::{ConnEnv, ConnEvent, ConnEvents, ConnInner, NetconnType, Shut};
pub use msg::{Completion, EngineCallback};
pub use netbuf::Netbuf;
pub use sys::mbox::{FetchError, Mbox};
pub use tcpip::{Tcpip, TcpipHandle, TcpipStats};

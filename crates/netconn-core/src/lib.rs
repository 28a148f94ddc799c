//! # netconn-core
//!
//! Platform-agnostic building blocks shared by every crate in the stack.
//!
//! ## Modules
//!
//! - `error` - `NetError` status codes and the socket-layer `Errno`
//! - `pool` - fixed-capacity index pools (connections, control blocks)
//! - `arena` - first-fit fixed tables (descriptors, DNS, memberships)
//! - `kprint` - leveled stderr logging macros
//! - `env` - environment variable helpers for config

pub mod error;
pub mod pool;
pub mod arena;
pub mod kprint;
pub mod env;

pub use error::{Errno, NetError, NetResult};
pub use pool::{MemPool, PoolSlot, PoolStats};
pub use arena::Arena;
pub use kprint::{set_log_level, LogLevel};
pub use env::{env_get, env_get_bool, env_get_ms, env_get_opt, env_get_opt_ms};

//! Library defaults for `StackConfig`.
//!
//! Every value can be overridden at runtime through the matching
//! `NETCONN_*` environment variable or a builder method.

/// Socket descriptor table size
pub const NUM_SOCKETS: usize = 16;

/// First descriptor number handed out
pub const SOCKET_OFFSET: i32 = 0;

/// Connections that may exist at once
pub const MAX_NETCONNS: usize = 16;

pub const TCP_RECVMBOX_SIZE: usize = 16;
pub const UDP_RECVMBOX_SIZE: usize = 16;
pub const RAW_RECVMBOX_SIZE: usize = 16;
pub const ACCEPT_MBOX_SIZE: usize = 16;

/// Engine mailbox depth
pub const TCPIP_MBOX_SIZE: usize = 64;

/// Default datagram receive high-watermark (bytes)
pub const RECV_BUFSIZE: usize = i32::MAX as usize;

/// Send-buffer headroom above which a stream is writable again
pub const TCP_SNDLOWAT: usize = 4096;

/// Queued segment count below which a stream is writable again
pub const TCP_SNDQUEUELOWAT: usize = 16;

/// Engine slow timer period
pub const SLOW_TIMER_INTERVAL_MS: u64 = 500;

/// Poll interval of connected streams, in slow-timer ticks
pub const TCP_POLL_INTERVAL: u8 = 2;

/// How long a close keeps retrying after `Mem` (0 = count polls instead)
pub const CLOSE_TIMEOUT_MS: u64 = 20_000;

/// Poll retries of a close when no clock timeout is configured
pub const CLOSE_POLL_RETRIES: u32 =
    ((CLOSE_TIMEOUT_MS + SLOW_TIMER_INTERVAL_MS - 1) / SLOW_TIMER_INTERVAL_MS) as u32 + 1;

/// Closing a connection aborts a blocked write or connect
pub const FULL_DUPLEX: bool = true;

/// Run API calls on the engine thread rather than under the core lock
pub const CORE_LOCKING: bool = false;

//! Stack configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder methods
//! 2. Environment variables (`from_env()`)
//! 3. Library defaults (`defaults`)
//!
//! # Example
//!
//! ```rust,ignore
//! use netconn_runtime::config::{DispatchMode, StackConfig};
//!
//! let config = StackConfig::from_env()
//!     .num_sockets(64)
//!     .dispatch(DispatchMode::CoreLock);
//! config.validate()?;
//! ```

pub mod defaults;

use std::time::Duration;

use netconn_core::env::{env_get, env_get_bool, env_get_ms, env_get_opt_ms};

/// How API calls reach the engine context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Post a message to the engine thread and wait for its completion
    Mailbox,
    /// Run the handler on the calling thread under the global core lock
    CoreLock,
}

/// Stack configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Socket descriptor table size
    pub num_sockets: usize,
    /// Number added to a table index to form a descriptor
    pub socket_offset: i32,
    /// Maximum concurrent connections
    pub max_netconns: usize,
    pub tcp_recvmbox_size: usize,
    pub udp_recvmbox_size: usize,
    pub raw_recvmbox_size: usize,
    pub accept_mbox_size: usize,
    pub tcpip_mbox_size: usize,
    /// Datagram receive high-watermark of a new connection
    pub recv_bufsize: usize,
    pub tcp_sndlowat: usize,
    pub tcp_sndqueuelowat: usize,
    /// Engine tick period
    pub slow_timer_interval: Duration,
    /// Poll interval of connected streams, in ticks
    pub tcp_poll_interval: u8,
    /// Close retry budget after `Mem`; `None` counts polls instead
    pub close_timeout: Option<Duration>,
    pub close_poll_retries: u32,
    /// Close aborts a blocked write or connect instead of failing
    pub full_duplex: bool,
    pub dispatch: DispatchMode,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl StackConfig {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `NETCONN_NUM_SOCKETS` - Descriptor table size
    /// - `NETCONN_SOCKET_OFFSET` - First descriptor number
    /// - `NETCONN_MAX_NETCONNS` - Connection pool size
    /// - `NETCONN_TCP_RECVMBOX_SIZE`, `NETCONN_UDP_RECVMBOX_SIZE`,
    ///   `NETCONN_RAW_RECVMBOX_SIZE`, `NETCONN_ACCEPT_MBOX_SIZE`,
    ///   `NETCONN_TCPIP_MBOX_SIZE` - Queue depths
    /// - `NETCONN_RECV_BUFSIZE` - Default datagram high-watermark
    /// - `NETCONN_TCP_SNDLOWAT`, `NETCONN_TCP_SNDQUEUELOWAT` - Writable thresholds
    /// - `NETCONN_SLOW_TIMER_MS` - Engine tick period
    /// - `NETCONN_TCP_POLL_INTERVAL` - Stream poll interval in ticks
    /// - `NETCONN_CLOSE_TIMEOUT_MS` - Close retry budget (`0`/`off` = count polls)
    /// - `NETCONN_CLOSE_POLL_RETRIES` - Poll budget when not clock-based
    /// - `NETCONN_FULL_DUPLEX` - Close aborts blocked writes (0/1)
    /// - `NETCONN_CORE_LOCKING` - Run calls under the core lock (0/1)
    pub fn from_env() -> Self {
        let core_locking = env_get_bool("NETCONN_CORE_LOCKING", defaults::CORE_LOCKING);
        Self {
            num_sockets: env_get("NETCONN_NUM_SOCKETS", defaults::NUM_SOCKETS),
            socket_offset: env_get("NETCONN_SOCKET_OFFSET", defaults::SOCKET_OFFSET),
            max_netconns: env_get("NETCONN_MAX_NETCONNS", defaults::MAX_NETCONNS),
            tcp_recvmbox_size: env_get("NETCONN_TCP_RECVMBOX_SIZE", defaults::TCP_RECVMBOX_SIZE),
            udp_recvmbox_size: env_get("NETCONN_UDP_RECVMBOX_SIZE", defaults::UDP_RECVMBOX_SIZE),
            raw_recvmbox_size: env_get("NETCONN_RAW_RECVMBOX_SIZE", defaults::RAW_RECVMBOX_SIZE),
            accept_mbox_size: env_get("NETCONN_ACCEPT_MBOX_SIZE", defaults::ACCEPT_MBOX_SIZE),
            tcpip_mbox_size: env_get("NETCONN_TCPIP_MBOX_SIZE", defaults::TCPIP_MBOX_SIZE),
            recv_bufsize: env_get("NETCONN_RECV_BUFSIZE", defaults::RECV_BUFSIZE),
            tcp_sndlowat: env_get("NETCONN_TCP_SNDLOWAT", defaults::TCP_SNDLOWAT),
            tcp_sndqueuelowat: env_get("NETCONN_TCP_SNDQUEUELOWAT", defaults::TCP_SNDQUEUELOWAT),
            slow_timer_interval: env_get_ms(
                "NETCONN_SLOW_TIMER_MS",
                defaults::SLOW_TIMER_INTERVAL_MS,
            ),
            tcp_poll_interval: env_get("NETCONN_TCP_POLL_INTERVAL", defaults::TCP_POLL_INTERVAL),
            close_timeout: env_get_opt_ms(
                "NETCONN_CLOSE_TIMEOUT_MS",
                Some(Duration::from_millis(defaults::CLOSE_TIMEOUT_MS)),
            ),
            close_poll_retries: env_get(
                "NETCONN_CLOSE_POLL_RETRIES",
                defaults::CLOSE_POLL_RETRIES,
            ),
            full_duplex: env_get_bool("NETCONN_FULL_DUPLEX", defaults::FULL_DUPLEX),
            dispatch: if core_locking {
                DispatchMode::CoreLock
            } else {
                DispatchMode::Mailbox
            },
        }
    }

    /// Create config with library defaults only (no env override).
    /// Useful for testing or when you want full control.
    pub fn new() -> Self {
        Self {
            num_sockets: defaults::NUM_SOCKETS,
            socket_offset: defaults::SOCKET_OFFSET,
            max_netconns: defaults::MAX_NETCONNS,
            tcp_recvmbox_size: defaults::TCP_RECVMBOX_SIZE,
            udp_recvmbox_size: defaults::UDP_RECVMBOX_SIZE,
            raw_recvmbox_size: defaults::RAW_RECVMBOX_SIZE,
            accept_mbox_size: defaults::ACCEPT_MBOX_SIZE,
            tcpip_mbox_size: defaults::TCPIP_MBOX_SIZE,
            recv_bufsize: defaults::RECV_BUFSIZE,
            tcp_sndlowat: defaults::TCP_SNDLOWAT,
            tcp_sndqueuelowat: defaults::TCP_SNDQUEUELOWAT,
            slow_timer_interval: Duration::from_millis(defaults::SLOW_TIMER_INTERVAL_MS),
            tcp_poll_interval: defaults::TCP_POLL_INTERVAL,
            close_timeout: Some(Duration::from_millis(defaults::CLOSE_TIMEOUT_MS)),
            close_poll_retries: defaults::CLOSE_POLL_RETRIES,
            full_duplex: defaults::FULL_DUPLEX,
            dispatch: DispatchMode::Mailbox,
        }
    }

    // Builder methods

    pub fn num_sockets(mut self, n: usize) -> Self {
        self.num_sockets = n;
        self
    }

    pub fn socket_offset(mut self, offset: i32) -> Self {
        self.socket_offset = offset;
        self
    }

    pub fn max_netconns(mut self, n: usize) -> Self {
        self.max_netconns = n;
        self
    }

    pub fn tcp_recvmbox_size(mut self, n: usize) -> Self {
        self.tcp_recvmbox_size = n;
        self
    }

    pub fn udp_recvmbox_size(mut self, n: usize) -> Self {
        self.udp_recvmbox_size = n;
        self
    }

    pub fn raw_recvmbox_size(mut self, n: usize) -> Self {
        self.raw_recvmbox_size = n;
        self
    }

    pub fn accept_mbox_size(mut self, n: usize) -> Self {
        self.accept_mbox_size = n;
        self
    }

    pub fn tcpip_mbox_size(mut self, n: usize) -> Self {
        self.tcpip_mbox_size = n;
        self
    }

    pub fn recv_bufsize(mut self, n: usize) -> Self {
        self.recv_bufsize = n;
        self
    }

    pub fn tcp_sndlowat(mut self, n: usize) -> Self {
        self.tcp_sndlowat = n;
        self
    }

    pub fn tcp_sndqueuelowat(mut self, n: usize) -> Self {
        self.tcp_sndqueuelowat = n;
        self
    }

    pub fn slow_timer_interval(mut self, d: Duration) -> Self {
        self.slow_timer_interval = d;
        self
    }

    pub fn tcp_poll_interval(mut self, ticks: u8) -> Self {
        self.tcp_poll_interval = ticks;
        self
    }

    pub fn close_timeout(mut self, d: Option<Duration>) -> Self {
        self.close_timeout = d;
        self
    }

    pub fn close_poll_retries(mut self, n: u32) -> Self {
        self.close_poll_retries = n;
        self
    }

    pub fn full_duplex(mut self, enable: bool) -> Self {
        self.full_duplex = enable;
        self
    }

    pub fn dispatch(mut self, mode: DispatchMode) -> Self {
        self.dispatch = mode;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_sockets == 0 {
            return Err(ConfigError::InvalidValue("num_sockets must be > 0"));
        }
        if self.socket_offset < 0 {
            return Err(ConfigError::InvalidValue("socket_offset must be >= 0"));
        }
        if self.socket_offset as i64 + self.num_sockets as i64 > i32::MAX as i64 {
            return Err(ConfigError::InvalidValue("socket_offset + num_sockets overflows"));
        }
        if self.max_netconns == 0 {
            return Err(ConfigError::InvalidValue("max_netconns must be > 0"));
        }
        if self.tcp_recvmbox_size == 0
            || self.udp_recvmbox_size == 0
            || self.raw_recvmbox_size == 0
            || self.accept_mbox_size == 0
        {
            return Err(ConfigError::InvalidValue("connection mailbox sizes must be > 0"));
        }
        if self.tcpip_mbox_size == 0 {
            return Err(ConfigError::InvalidValue("tcpip_mbox_size must be > 0"));
        }
        if self.slow_timer_interval.is_zero() {
            return Err(ConfigError::InvalidValue("slow_timer_interval must be > 0"));
        }
        if self.tcp_poll_interval == 0 {
            return Err(ConfigError::InvalidValue("tcp_poll_interval must be > 0"));
        }
        if self.close_timeout.is_none() && self.close_poll_retries == 0 {
            return Err(ConfigError::InvalidValue(
                "close_poll_retries must be > 0 without close_timeout",
            ));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("Netconn Stack Configuration:");
        eprintln!("  num_sockets:            {}", self.num_sockets);
        eprintln!("  socket_offset:          {}", self.socket_offset);
        eprintln!("  max_netconns:           {}", self.max_netconns);
        eprintln!("  tcp_recvmbox_size:      {}", self.tcp_recvmbox_size);
        eprintln!("  udp_recvmbox_size:      {}", self.udp_recvmbox_size);
        eprintln!("  raw_recvmbox_size:      {}", self.raw_recvmbox_size);
        eprintln!("  accept_mbox_size:       {}", self.accept_mbox_size);
        eprintln!("  tcpip_mbox_size:        {}", self.tcpip_mbox_size);
        eprintln!("  recv_bufsize:           {}", self.recv_bufsize);
        eprintln!("  tcp_sndlowat:           {}", self.tcp_sndlowat);
        eprintln!("  tcp_sndqueuelowat:      {}", self.tcp_sndqueuelowat);
        eprintln!("  slow_timer_interval:    {:?}", self.slow_timer_interval);
        eprintln!("  tcp_poll_interval:      {}", self.tcp_poll_interval);
        eprintln!("  close_timeout:          {:?}", self.close_timeout);
        eprintln!("  close_poll_retries:     {}", self.close_poll_retries);
        eprintln!("  full_duplex:            {}", self.full_duplex);
        eprintln!("  dispatch:               {:?}", self.dispatch);
    }
}

/// Configuration error
#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = StackConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.close_poll_retries, 41);
        assert_eq!(config.dispatch, DispatchMode::Mailbox);
    }

    #[test]
    fn test_builder() {
        let config = StackConfig::new()
            .num_sockets(4)
            .socket_offset(100)
            .close_timeout(None)
            .dispatch(DispatchMode::CoreLock);

        assert_eq!(config.num_sockets, 4);
        assert_eq!(config.socket_offset, 100);
        assert!(config.close_timeout.is_none());
        assert_eq!(config.dispatch, DispatchMode::CoreLock);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(StackConfig::new().num_sockets(0).validate().is_err());
        assert!(StackConfig::new().max_netconns(0).validate().is_err());
        assert!(StackConfig::new().socket_offset(-1).validate().is_err());
        assert!(StackConfig::new()
            .slow_timer_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(StackConfig::new()
            .close_timeout(None)
            .close_poll_retries(0)
            .validate()
            .is_err());
    }
}

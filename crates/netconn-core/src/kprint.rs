//! Leveled stderr logging for the stack
//!
//! Every line carries the level, the milliseconds since the first log
//! call, the emitting thread and the module path, which is usually
//! enough to follow a request from an application thread into the
//! engine thread and back.
//!
//! # Environment Variables
//!
//! - `NETCONN_FLUSH_EPRINT=1` - Flush stderr after each line
//! - `NETCONN_LOG_LEVEL=<level>` - off, error, warn, info, debug, trace (or 0-5)
//!
//! # Usage
//!
//! ```ignore
//! use netconn_core::{kdebug, kwarn};
//!
//! kdebug!("conn {}: state -> {:?}", id, state);
//! kwarn!("accept queue full, dropping child");
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Once, OnceLock};
use std::time::Instant;

use crate::env::{env_get_bool, env_get_opt};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    const ALL: [LogLevel; 6] = [
        LogLevel::Off,
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    /// Out-of-range values saturate to `Trace`.
    pub fn from_u8(v: u8) -> Self {
        Self::ALL[usize::from(v).min(Self::ALL.len() - 1)]
    }

    /// Parse a level name or digit. Unknown strings give `None`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            return Self::ALL.get(usize::from(n)).copied();
        }
        Self::ALL.into_iter().find(|l| l.name().eq_ignore_ascii_case(s))
    }

    pub fn name(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    fn prefix(&self) -> &'static str {
        ["", "E", "W", "I", "D", "T"][*self as usize]
    }
}

static FLUSH: AtomicBool = AtomicBool::new(false);
static LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static ENV_READ: Once = Once::new();
static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Read `NETCONN_LOG_LEVEL` and `NETCONN_FLUSH_EPRINT`.
///
/// Happens once, on the first log call, unless a setter ran earlier.
pub fn init() {
    ENV_READ.call_once(|| {
        EPOCH.get_or_init(Instant::now);
        FLUSH.store(env_get_bool("NETCONN_FLUSH_EPRINT", false), Ordering::Relaxed);
        let level = env_get_opt::<String>("NETCONN_LOG_LEVEL")
            .and_then(|v| LogLevel::parse(&v))
            .unwrap_or(LogLevel::Warn);
        LEVEL.store(level as u8, Ordering::Relaxed);
    });
}

pub fn log_level() -> LogLevel {
    init();
    LogLevel::from_u8(LEVEL.load(Ordering::Relaxed))
}

/// Override the level; later environment reads are skipped.
pub fn set_log_level(level: LogLevel) {
    init();
    LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    init();
    FLUSH.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= log_level()
}

/// Write one finished line while holding the stderr lock.
fn emit(head: Option<(LogLevel, &str)>, args: std::fmt::Arguments<'_>) {
    let mut out = std::io::stderr().lock();
    if let Some((level, module)) = head {
        let ms = EPOCH.get_or_init(Instant::now).elapsed().as_millis();
        let current = std::thread::current();
        let _ = write!(
            out,
            "{} {:>8}ms [{}] {}: ",
            level.prefix(),
            ms,
            current.name().unwrap_or("?"),
            module
        );
    }
    let _ = out.write_fmt(args);
    let _ = out.write_all(b"\n");
    if FLUSH.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}

#[doc(hidden)]
pub fn _kprintln_impl(args: std::fmt::Arguments<'_>) {
    emit(None, args);
}

#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, module: &str, args: std::fmt::Arguments<'_>) {
    if level_enabled(level) {
        emit(Some((level, module)), args);
    }
}

// ── Macros ──

/// Print a bare line to stderr, no prefix, regardless of level.
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint::_kprintln_impl(format_args!(""))
    };
    ($($arg:tt)*) => {
        $crate::kprint::_kprintln_impl(format_args!($($arg)*))
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __klog {
    ($level:ident, $($arg:tt)*) => {
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::$level,
            module_path!(),
            format_args!($($arg)*),
        )
    };
}

#[macro_export]
macro_rules! kerror { ($($arg:tt)*) => { $crate::__klog!(Error, $($arg)*) }; }
#[macro_export]
macro_rules! kwarn { ($($arg:tt)*) => { $crate::__klog!(Warn, $($arg)*) }; }
#[macro_export]
macro_rules! kinfo { ($($arg:tt)*) => { $crate::__klog!(Info, $($arg)*) }; }
#[macro_export]
macro_rules! kdebug { ($($arg:tt)*) => { $crate::__klog!(Debug, $($arg)*) }; }
/// Per-segment and per-event chatter.
#[macro_export]
macro_rules! ktrace { ($($arg:tt)*) => { $crate::__klog!(Trace, $($arg)*) }; }

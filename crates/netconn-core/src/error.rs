//! Status codes for the netconn stack
//!
//! `NetError` is the closed set of failures that cross the boundary
//! between application threads, the engine context and the protocol
//! engines. Success is `Ok(())`; there is no "OK" variant.

use core::fmt;

/// Result type for stack operations
pub type NetResult<T> = Result<T, NetError>;

/// Errors returned by the netconn API and the protocol engines.
///
/// The numeric codes (`code()`) are stable. Codes that are not in this
/// table decode to `Unknown` and are always treated as a failure.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetError {
    /// Out of memory (pool, queue or segment allocation failed)
    Mem,

    /// Buffer error
    Buf,

    /// Timed out waiting for data or a connection
    Timeout,

    /// No route to the destination
    Rte,

    /// Operation started and will complete asynchronously
    InProgress,

    /// Illegal value
    Val,

    /// Operation would block
    WouldBlock,

    /// Address in use
    Use,

    /// A connect is already in progress
    Already,

    /// Connection already established
    IsConn,

    /// Not connected
    Conn,

    /// Low-level interface error (stack stopped)
    If,

    /// Connection aborted
    Abort,

    /// Connection reset by peer
    Reset,

    /// Connection closed
    Closed,

    /// Illegal argument
    Arg,

    /// A code this build does not know about
    Unknown(i8),
}

impl NetError {
    /// Stable numeric code (always negative).
    pub fn code(&self) -> i8 {
        match self {
            NetError::Mem => -1,
            NetError::Buf => -2,
            NetError::Timeout => -3,
            NetError::Rte => -4,
            NetError::InProgress => -5,
            NetError::Val => -6,
            NetError::WouldBlock => -7,
            NetError::Use => -8,
            NetError::Already => -9,
            NetError::IsConn => -10,
            NetError::Conn => -11,
            NetError::If => -12,
            NetError::Abort => -13,
            NetError::Reset => -14,
            NetError::Closed => -15,
            NetError::Arg => -16,
            NetError::Unknown(code) => *code,
        }
    }

    /// Decode a numeric status. `0` is success, anything else is an error.
    pub fn from_code(code: i8) -> NetResult<()> {
        let err = match code {
            0 => return Ok(()),
            -1 => NetError::Mem,
            -2 => NetError::Buf,
            -3 => NetError::Timeout,
            -4 => NetError::Rte,
            -5 => NetError::InProgress,
            -6 => NetError::Val,
            -7 => NetError::WouldBlock,
            -8 => NetError::Use,
            -9 => NetError::Already,
            -10 => NetError::IsConn,
            -11 => NetError::Conn,
            -12 => NetError::If,
            -13 => NetError::Abort,
            -14 => NetError::Reset,
            -15 => NetError::Closed,
            -16 => NetError::Arg,
            other => NetError::Unknown(other),
        };
        Err(err)
    }

    /// Errors after which the control block is gone.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NetError::Abort | NetError::Reset | NetError::Closed | NetError::Arg
        )
    }

    /// POSIX errno for the socket layer.
    pub fn to_errno(&self) -> i32 {
        match self {
            NetError::Mem => libc::ENOMEM,
            NetError::Buf => libc::ENOBUFS,
            NetError::Timeout => libc::EWOULDBLOCK,
            NetError::Rte => libc::EHOSTUNREACH,
            NetError::InProgress => libc::EINPROGRESS,
            NetError::Val => libc::EINVAL,
            NetError::WouldBlock => libc::EWOULDBLOCK,
            NetError::Use => libc::EADDRINUSE,
            NetError::Already => libc::EALREADY,
            NetError::IsConn => libc::EISCONN,
            NetError::Conn => libc::ENOTCONN,
            NetError::If => libc::ENETDOWN,
            NetError::Abort => libc::ECONNABORTED,
            NetError::Reset => libc::ECONNRESET,
            NetError::Closed => libc::ENOTCONN,
            NetError::Arg => libc::EIO,
            NetError::Unknown(_) => libc::EIO,
        }
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::Mem => write!(f, "out of memory"),
            NetError::Buf => write!(f, "buffer error"),
            NetError::Timeout => write!(f, "timed out"),
            NetError::Rte => write!(f, "routing problem"),
            NetError::InProgress => write!(f, "operation in progress"),
            NetError::Val => write!(f, "illegal value"),
            NetError::WouldBlock => write!(f, "operation would block"),
            NetError::Use => write!(f, "address in use"),
            NetError::Already => write!(f, "already connecting"),
            NetError::IsConn => write!(f, "already connected"),
            NetError::Conn => write!(f, "not connected"),
            NetError::If => write!(f, "low-level interface error"),
            NetError::Abort => write!(f, "connection aborted"),
            NetError::Reset => write!(f, "connection reset"),
            NetError::Closed => write!(f, "connection closed"),
            NetError::Arg => write!(f, "illegal argument"),
            NetError::Unknown(code) => write!(f, "unknown error {}", code),
        }
    }
}

impl std::error::Error for NetError {}

/// A POSIX error number as returned by the socket layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

impl Errno {
    pub const BADF: Errno = Errno(libc::EBADF);
    pub const INVAL: Errno = Errno(libc::EINVAL);
    pub const NOPROTOOPT: Errno = Errno(libc::ENOPROTOOPT);
    pub const AFNOSUPPORT: Errno = Errno(libc::EAFNOSUPPORT);
    pub const NFILE: Errno = Errno(libc::ENFILE);
    pub const NOSYS: Errno = Errno(libc::ENOSYS);
    pub const NOTCONN: Errno = Errno(libc::ENOTCONN);
    pub const OPNOTSUPP: Errno = Errno(libc::EOPNOTSUPP);
    pub const WOULDBLOCK: Errno = Errno(libc::EWOULDBLOCK);
    pub const NOMEM: Errno = Errno(libc::ENOMEM);
    pub const ADDRINUSE: Errno = Errno(libc::EADDRINUSE);
    pub const MSGSIZE: Errno = Errno(libc::EMSGSIZE);
    pub const NOBUFS: Errno = Errno(libc::ENOBUFS);

    #[inline]
    pub fn raw(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (errno {})", std::io::Error::from_raw_os_error(self.0), self.0)
    }
}

impl std::error::Error for Errno {}

impl From<NetError> for Errno {
    fn from(e: NetError) -> Self {
        Errno(e.to_errno())
    }
}

impl From<Errno> for std::io::Error {
    fn from(e: Errno) -> Self {
        std::io::Error::from_raw_os_error(e.0)
    }
}

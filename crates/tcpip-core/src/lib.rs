//! # tcpip-core: the protocol engine boundary
//!
//! Trait definitions for the single-threaded protocol engine that the
//! netconn layer drives, plus the value types that cross it: packet
//! buffer chains, control-block handles, TCP states and option bags.
//!
//! Nothing here knows about threads. The runtime guarantees that every
//! call into a `ProtocolEngine` happens in the engine context.

pub mod pbuf;
pub mod pcb;
pub mod engine;

pub use netconn_core::error::{NetError, NetResult};
pub use pbuf::Pbuf;
pub use pcb::{IpFamily, PcbId, PcbKind, PcbOption, PcbOptions, TcpState};
pub use engine::{
    DnsHandler, ProtocolEngine, RawHandler, Refused, TcpCallbacks, TcpHandler, TcpWriteFlags,
    UdpHandler,
};

/// Engine-level limits shared with the API layer
pub mod constants {
    /// Largest single `tcp_write` the API layer issues.
    pub const TCP_WRITE_CHUNK_MAX: usize = 0xffff;

    /// First port handed out for wildcard binds.
    pub const LOCAL_PORT_RANGE_START: u16 = 0xc000;

    /// Last port handed out for wildcard binds.
    pub const LOCAL_PORT_RANGE_END: u16 = 0xffff;
}

//! Name resolution for socket users: `gethostbyname` and
//! `getaddrinfo` over the engine's DNS service.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use netconn_core::kdebug;
use tcpip_core::IpFamily;

use crate::socket::Sockets;

/// Longest name accepted for resolution.
pub const DNS_MAX_NAME_LENGTH: usize = 256;

/// `h_errno` value of a failed `gethostbyname`.
pub const HOST_NOT_FOUND: i32 = 1;

/// Resolver failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetdbError {
    /// `gethostbyname` found nothing
    HostNotFound,
    /// Neither node nor service, or a bad numeric host (`EAI_NONAME`)
    NoName,
    /// Service is not a port number in 1..=65535 (`EAI_SERVICE`)
    Service,
    /// Lookup failed or the name is too long (`EAI_FAIL`)
    Fail,
    /// Unsupported address family (`EAI_FAMILY`)
    Family,
}

impl NetdbError {
    /// `h_errno` for `HostNotFound`, the `EAI_*` code otherwise.
    pub fn code(&self) -> i32 {
        match self {
            NetdbError::HostNotFound => HOST_NOT_FOUND,
            NetdbError::NoName => libc::EAI_NONAME,
            NetdbError::Service => libc::EAI_SERVICE,
            NetdbError::Fail => libc::EAI_FAIL,
            NetdbError::Family => libc::EAI_FAMILY,
        }
    }
}

impl fmt::Display for NetdbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetdbError::HostNotFound => "host not found",
            NetdbError::NoName => "name or service not known",
            NetdbError::Service => "service not supported",
            NetdbError::Fail => "non-recoverable failure in name resolution",
            NetdbError::Family => "address family not supported",
        };
        f.write_str(s)
    }
}

impl std::error::Error for NetdbError {}

/// Result of `gethostbyname`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEnt {
    pub name: String,
    pub addrs: Vec<IpAddr>,
}

/// Restrictions for `getaddrinfo`; the default asks for anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddrInfoHints {
    /// `AI_PASSIVE`, `AI_NUMERICHOST`, ...
    pub flags: i32,
    /// `AF_UNSPEC`, `AF_INET` or `AF_INET6`
    pub family: i32,
    pub socktype: i32,
    pub protocol: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    pub family: i32,
    pub socktype: i32,
    pub protocol: i32,
    pub addr: SocketAddr,
    pub canonname: Option<String>,
}

impl Sockets {
    /// Resolve `name` to its address.
    pub fn gethostbyname(&self, name: &str) -> Result<HostEnt, NetdbError> {
        match self.tcpip.gethostbyname(name, IpFamily::Any) {
            Ok(addr) => Ok(HostEnt {
                name: name.to_string(),
                addrs: vec![addr],
            }),
            Err(e) => {
                kdebug!("gethostbyname({}) failed: {}", name, e);
                Err(NetdbError::HostNotFound)
            }
        }
    }

    /// Translate `node` and `service` into one socket address.
    ///
    /// Without `node` the address is the wildcard (`AI_PASSIVE`) or
    /// loopback address; without `service` the port is 0.
    pub fn getaddrinfo(
        &self,
        node: Option<&str>,
        service: Option<&str>,
        hints: Option<&AddrInfoHints>,
    ) -> Result<Vec<AddrInfo>, NetdbError> {
        if node.is_none() && service.is_none() {
            return Err(NetdbError::NoName);
        }
        let hints = hints.copied().unwrap_or_default();
        let family = match hints.family {
            libc::AF_UNSPEC => IpFamily::Any,
            libc::AF_INET => IpFamily::V4,
            libc::AF_INET6 => IpFamily::V6,
            _ => return Err(NetdbError::Family),
        };

        let port = match service {
            Some(s) => match s.trim().parse::<u32>() {
                Ok(p @ 1..=0xffff) => p as u16,
                _ => return Err(NetdbError::Service),
            },
            None => 0,
        };

        let ip = match node {
            Some(name) if hints.flags & libc::AI_NUMERICHOST != 0 => {
                let ip: IpAddr = name.parse().map_err(|_| NetdbError::NoName)?;
                if !family.admits(&ip) {
                    return Err(NetdbError::NoName);
                }
                ip
            }
            Some(name) => self
                .tcpip
                .gethostbyname(name, family)
                .map_err(|e| {
                    kdebug!("getaddrinfo({}) failed: {}", name, e);
                    NetdbError::Fail
                })?,
            None => {
                let v6 = family == IpFamily::V6;
                match (hints.flags & libc::AI_PASSIVE != 0, v6) {
                    (true, true) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                    (true, false) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    (false, true) => IpAddr::V6(Ipv6Addr::LOCALHOST),
                    (false, false) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                }
            }
        };

        if node.is_some_and(|n| n.len() > DNS_MAX_NAME_LENGTH) {
            return Err(NetdbError::Fail);
        }

        Ok(vec![AddrInfo {
            family: if ip.is_ipv6() {
                libc::AF_INET6
            } else {
                libc::AF_INET
            },
            socktype: hints.socktype,
            protocol: hints.protocol,
            addr: SocketAddr::new(ip, port),
            canonname: node.map(str::to_string),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(NetdbError::HostNotFound.code(), HOST_NOT_FOUND);
        assert_eq!(NetdbError::NoName.code(), libc::EAI_NONAME);
        assert_eq!(NetdbError::Family.code(), libc::EAI_FAMILY);
        assert_eq!(NetdbError::Fail.to_string(), "non-recoverable failure in name resolution");
    }
}

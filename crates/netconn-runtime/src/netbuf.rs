//! Network buffers: a packet buffer chain plus the addresses it
//! travelled between.
//!
//! `addr` is the remote end: the source of a received datagram, or the
//! destination of one being sent with `Netconn::send`. `dest` is the
//! local address a datagram arrived on.

use std::net::{IpAddr, SocketAddr};

use netconn_core::error::{NetError, NetResult};
use tcpip_core::Pbuf;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Netbuf {
    p: Pbuf,
    /// Segment that `data()` returns
    ptr: usize,
    addr: Option<SocketAddr>,
    dest: Option<SocketAddr>,
}

impl Netbuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a received chain.
    pub fn from_pbuf(p: Pbuf, addr: Option<SocketAddr>, dest: Option<SocketAddr>) -> Self {
        Self {
            p,
            ptr: 0,
            addr,
            dest,
        }
    }

    /// Replace the contents with one zeroed segment of `size` bytes and
    /// return it for filling.
    pub fn alloc(&mut self, size: usize) -> &mut [u8] {
        self.p = Pbuf::alloc(size);
        self.ptr = 0;
        self.p.segment_mut(0).unwrap_or(&mut [])
    }

    /// Drop the contents, keeping the addresses.
    pub fn free(&mut self) {
        self.p = Pbuf::new();
        self.ptr = 0;
    }

    /// Replace the contents with a copy of `data`.
    pub fn set_ref(&mut self, data: &[u8]) {
        self.p = Pbuf::from_slice(data);
        self.ptr = 0;
    }

    /// Append the chain of `tail`. The addresses of `self` are kept.
    pub fn chain(&mut self, tail: Netbuf) {
        self.p.cat(tail.p);
        self.ptr = 0;
    }

    /// Current segment.
    pub fn data(&self) -> NetResult<&[u8]> {
        self.p.segment(self.ptr).ok_or(NetError::Buf)
    }

    /// Move to the next segment. `None` when already at the last one,
    /// `Some(true)` when the new segment is the last.
    pub fn next(&mut self) -> Option<bool> {
        if self.ptr + 1 >= self.p.segment_count() {
            return None;
        }
        self.ptr += 1;
        Some(self.ptr + 1 == self.p.segment_count())
    }

    /// Rewind to the first segment.
    pub fn first(&mut self) {
        self.ptr = 0;
    }

    /// Copy up to `dst.len()` bytes starting at `offset`.
    pub fn copy_partial(&self, dst: &mut [u8], offset: usize) -> usize {
        self.p.copy_partial(dst, offset)
    }

    pub fn copy(&self, dst: &mut [u8]) -> usize {
        self.copy_partial(dst, 0)
    }

    /// Copy `data` into the existing chain, which must be large enough.
    pub fn take(&mut self, data: &[u8]) -> NetResult<()> {
        if data.len() > self.p.tot_len() {
            return Err(NetError::Mem);
        }
        let mut copied = 0;
        let mut i = 0;
        while copied < data.len() {
            let Some(seg) = self.p.segment_mut(i) else { break };
            let n = seg.len().min(data.len() - copied);
            seg[..n].copy_from_slice(&data[copied..copied + n]);
            copied += n;
            i += 1;
        }
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.p.tot_len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.p.is_empty()
    }

    pub fn pbuf(&self) -> &Pbuf {
        &self.p
    }

    pub fn into_pbuf(self) -> Pbuf {
        self.p
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.p.to_vec()
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn set_addr(&mut self, addr: Option<SocketAddr>) {
        self.addr = addr;
    }

    pub fn fromaddr(&self) -> Option<IpAddr> {
        self.addr.map(|a| a.ip())
    }

    pub fn fromport(&self) -> u16 {
        self.addr.map_or(0, |a| a.port())
    }

    pub fn destaddr(&self) -> Option<IpAddr> {
        self.dest.map(|a| a.ip())
    }

    pub fn destport(&self) -> u16 {
        self.dest.map_or(0, |a| a.port())
    }
}

impl From<Vec<u8>> for Netbuf {
    fn from(data: Vec<u8>) -> Self {
        Netbuf::from_pbuf(Pbuf::from_vec(data), None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_take_and_copy() {
        let mut buf = Netbuf::new();
        buf.alloc(4).copy_from_slice(b"abcd");
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.take(b"xyzw!"), Err(NetError::Mem));
        buf.take(b"xy").unwrap();
        let mut out = [0u8; 8];
        assert_eq!(buf.copy(&mut out), 4);
        assert_eq!(&out[..4], b"xycd");
    }

    #[test]
    fn test_chain_walk() {
        let mut buf = Netbuf::from(b"one".to_vec());
        buf.chain(Netbuf::from(b"two".to_vec()));
        buf.chain(Netbuf::from(b"three".to_vec()));
        assert_eq!(buf.data().unwrap(), b"one");
        assert_eq!(buf.next(), Some(false));
        assert_eq!(buf.data().unwrap(), b"two");
        assert_eq!(buf.next(), Some(true));
        assert_eq!(buf.next(), None);
        buf.first();
        assert_eq!(buf.data().unwrap(), b"one");
        assert_eq!(buf.to_vec(), b"onetwothree");
    }

    #[test]
    fn test_addresses() {
        let src: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let dst: SocketAddr = "127.0.0.1:53".parse().unwrap();
        let buf = Netbuf::from_pbuf(Pbuf::from_slice(b"q"), Some(src), Some(dst));
        assert_eq!(buf.fromport(), 4000);
        assert_eq!(buf.destport(), 53);
        assert_eq!(buf.fromaddr(), Some(src.ip()));
        assert_eq!(Netbuf::new().fromport(), 0);
        assert!(Netbuf::new().data().is_err());
    }
}

//! Packet buffer chains.
//!
//! A `Pbuf` is a chain of byte segments with a cached total length.
//! Received stream data is handed to the API layer as a chain and
//! consumed from the front; datagrams are delivered as one chain each.

use std::collections::VecDeque;

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Pbuf {
    segs: VecDeque<Vec<u8>>,
    tot_len: usize,
}

impl Pbuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single zero-filled segment of `len` bytes.
    pub fn alloc(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        let mut p = Self::new();
        p.push_segment(data);
        p
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::from_vec(data.to_vec())
    }

    /// Append a segment to the end of the chain. Empty segments are skipped.
    pub fn push_segment(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        self.tot_len += data.len();
        self.segs.push_back(data);
    }

    /// Concatenate `other` onto this chain.
    pub fn cat(&mut self, other: Pbuf) {
        self.tot_len += other.tot_len;
        self.segs.extend(other.segs);
    }

    #[inline]
    pub fn tot_len(&self) -> usize {
        self.tot_len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tot_len == 0
    }

    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segs.len()
    }

    pub fn segment(&self, index: usize) -> Option<&[u8]> {
        self.segs.get(index).map(Vec::as_slice)
    }

    pub fn segment_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        self.segs.get_mut(index).map(Vec::as_mut_slice)
    }

    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        self.segs.iter().map(Vec::as_slice)
    }

    /// Copy up to `dst.len()` bytes starting at `offset` into `dst`.
    /// Returns the number of bytes copied.
    pub fn copy_partial(&self, dst: &mut [u8], offset: usize) -> usize {
        let mut skip = offset;
        let mut copied = 0;
        for seg in &self.segs {
            if copied == dst.len() {
                break;
            }
            if skip >= seg.len() {
                skip -= seg.len();
                continue;
            }
            let avail = &seg[skip..];
            skip = 0;
            let n = avail.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&avail[..n]);
            copied += n;
        }
        copied
    }

    /// Byte at `offset`, if in range.
    pub fn get_at(&self, offset: usize) -> Option<u8> {
        let mut skip = offset;
        for seg in &self.segs {
            if skip < seg.len() {
                return Some(seg[skip]);
            }
            skip -= seg.len();
        }
        None
    }

    /// Drop `n` bytes from the front of the chain.
    pub fn free_header(&mut self, mut n: usize) {
        n = n.min(self.tot_len);
        self.tot_len -= n;
        while n > 0 {
            let Some(front) = self.segs.front_mut() else { break };
            if front.len() <= n {
                n -= front.len();
                self.segs.pop_front();
            } else {
                front.drain(..n);
                n = 0;
            }
        }
    }

    /// Split off the first `n` bytes into a new chain.
    pub fn split_to(&mut self, n: usize) -> Pbuf {
        let n = n.min(self.tot_len);
        let mut head = Pbuf::new();
        let mut want = n;
        while want > 0 {
            let Some(mut front) = self.segs.pop_front() else { break };
            if front.len() <= want {
                want -= front.len();
                head.push_segment(front);
            } else {
                let rest = front.split_off(want);
                head.push_segment(front);
                self.segs.push_front(rest);
                want = 0;
            }
        }
        self.tot_len -= head.tot_len;
        head
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.tot_len);
        for seg in &self.segs {
            out.extend_from_slice(seg);
        }
        out
    }
}

impl From<Vec<u8>> for Pbuf {
    fn from(data: Vec<u8>) -> Self {
        Pbuf::from_vec(data)
    }
}

impl From<&[u8]> for Pbuf {
    fn from(data: &[u8]) -> Self {
        Pbuf::from_slice(data)
    }
}

impl std::fmt::Debug for Pbuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pbuf(len={}, segs={})", self.tot_len, self.segs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> Pbuf {
        let mut p = Pbuf::from_slice(b"hello");
        p.cat(Pbuf::from_slice(b", "));
        p.push_segment(b"world".to_vec());
        p
    }

    #[test]
    fn test_chain_len_and_copy() {
        let p = chain();
        assert_eq!(p.tot_len(), 12);
        assert_eq!(p.segment_count(), 3);

        let mut dst = [0u8; 6];
        assert_eq!(p.copy_partial(&mut dst, 3), 6);
        assert_eq!(&dst, b"lo, wo");

        let mut tail = [0u8; 10];
        assert_eq!(p.copy_partial(&mut tail, 9), 3);
        assert_eq!(&tail[..3], b"rld");
    }

    #[test]
    fn test_free_header_across_segments() {
        let mut p = chain();
        p.free_header(6);
        assert_eq!(p.tot_len(), 6);
        assert_eq!(p.to_vec(), b" world");
        p.free_header(100);
        assert!(p.is_empty());
        assert_eq!(p.segment_count(), 0);
    }

    #[test]
    fn test_split_to() {
        let mut p = chain();
        let head = p.split_to(7);
        assert_eq!(head.to_vec(), b"hello, ");
        assert_eq!(p.to_vec(), b"world");
        assert_eq!(head.tot_len() + p.tot_len(), 12);

        let mut q = Pbuf::from_slice(b"abcdef");
        let h = q.split_to(2);
        assert_eq!(h.to_vec(), b"ab");
        assert_eq!(q.segment(0), Some(&b"cdef"[..]));
    }

    #[test]
    fn test_get_at() {
        let p = chain();
        assert_eq!(p.get_at(0), Some(b'h'));
        assert_eq!(p.get_at(7), Some(b'w'));
        assert_eq!(p.get_at(12), None);
    }
}

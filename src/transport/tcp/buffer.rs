//! Byte buffers behind a TCB
//!
//! - `SendBuffer`: bytes the application wrote, from SND.UNA onwards
//! - `RecvBuffer`: in-order bytes awaiting the application, plus an
//!   out-of-order holding area keyed by stream offset

use std::collections::{BTreeMap, VecDeque};

#[derive(Debug)]
pub struct SendBuffer {
    data: VecDeque<u8>,
    capacity: usize,
}

impl SendBuffer {
    pub fn new(capacity: usize) -> Self {
        SendBuffer {
            data: VecDeque::new(),
            capacity,
        }
    }

    /// Queue as much of `bytes` as fits; returns the count accepted
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.free());
        self.data.extend(&bytes[..n]);
        n
    }

    /// Release `n` acknowledged bytes from the front
    pub fn ack(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.drain(..n);
    }

    /// Copy up to `len` bytes starting `offset` bytes past SND.UNA
    pub fn slice(&self, offset: usize, len: usize) -> Vec<u8> {
        if offset >= self.data.len() {
            return Vec::new();
        }
        let end = (offset + len).min(self.data.len());
        self.data.range(offset..end).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn free(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

#[derive(Debug)]
pub struct RecvBuffer {
    ready: VecDeque<u8>,
    capacity: usize,
    /// Absolute stream offset of the next in-order byte (RCV.NXT minus IRS+1)
    next: u64,
    /// Disjoint held ranges beyond `next`, keyed by absolute start offset
    out_of_order: BTreeMap<u64, Vec<u8>>,
    fin_at: Option<u64>,
}

impl RecvBuffer {
    pub fn new(capacity: usize) -> Self {
        RecvBuffer {
            ready: VecDeque::new(),
            capacity,
            next: 0,
            out_of_order: BTreeMap::new(),
            fin_at: None,
        }
    }

    /// Free space, advertised to the peer as the receive window
    pub fn window(&self) -> usize {
        self.capacity - self.ready.len()
    }

    pub fn available(&self) -> usize {
        self.ready.len()
    }

    pub fn held(&self) -> usize {
        self.out_of_order.values().map(Vec::len).sum()
    }

    /// Accept `data` starting `offset` bytes past the next expected byte.
    ///
    /// Bytes beyond the window are cut off and ranges already held are
    /// trimmed away. Returns how far the in-order edge advanced, which
    /// includes previously held ranges that now connect.
    pub fn insert(&mut self, offset: usize, data: &[u8]) -> usize {
        let window = self.window();
        if offset >= window {
            return 0;
        }
        let mut data = &data[..data.len().min(window - offset)];
        if let Some(fin) = self.fin_at {
            let limit = fin.saturating_sub(self.next + offset as u64) as usize;
            data = &data[..data.len().min(limit)];
        }
        if data.is_empty() {
            return 0;
        }

        if offset > 0 {
            self.hold(self.next + offset as u64, data);
            return 0;
        }

        let before = self.next;
        self.ready.extend(data);
        self.next += data.len() as u64;
        self.merge_held();
        (self.next - before) as usize
    }

    fn hold(&mut self, start: u64, data: &[u8]) {
        let end = start + data.len() as u64;
        let mut cursor = start;
        let mut gaps = Vec::new();
        for (&s, piece) in self.out_of_order.range(..end) {
            let e = s + piece.len() as u64;
            if e <= cursor {
                continue;
            }
            if s > cursor {
                gaps.push((cursor, s));
            }
            cursor = cursor.max(e);
        }
        if cursor < end {
            gaps.push((cursor, end));
        }
        for (a, b) in gaps {
            let piece = data[(a - start) as usize..(b - start) as usize].to_vec();
            self.out_of_order.insert(a, piece);
        }
    }

    fn merge_held(&mut self) {
        while let Some(entry) = self.out_of_order.first_entry() {
            let start = *entry.key();
            if start > self.next {
                break;
            }
            let piece = entry.remove();
            let end = start + piece.len() as u64;
            if end > self.next {
                let skip = (self.next - start) as usize;
                self.ready.extend(&piece[skip..]);
                self.next = end;
            }
        }
    }

    /// Record that the peer's FIN follows `offset` bytes past the next
    /// expected byte
    pub fn mark_fin(&mut self, offset: usize) {
        let at = self.next + offset as u64;
        self.fin_at = Some(self.fin_at.map_or(at, |prev| prev.min(at)));
        self.out_of_order.retain(|&start, _| start < at);
        if let Some(mut last) = self.out_of_order.last_entry() {
            let start = *last.key();
            let keep = (at - start) as usize;
            last.get_mut().truncate(keep);
        }
    }

    /// True once every byte before the FIN has arrived
    pub fn fin_reached(&self) -> bool {
        self.fin_at == Some(self.next)
    }

    /// Hand up to `max` in-order bytes to the application
    pub fn read(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.ready.len());
        self.ready.drain(..n).collect()
    }

    pub fn clear(&mut self) {
        self.ready.clear();
        self.out_of_order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_buffer_write_ack_slice() {
        let mut buf = SendBuffer::new(8);
        assert_eq!(buf.write(b"hello world"), 8);
        assert_eq!(buf.free(), 0);
        assert_eq!(buf.slice(6, 10), b"wo");
        buf.ack(6);
        assert_eq!(buf.slice(0, 10), b"wo");
        assert_eq!(buf.write(b"rld"), 3);
        assert_eq!(buf.slice(0, 10), b"world");
        assert!(buf.slice(7, 1).is_empty());
    }

    #[test]
    fn test_in_order_delivery() {
        let mut buf = RecvBuffer::new(16);
        assert_eq!(buf.insert(0, b"abc"), 3);
        assert_eq!(buf.window(), 13);
        assert_eq!(buf.read(2), b"ab");
        assert_eq!(buf.read(10), b"c");
        assert_eq!(buf.window(), 16);
    }

    #[test]
    fn test_out_of_order_held_then_merged() {
        let mut buf = RecvBuffer::new(64);
        assert_eq!(buf.insert(6, b"ghi"), 0);
        assert_eq!(buf.insert(3, b"def"), 0);
        assert_eq!(buf.held(), 6);
        assert_eq!(buf.insert(0, b"abc"), 9);
        assert_eq!(buf.held(), 0);
        assert_eq!(buf.read(64), b"abcdefghi");
    }

    #[test]
    fn test_duplicates_trimmed_by_range() {
        let mut buf = RecvBuffer::new(64);
        buf.insert(4, b"efgh");
        buf.insert(10, b"kl");
        // Overlaps both held ranges and the gap between them.
        buf.insert(2, b"cdEFGHijKLmn");
        assert_eq!(buf.held(), 12);
        assert_eq!(buf.insert(0, b"ab"), 14);
        // Bytes first received win.
        assert_eq!(buf.read(64), b"abcdefghijklmn");
    }

    #[test]
    fn test_partial_overlap_with_delivered_data() {
        let mut buf = RecvBuffer::new(64);
        buf.insert(2, b"cdef");
        assert_eq!(buf.insert(0, b"abcd"), 6);
        assert_eq!(buf.read(64), b"abcdef");
    }

    #[test]
    fn test_window_limits_acceptance() {
        let mut buf = RecvBuffer::new(4);
        assert_eq!(buf.insert(0, b"abcdef"), 4);
        assert_eq!(buf.window(), 0);
        assert_eq!(buf.insert(0, b"g"), 0);
        assert_eq!(buf.insert(2, b"zz"), 0);
    }

    #[test]
    fn test_fin_after_gap() {
        let mut buf = RecvBuffer::new(64);
        buf.insert(3, b"def");
        buf.mark_fin(6);
        assert!(!buf.fin_reached());
        buf.insert(0, b"abc");
        assert!(buf.fin_reached());
        assert_eq!(buf.insert(0, b"xyz"), 0);
    }
}

//! IP fragment reassembly (RFC 791, RFC 8200 section 4.5)
//!
//! Fragments are grouped by (source, destination, identification, protocol).
//! Overlapping fragments poison the whole set (RFC 5722); an exact duplicate
//! of a piece already held is ignored. Sets that do not complete within the
//! timeout are discarded and handed back so the caller can report them.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use tracing::{debug, trace};

use crate::config::{FragmentConfig, Millis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub id: u32,
    pub protocol: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentDrop {
    /// A non-final fragment whose length is not a multiple of 8
    Misaligned,
    Empty,
    TooLarge,
    Overlap,
    /// The final fragment disagrees with data already held
    Inconsistent,
    /// Global buffer bound reached
    NoSpace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// The reassembled upper-layer payload
    Complete(Vec<u8>),
    Incomplete,
    Discarded(FragmentDrop),
}

/// A set dropped by [`Reassembler::poll`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredSet {
    pub key: FragmentKey,
    /// The first fragment as received, when it had arrived
    pub first_fragment: Option<Vec<u8>>,
}

#[derive(Debug)]
struct FragmentSet {
    /// Disjoint pieces keyed by byte offset
    pieces: BTreeMap<usize, Vec<u8>>,
    total_len: Option<usize>,
    bytes: usize,
    created_at: Millis,
    first_fragment: Option<Vec<u8>>,
}

impl FragmentSet {
    fn new(now: Millis) -> Self {
        FragmentSet {
            pieces: BTreeMap::new(),
            total_len: None,
            bytes: 0,
            created_at: now,
            first_fragment: None,
        }
    }

    /// Check `[offset, end)` against held pieces. `Ok(true)` means an exact
    /// duplicate.
    fn check_overlap(&self, offset: usize, data: &[u8]) -> Result<bool, FragmentDrop> {
        let end = offset + data.len();
        for (&start, piece) in self.pieces.range(..end) {
            let piece_end = start + piece.len();
            if piece_end <= offset {
                continue;
            }
            if start == offset && piece.as_slice() == data {
                return Ok(true);
            }
            return Err(FragmentDrop::Overlap);
        }
        Ok(false)
    }

    fn is_complete(&self) -> bool {
        let Some(total) = self.total_len else {
            return false;
        };
        let mut next = 0;
        for (&start, piece) in &self.pieces {
            if start != next {
                return false;
            }
            next = start + piece.len();
        }
        next == total
    }

    fn assemble(self) -> Vec<u8> {
        let mut datagram = Vec::with_capacity(self.bytes);
        for piece in self.pieces.into_values() {
            datagram.extend_from_slice(&piece);
        }
        datagram
    }
}

#[derive(Debug)]
pub struct Reassembler {
    sets: HashMap<FragmentKey, FragmentSet>,
    config: FragmentConfig,
    total_bytes: usize,
}

impl Reassembler {
    pub fn new(config: &FragmentConfig) -> Self {
        Reassembler {
            sets: HashMap::new(),
            config: config.clone(),
            total_bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Add one fragment.
    ///
    /// `offset` is in bytes; `datagram` is the whole received packet, kept
    /// from the first fragment for an ICMP time exceeded quote.
    pub fn add_fragment(
        &mut self,
        key: FragmentKey,
        offset: usize,
        payload: &[u8],
        more_fragments: bool,
        datagram: &[u8],
        now: Millis,
    ) -> Reassembly {
        if payload.is_empty() {
            return Reassembly::Discarded(FragmentDrop::Empty);
        }
        if more_fragments && payload.len() % 8 != 0 {
            return Reassembly::Discarded(FragmentDrop::Misaligned);
        }
        let end = offset + payload.len();
        if end > self.config.max_datagram_size {
            return self.discard(key, FragmentDrop::TooLarge);
        }

        if !self.sets.contains_key(&key) && self.sets.len() >= self.config.max_sets {
            self.evict_oldest(None);
        }
        let set = self
            .sets
            .entry(key)
            .or_insert_with(|| FragmentSet::new(now));

        match set.total_len {
            Some(total) if !more_fragments && total != end => {
                return self.discard(key, FragmentDrop::Inconsistent);
            }
            Some(total) if end > total => {
                return self.discard(key, FragmentDrop::Inconsistent);
            }
            None if !more_fragments => {
                let beyond = set
                    .pieces
                    .iter()
                    .next_back()
                    .map_or(false, |(&start, piece)| start + piece.len() > end);
                if beyond {
                    return self.discard(key, FragmentDrop::Inconsistent);
                }
            }
            _ => {}
        }

        match set.check_overlap(offset, payload) {
            Ok(true) => {
                trace!(?key, offset, "duplicate fragment ignored");
                return Reassembly::Incomplete;
            }
            Ok(false) => {}
            Err(reason) => return self.discard(key, reason),
        }

        set.pieces.insert(offset, payload.to_vec());
        set.bytes += payload.len();
        if !more_fragments {
            set.total_len = Some(end);
        }
        if offset == 0 {
            set.first_fragment = Some(datagram.to_vec());
        }
        self.total_bytes += payload.len();

        while self.total_bytes > self.config.max_total_bytes {
            if !self.evict_oldest(Some(key)) {
                return self.discard(key, FragmentDrop::NoSpace);
            }
        }

        let complete = self.sets.get(&key).map_or(false, FragmentSet::is_complete);
        if !complete {
            return Reassembly::Incomplete;
        }
        match self.sets.remove(&key) {
            Some(set) => {
                self.total_bytes -= set.bytes;
                debug!(?key, len = set.bytes, "datagram reassembled");
                Reassembly::Complete(set.assemble())
            }
            None => Reassembly::Incomplete,
        }
    }

    fn discard(&mut self, key: FragmentKey, reason: FragmentDrop) -> Reassembly {
        if let Some(set) = self.sets.remove(&key) {
            self.total_bytes -= set.bytes;
        }
        debug!(?key, ?reason, "fragment set discarded");
        Reassembly::Discarded(reason)
    }

    /// Drop the oldest set other than `keep`; false when there was none
    fn evict_oldest(&mut self, keep: Option<FragmentKey>) -> bool {
        let victim = self
            .sets
            .iter()
            .filter(|(key, _)| Some(**key) != keep)
            .min_by_key(|(_, set)| set.created_at)
            .map(|(key, _)| *key);
        match victim.and_then(|key| self.sets.remove(&key).map(|set| (key, set))) {
            Some((key, set)) => {
                self.total_bytes -= set.bytes;
                debug!(?key, "evicting fragment set");
                true
            }
            None => false,
        }
    }

    /// Remove sets older than the reassembly timeout
    pub fn poll(&mut self, now: Millis) -> Vec<ExpiredSet> {
        let timeout = self.config.timeout;
        let expired: Vec<FragmentKey> = self
            .sets
            .iter()
            .filter(|(_, set)| set.created_at + timeout <= now)
            .map(|(key, _)| *key)
            .collect();
        let mut out = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(set) = self.sets.remove(&key) {
                self.total_bytes -= set.bytes;
                debug!(?key, held = set.bytes, "reassembly timed out");
                out.push(ExpiredSet {
                    key,
                    first_fragment: set.first_fragment,
                });
            }
        }
        out
    }

    pub fn next_deadline(&self) -> Option<Millis> {
        self.sets
            .values()
            .map(|set| set.created_at + self.config.timeout)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: u32) -> FragmentKey {
        FragmentKey {
            src: "10.0.0.1".parse().unwrap(),
            dst: "10.0.0.2".parse().unwrap(),
            id,
            protocol: 17,
        }
    }

    fn reassembler() -> Reassembler {
        Reassembler::new(&FragmentConfig {
            timeout: 1_000,
            max_datagram_size: 4_096,
            max_sets: 2,
            max_total_bytes: 2_048,
        })
    }

    fn pieces() -> (Vec<u8>, [(usize, bool); 3]) {
        let data: Vec<u8> = (0..40u8).collect();
        (data, [(0, true), (16, true), (32, false)])
    }

    fn slice(data: &[u8], offset: usize) -> &[u8] {
        &data[offset..(offset + 16).min(data.len())]
    }

    #[test]
    fn test_three_fragments_in_every_order() {
        let (data, frags) = pieces();
        let orders = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let mut r = reassembler();
            let mut results = Vec::new();
            for i in order {
                let (offset, more) = frags[i];
                results.push(r.add_fragment(key(1), offset, slice(&data, offset), more, &[], 0));
            }
            assert_eq!(results[0], Reassembly::Incomplete);
            assert_eq!(results[1], Reassembly::Incomplete);
            assert_eq!(results[2], Reassembly::Complete(data.clone()), "{order:?}");
            assert!(r.is_empty());
            assert_eq!(r.buffered_bytes(), 0);
        }
    }

    #[test]
    fn test_timeout_discards_without_datagram() {
        let (data, _) = pieces();
        let mut r = reassembler();
        r.add_fragment(key(2), 0, slice(&data, 0), true, b"first", 100);
        r.add_fragment(key(2), 32, slice(&data, 32), false, &[], 200);
        assert_eq!(r.next_deadline(), Some(1_100));
        assert!(r.poll(1_099).is_empty());
        let expired = r.poll(1_100);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].first_fragment.as_deref(), Some(&b"first"[..]));
        assert!(r.is_empty());

        // The late middle piece starts a new set that cannot complete.
        assert_eq!(
            r.add_fragment(key(2), 16, slice(&data, 16), true, &[], 1_200),
            Reassembly::Incomplete
        );
    }

    #[test]
    fn test_overlap_discards_set_but_duplicate_is_ignored() {
        let (data, _) = pieces();
        let mut r = reassembler();
        r.add_fragment(key(3), 0, slice(&data, 0), true, &[], 0);
        assert_eq!(
            r.add_fragment(key(3), 0, slice(&data, 0), true, &[], 1),
            Reassembly::Incomplete
        );
        assert_eq!(
            r.add_fragment(key(3), 8, &data[8..24], true, &[], 2),
            Reassembly::Discarded(FragmentDrop::Overlap)
        );
        assert!(r.is_empty());
    }

    #[test]
    fn test_misaligned_and_inconsistent_fragments() {
        let mut r = reassembler();
        assert_eq!(
            r.add_fragment(key(4), 0, &[0; 10], true, &[], 0),
            Reassembly::Discarded(FragmentDrop::Misaligned)
        );
        r.add_fragment(key(4), 16, &[0; 16], true, &[], 0);
        assert_eq!(
            r.add_fragment(key(4), 0, &[0; 8], false, &[], 0),
            Reassembly::Discarded(FragmentDrop::Inconsistent)
        );
    }

    #[test]
    fn test_limits_evict_oldest_set() {
        let mut r = reassembler();
        r.add_fragment(key(10), 0, &[0; 8], true, &[], 0);
        r.add_fragment(key(11), 0, &[0; 8], true, &[], 1);
        r.add_fragment(key(12), 0, &[0; 8], true, &[], 2);
        assert_eq!(r.len(), 2);
        // key(10) was the oldest and made room.
        assert_eq!(
            r.add_fragment(key(10), 8, &[0; 8], false, &[], 3),
            Reassembly::Incomplete
        );

        let mut r = reassembler();
        assert_eq!(
            r.add_fragment(key(20), 0, &[0; 4_104], true, &[], 0),
            Reassembly::Discarded(FragmentDrop::TooLarge)
        );
        r.add_fragment(key(21), 0, &[0; 1_600], true, &[], 0);
        r.add_fragment(key(22), 0, &[0; 1_600], true, &[], 1);
        assert_eq!(r.len(), 1);
        assert!(r.buffered_bytes() <= 2_048);
    }
}

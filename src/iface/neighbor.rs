//! Link address resolution cache
//!
//! One implementation serves ARP (keyed by `Ipv4Addr`) and IPv6 Neighbor
//! Discovery (keyed by `Ipv6Addr`). An entry is either resolved, with an
//! expiry, or pending with a bounded queue of packets waiting for the answer.
//! The cache never builds requests itself; it tells the caller when one is
//! due.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;

use tracing::{debug, trace, warn};

use crate::config::{Millis, NeighborConfig};
use crate::link::MacAddr;

/// Answer to a resolution attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Known already; the packet is handed back for immediate transmission
    Resolved { mac: MacAddr, packet: Vec<u8> },
    /// The packet waits in the entry; send a request if asked to
    Queued { request_needed: bool },
    /// The entry's queue is full
    Dropped,
}

#[derive(Debug)]
enum EntryState {
    Resolved {
        mac: MacAddr,
        expires_at: Millis,
    },
    Pending {
        queue: VecDeque<Vec<u8>>,
        requests: u32,
        next_request: Millis,
    },
}

#[derive(Debug)]
struct Entry {
    state: EntryState,
    /// Last confirmation, or creation for entries never confirmed
    confirmed_at: Millis,
}

/// Work produced by [`NeighborCache::poll`]
#[derive(Debug, PartialEq, Eq)]
pub struct NeighborPoll<A> {
    /// Addresses whose request should be sent again
    pub retry: Vec<A>,
    /// Addresses given up on, with the number of packets dropped
    pub failed: Vec<(A, usize)>,
}

impl<A> Default for NeighborPoll<A> {
    fn default() -> Self {
        NeighborPoll {
            retry: Vec::new(),
            failed: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct NeighborCache<A> {
    entries: HashMap<A, Entry>,
    /// Pending entries pushed out by eviction, reported on the next poll
    evicted: Vec<(A, usize)>,
    config: NeighborConfig,
}

impl<A> NeighborCache<A>
where
    A: Copy + Eq + Hash + fmt::Display,
{
    pub fn new(config: &NeighborConfig) -> Self {
        NeighborCache {
            entries: HashMap::new(),
            evicted: Vec::new(),
            config: config.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, addr: A) -> bool {
        self.entries.contains_key(&addr)
    }

    /// Resolved link address, if still fresh
    pub fn lookup(&self, addr: A, now: Millis) -> Option<MacAddr> {
        match self.entries.get(&addr)?.state {
            EntryState::Resolved { mac, expires_at } if expires_at > now => Some(mac),
            _ => None,
        }
    }

    /// Find the link address for `addr`, holding `packet` if it is unknown
    pub fn resolve(&mut self, addr: A, packet: Vec<u8>, now: Millis) -> Resolution {
        if let Some(mac) = self.lookup(addr, now) {
            return Resolution::Resolved { mac, packet };
        }

        let retry_interval = self.config.retry_interval;
        let max_pending = self.config.max_pending_frames;
        if !self.entries.contains_key(&addr) && self.entries.len() >= self.config.max_entries {
            self.evict_one();
        }
        let entry = self.entries.entry(addr).or_insert_with(|| Entry {
            state: EntryState::Pending {
                queue: VecDeque::new(),
                requests: 0,
                next_request: now,
            },
            confirmed_at: now,
        });

        if let EntryState::Resolved { .. } = entry.state {
            // Stale: start over as a fresh resolution.
            entry.state = EntryState::Pending {
                queue: VecDeque::new(),
                requests: 0,
                next_request: now,
            };
        }
        let EntryState::Pending {
            queue,
            requests,
            next_request,
        } = &mut entry.state
        else {
            return Resolution::Dropped;
        };

        if queue.len() >= max_pending {
            trace!(%addr, "resolution queue full, dropping packet");
            return Resolution::Dropped;
        }
        queue.push_back(packet);
        if *requests == 0 {
            *requests = 1;
            *next_request = now + retry_interval;
            debug!(%addr, "resolving");
            Resolution::Queued {
                request_needed: true,
            }
        } else {
            Resolution::Queued {
                request_needed: false,
            }
        }
    }

    /// Record a confirmed mapping and release packets waiting on it, in the
    /// order they were queued
    pub fn handle_reply(&mut self, addr: A, mac: MacAddr, now: Millis) -> Vec<Vec<u8>> {
        let expires_at = now + self.config.entry_ttl;
        if !self.entries.contains_key(&addr) && self.entries.len() >= self.config.max_entries {
            self.evict_one();
        }
        let resolved = EntryState::Resolved { mac, expires_at };
        let previous = self.entries.insert(
            addr,
            Entry {
                state: resolved,
                confirmed_at: now,
            },
        );
        match previous.map(|entry| entry.state) {
            Some(EntryState::Pending { queue, .. }) => {
                debug!(%addr, %mac, queued = queue.len(), "resolved");
                queue.into()
            }
            Some(EntryState::Resolved { mac: old, .. }) if old != mac => {
                warn!(%addr, %old, new = %mac, "link address changed");
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Drop the least recently confirmed resolved entry. A pending entry
    /// goes only when nothing is resolved, and its queued packets are
    /// reported as a failed resolution.
    fn evict_one(&mut self) {
        let resolved = self
            .entries
            .iter()
            .filter(|(_, entry)| matches!(entry.state, EntryState::Resolved { .. }))
            .min_by_key(|(_, entry)| entry.confirmed_at)
            .map(|(&addr, _)| addr);
        let victim = resolved.or_else(|| {
            self.entries
                .iter()
                .min_by_key(|(_, entry)| entry.confirmed_at)
                .map(|(&addr, _)| addr)
        });
        let Some(addr) = victim else {
            return;
        };
        match self.entries.remove(&addr).map(|entry| entry.state) {
            Some(EntryState::Pending { queue, .. }) => {
                warn!(%addr, dropped = queue.len(), "pending resolution evicted");
                self.evicted.push((addr, queue.len()));
            }
            _ => trace!(%addr, "evicting neighbor entry"),
        }
    }

    /// Expire stale entries and report due retries and failed resolutions
    pub fn poll(&mut self, now: Millis) -> NeighborPoll<A> {
        let mut work = NeighborPoll {
            retry: Vec::new(),
            failed: std::mem::take(&mut self.evicted),
        };
        let max_requests = self.config.max_retries.max(1);
        let retry_interval = self.config.retry_interval;

        self.entries.retain(|&addr, entry| match &mut entry.state {
            EntryState::Resolved { expires_at, .. } => *expires_at > now,
            EntryState::Pending {
                queue,
                requests,
                next_request,
            } => {
                if *next_request > now {
                    return true;
                }
                if *requests >= max_requests {
                    warn!(%addr, dropped = queue.len(), "resolution failed");
                    work.failed.push((addr, queue.len()));
                    return false;
                }
                *requests += 1;
                *next_request = now + retry_interval;
                work.retry.push(addr);
                true
            }
        });
        work
    }

    pub fn next_deadline(&self) -> Option<Millis> {
        if !self.evicted.is_empty() {
            return Some(0);
        }
        self.entries
            .values()
            .map(|entry| match entry.state {
                EntryState::Resolved { expires_at, .. } => expires_at,
                EntryState::Pending { next_request, .. } => next_request,
            })
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const MAC: MacAddr = MacAddr([2, 0, 0, 0, 0, 9]);

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    fn cache() -> NeighborCache<Ipv4Addr> {
        NeighborCache::new(&NeighborConfig {
            max_entries: 2,
            max_pending_frames: 2,
            entry_ttl: 10_000,
            retry_interval: 1_000,
            max_retries: 3,
            ..NeighborConfig::default()
        })
    }

    #[test]
    fn test_queued_frames_flush_in_order_once() {
        let mut cache = cache();
        assert_eq!(
            cache.resolve(ip(2), vec![1], 0),
            Resolution::Queued {
                request_needed: true
            }
        );
        assert_eq!(
            cache.resolve(ip(2), vec![2], 10),
            Resolution::Queued {
                request_needed: false
            }
        );
        assert_eq!(cache.resolve(ip(2), vec![3], 20), Resolution::Dropped);

        assert_eq!(cache.handle_reply(ip(2), MAC, 30), vec![vec![1], vec![2]]);
        assert!(cache.handle_reply(ip(2), MAC, 31).is_empty());
        assert_eq!(
            cache.resolve(ip(2), vec![4], 40),
            Resolution::Resolved {
                mac: MAC,
                packet: vec![4]
            }
        );
    }

    #[test]
    fn test_retries_then_failure() {
        let mut cache = cache();
        cache.resolve(ip(3), vec![1], 0);
        cache.resolve(ip(3), vec![2], 0);
        assert_eq!(cache.next_deadline(), Some(1_000));
        assert_eq!(cache.poll(999), NeighborPoll::default());
        assert_eq!(cache.poll(1_000).retry, vec![ip(3)]);
        assert_eq!(cache.poll(2_000).retry, vec![ip(3)]);
        let work = cache.poll(3_000);
        assert!(work.retry.is_empty());
        assert_eq!(work.failed, vec![(ip(3), 2)]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_entries_expire() {
        let mut cache = cache();
        cache.handle_reply(ip(4), MAC, 0);
        assert_eq!(cache.lookup(ip(4), 9_999), Some(MAC));
        assert_eq!(cache.lookup(ip(4), 10_000), None);
        assert_eq!(
            cache.resolve(ip(4), vec![1], 10_000),
            Resolution::Queued {
                request_needed: true
            }
        );
        cache.poll(10_000);
        assert!(cache.contains(ip(4)));

        let mut cache = self::cache();
        cache.handle_reply(ip(4), MAC, 0);
        cache.poll(10_000);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_least_recently_confirmed_is_evicted() {
        let mut cache = cache();
        cache.handle_reply(ip(1), MAC, 0);
        cache.handle_reply(ip(2), MAC, 5);
        cache.handle_reply(ip(1), MAC, 10);
        cache.handle_reply(ip(3), MAC, 20);
        assert!(cache.contains(ip(1)));
        assert!(!cache.contains(ip(2)));
        assert!(cache.contains(ip(3)));
    }

    #[test]
    fn test_resolved_entry_is_evicted_before_pending_one() {
        let mut cache = cache();
        cache.resolve(ip(1), vec![1], 0);
        cache.handle_reply(ip(2), MAC, 5);
        cache.resolve(ip(3), vec![3], 10);
        assert!(cache.contains(ip(1)));
        assert!(!cache.contains(ip(2)));
        assert!(cache.contains(ip(3)));
        assert!(cache.poll(10).failed.is_empty());
    }

    #[test]
    fn test_evicted_pending_entry_reports_failure() {
        let mut cache = cache();
        cache.resolve(ip(1), vec![1], 0);
        cache.resolve(ip(1), vec![2], 0);
        cache.resolve(ip(2), vec![3], 5);
        cache.resolve(ip(3), vec![4], 10);
        assert!(!cache.contains(ip(1)));
        assert_eq!(cache.next_deadline(), Some(0));

        let work = cache.poll(10);
        assert_eq!(work.failed, vec![(ip(1), 2)]);
        assert!(cache.poll(10).failed.is_empty());
    }
}

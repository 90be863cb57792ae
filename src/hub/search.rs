//! Inbound search flood gate and outbound queued-search FIFO (§4.D, §3,
//! SPEC_FULL §10.5 — two distinct mechanisms, not one).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::constants::{
    DEFAULT_SEARCH_MIN_INTERVAL, SEARCH_FLOOD_BLACKLIST, SEARCH_FLOOD_THRESHOLD,
    SEARCH_FLOOD_WINDOW,
};
use crate::identity::Sid;

/// Polices inbound `SCH` traffic per hub session: any seeker appearing
/// `SEARCH_FLOOD_THRESHOLD` times within `SEARCH_FLOOD_WINDOW` is
/// blacklisted for `SEARCH_FLOOD_BLACKLIST`.
#[derive(Debug, Default)]
pub struct FloodGate {
    recent: HashMap<Sid, VecDeque<Instant>>,
    blacklist: HashMap<Sid, Instant>,
}

impl FloodGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a search from `seeker` at `now`. Returns `true` if it should
    /// be forwarded, `false` if the seeker is (now or already) blacklisted.
    pub fn admit(&mut self, seeker: Sid, now: Instant) -> bool {
        if let Some(&until) = self.blacklist.get(&seeker) {
            if now < until {
                return false;
            }
            self.blacklist.remove(&seeker);
        }

        let window = self.recent.entry(seeker).or_default();
        window.push_back(now);
        while let Some(&front) = window.front() {
            if now.duration_since(front) > SEARCH_FLOOD_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= SEARCH_FLOOD_THRESHOLD {
            self.blacklist.insert(seeker, now + SEARCH_FLOOD_BLACKLIST);
            window.clear();
            return false;
        }
        true
    }
}

/// One queued outbound search.
#[derive(Debug, Clone)]
pub struct QueuedSearch {
    pub line: String,
}

/// FIFO of our own outbound searches on one hub, drained no faster than
/// `min_interval` apart — independent of [`FloodGate`], which governs
/// *inbound* traffic.
#[derive(Debug)]
pub struct OutboundSearchQueue {
    queue: VecDeque<QueuedSearch>,
    min_interval: Duration,
    last_sent: Option<Instant>,
}

impl OutboundSearchQueue {
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            min_interval,
            last_sent: None,
        }
    }

    #[must_use]
    pub fn default_interval() -> Self {
        Self::new(DEFAULT_SEARCH_MIN_INTERVAL)
    }

    pub fn enqueue(&mut self, search: QueuedSearch) {
        self.queue.push_back(search);
    }

    /// Pops the next search to send, if the minimum interval has elapsed.
    pub fn try_dequeue(&mut self, now: Instant) -> Option<QueuedSearch> {
        if let Some(last) = self.last_sent {
            if now.duration_since(last) < self.min_interval {
                return None;
            }
        }
        let next = self.queue.pop_front()?;
        self.last_sent = Some(now);
        Some(next)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_searches_under_threshold() {
        let mut gate = FloodGate::new();
        let now = Instant::now();
        for _ in 0..SEARCH_FLOOD_THRESHOLD - 1 {
            assert!(gate.admit(Sid(1), now));
        }
    }

    #[test]
    fn blacklists_after_threshold_within_window() {
        let mut gate = FloodGate::new();
        let now = Instant::now();
        for _ in 0..SEARCH_FLOOD_THRESHOLD {
            gate.admit(Sid(2), now);
        }
        assert!(!gate.admit(Sid(2), now));
    }

    #[test]
    fn blacklist_expires() {
        let mut gate = FloodGate::new();
        let now = Instant::now();
        for _ in 0..SEARCH_FLOOD_THRESHOLD {
            gate.admit(Sid(3), now);
        }
        assert!(!gate.admit(Sid(3), now));
        let later = now + SEARCH_FLOOD_BLACKLIST + Duration::from_secs(1);
        assert!(gate.admit(Sid(3), later));
    }

    #[test]
    fn outbound_queue_respects_min_interval() {
        let mut queue = OutboundSearchQueue::new(Duration::from_secs(10));
        queue.enqueue(QueuedSearch { line: "BSCH AAAB ANfoo".into() });
        queue.enqueue(QueuedSearch { line: "BSCH AAAB ANbar".into() });

        let t0 = Instant::now();
        assert!(queue.try_dequeue(t0).is_some());
        assert!(queue.try_dequeue(t0).is_none());
        assert!(queue.try_dequeue(t0 + Duration::from_secs(11)).is_some());
    }
}

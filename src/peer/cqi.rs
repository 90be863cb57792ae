//! Connection queue item (CQI) bookkeeping and the MCN (multi-connection)
//! admission rules (§4.G).
//!
//! A CQI is a pure state record; nothing here touches a socket. The
//! surrounding manager (`peer::manager`) drives the per-second tick and
//! performs the actual connect.

use std::time::Instant;

use crate::client::ConnectKind;
use crate::identity::Cid;

/// Lifecycle state of one download/upload connection attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CqiState {
    /// Backed off, waiting for its turn at the next tick.
    Waiting,
    /// `registry.connect()` has been called; awaiting a socket or timeout.
    Connecting,
    /// A socket exists; the ADC/NMDC handshake is in progress.
    Handshaking,
    /// Handshake complete, no transfer running (upload side, idle slot).
    Idle,
    /// A transfer is actively running.
    Active,
}

/// One pending or running peer connection against a single user.
#[derive(Debug, Clone)]
pub struct Cqi {
    pub cid: Cid,
    pub hub_url: String,
    pub kind: ConnectKind,
    pub state: CqiState,
    /// Bypasses the per-user MCN cap and the global rate limiter; used for
    /// filelists and other tiny transfers.
    pub small_slot: bool,
    /// Consecutive failures. `-1` marks a permanent (non-retrying) failure.
    pub errors: i32,
    /// Set when the hub/queue signals this CQI should be torn down.
    pub remove: bool,
    pub last_attempt: Option<Instant>,
    state_entered_at: Instant,
}

impl Cqi {
    #[must_use]
    pub fn new(cid: Cid, hub_url: String, kind: ConnectKind, small_slot: bool, now: Instant) -> Self {
        Self {
            cid,
            hub_url,
            kind,
            state: CqiState::Waiting,
            small_slot,
            errors: 0,
            remove: false,
            last_attempt: None,
            state_entered_at: now,
        }
    }

    pub fn enter(&mut self, state: CqiState, now: Instant) {
        self.state = state;
        self.state_entered_at = now;
    }

    /// Back-off before this CQI is eligible for another first attempt:
    /// `60s * max(1, errors)` (§4.G).
    #[must_use]
    pub fn backoff(&self) -> std::time::Duration {
        let multiplier = self.errors.max(1) as u32;
        crate::constants::CQI_BACKOFF_BASE * multiplier
    }

    #[must_use]
    pub fn is_past_backoff(&self, now: Instant) -> bool {
        match self.last_attempt {
            None => true,
            Some(last) => now.duration_since(last) >= self.backoff(),
        }
    }

    /// `true` once `CONNECTING` has stalled past the connect timeout.
    #[must_use]
    pub fn is_connect_timed_out(&self, now: Instant) -> bool {
        self.state == CqiState::Connecting
            && now.duration_since(self.state_entered_at) >= crate::constants::CQI_CONNECT_TIMEOUT
    }
}

/// Per-user MCN admission rules (§4.G):
/// - at most one non-MCN CQI per user
/// - at most `max_conns` simultaneous active/running CQIs for an MCN user
/// - small-slot CQIs are exempt from both caps
#[must_use]
pub fn admits_new_cqi(existing: &[&Cqi], is_mcn_user: bool, max_conns: u32, small_slot: bool) -> bool {
    if small_slot {
        return true;
    }
    let running = existing.iter().filter(|c| !c.small_slot).count();
    if !is_mcn_user {
        running == 0
    } else {
        (running as u32) < max_conns
    }
}

/// Global per-second first-attempt rate limiter (§4.G: `DOWNCONN_PER_SEC *
/// 2`). Tracks how many first attempts have been made in the current
/// one-second window.
#[derive(Debug, Default)]
pub struct FirstAttemptRateLimiter {
    window_start: Option<Instant>,
    count_in_window: u32,
}

impl FirstAttemptRateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` (and records the attempt) if under the per-second cap.
    pub fn try_admit(&mut self, now: Instant, limit_per_sec: u32) -> bool {
        let cap = limit_per_sec.saturating_mul(2);
        match self.window_start {
            Some(start) if now.duration_since(start) < std::time::Duration::from_secs(1) => {
                if self.count_in_window >= cap {
                    return false;
                }
                self.count_in_window += 1;
                true
            }
            _ => {
                self.window_start = Some(now);
                self.count_in_window = 1;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cid() -> Cid {
        Cid([1u8; crate::constants::CID_LEN])
    }

    #[test]
    fn non_mcn_user_admits_only_one_running_cqi() {
        let now = Instant::now();
        let existing = Cqi::new(cid(), "adc://h".into(), ConnectKind::Download, false, now);
        assert!(admits_new_cqi(&[], false, 0, false));
        assert!(!admits_new_cqi(&[&existing], false, 0, false));
    }

    #[test]
    fn mcn_user_admits_up_to_max_conns() {
        let now = Instant::now();
        let a = Cqi::new(cid(), "adc://h".into(), ConnectKind::Download, false, now);
        let b = Cqi::new(cid(), "adc://h".into(), ConnectKind::Download, false, now);
        assert!(admits_new_cqi(&[&a], true, 2, false));
        assert!(!admits_new_cqi(&[&a, &b], true, 2, false));
    }

    #[test]
    fn small_slot_bypasses_every_cap() {
        let now = Instant::now();
        let a = Cqi::new(cid(), "adc://h".into(), ConnectKind::Download, false, now);
        let b = Cqi::new(cid(), "adc://h".into(), ConnectKind::Download, false, now);
        assert!(admits_new_cqi(&[&a, &b], false, 1, true));
    }

    #[test]
    fn backoff_scales_with_error_count() {
        let now = Instant::now();
        let mut c = Cqi::new(cid(), "adc://h".into(), ConnectKind::Download, false, now);
        assert_eq!(c.backoff(), Duration::from_secs(60));
        c.errors = 3;
        assert_eq!(c.backoff(), Duration::from_secs(180));
    }

    #[test]
    fn connecting_past_timeout_is_detected() {
        let now = Instant::now();
        let mut c = Cqi::new(cid(), "adc://h".into(), ConnectKind::Download, false, now);
        c.enter(CqiState::Connecting, now);
        assert!(!c.is_connect_timed_out(now + Duration::from_secs(10)));
        assert!(c.is_connect_timed_out(now + Duration::from_secs(51)));
    }

    #[test]
    fn rate_limiter_caps_first_attempts_per_second() {
        let mut limiter = FirstAttemptRateLimiter::new();
        let now = Instant::now();
        for _ in 0..4 {
            assert!(limiter.try_admit(now, 2));
        }
        assert!(!limiter.try_admit(now, 2));
        assert!(limiter.try_admit(now + Duration::from_secs(2), 2));
    }
}

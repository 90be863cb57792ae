//! Crate-wide constants, grouped by domain.
//!
//! Magic numbers drawn directly from §3/§4 of the specification are named
//! here instead of scattered across call sites.

use std::time::Duration;

// ============================================================================
// Identifiers
// ============================================================================

/// Byte length of a CID (Client ID) and PID (Private ID).
pub const CID_LEN: usize = 24;

/// Byte length of a SID (Session ID) before base32 encoding.
pub const SID_LEN: usize = 4;

/// Reserved SID for the hub itself (`AAAA` base32).
pub const HUB_SID: u32 = 0;

// ============================================================================
// Hub session timing
// ============================================================================

/// Send a keepalive `\n` when NORMAL and idle past this long.
pub const KEEPALIVE_IDLE: Duration = Duration::from_secs(120);

/// Sliding window for the inbound search flood gate.
pub const SEARCH_FLOOD_WINDOW: Duration = Duration::from_secs(5);

/// A seeker appearing this many times within the flood window gets blacklisted.
pub const SEARCH_FLOOD_THRESHOLD: usize = 8;

/// Duration a flooding seeker stays blacklisted.
pub const SEARCH_FLOOD_BLACKLIST: Duration = Duration::from_secs(120);

/// Default minimum interval between our own outbound queued searches on one hub.
pub const DEFAULT_SEARCH_MIN_INTERVAL: Duration = Duration::from_secs(10);

/// Grace window a `User` is retained after its last `OnlineUser` goes offline.
pub const USER_GRACE_WINDOW: Duration = Duration::from_secs(10 * 60);

// ============================================================================
// GET blom bounds
// ============================================================================

/// Minimum allowed number of hash functions `k`.
pub const BLOOM_K_MIN: u32 = 1;
/// Maximum allowed number of hash functions `k`.
pub const BLOOM_K_MAX: u32 = 8;
/// Minimum allowed bit-table exponent `h`.
pub const BLOOM_H_MIN: u32 = 1;
/// Maximum allowed bit-table exponent `h`.
pub const BLOOM_H_MAX: u32 = 64;
/// `h` below this value bounds `m` additionally by `2^h`.
pub const BLOOM_H_EXACT_BOUND: u32 = 32;

// ============================================================================
// Hub URL defaults
// ============================================================================

/// Default port for `adc://`/`adcs://` when the URL omits one.
pub const DEFAULT_ADC_PORT: u16 = 5000;

/// Default port for `nmdc://`/`nmdcs://` when the URL omits one.
pub const DEFAULT_NMDC_PORT: u16 = 411;

// ============================================================================
// Peer connection manager
// ============================================================================

/// A `CONNECTING` CQI past this long without a socket event is treated as timed out.
pub const CQI_CONNECT_TIMEOUT: Duration = Duration::from_secs(50);

/// Base back-off unit; effective back-off is `BASE * max(1, errors)`.
pub const CQI_BACKOFF_BASE: Duration = Duration::from_secs(60);

/// Interval of the peer-connection-manager tick.
pub const CQI_TICK_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// HBRI
// ============================================================================

/// HBRI connect deadline.
pub const HBRI_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HBRI poll slice while waiting for connect or cancellation.
pub const HBRI_POLL_SLICE: Duration = Duration::from_millis(100);

/// Max bytes read while waiting for the `STA` reply.
pub const HBRI_MAX_REPLY: usize = 8 * 1024;

// ============================================================================
// Connectivity / port mapper
// ============================================================================

/// Port-mapper lease renewal check interval.
pub const PORT_MAP_RENEW_TICK: Duration = Duration::from_secs(60);

/// Default requested UPnP/NAT-PMP lease lifetime, in minutes.
pub const DEFAULT_LEASE_MINUTES: u32 = 60;

// ============================================================================
// Cancellation polling
// ============================================================================

/// Poll granularity for monotonic cancellation flags (shutdown, HBRI stop).
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Registry minute-timer tick (User GC, search-flood sweep).
pub const MINUTE_TICK: Duration = Duration::from_secs(60);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_and_sid_lengths_match_spec() {
        assert_eq!(CID_LEN, 24);
        assert_eq!(SID_LEN, 4);
    }

    #[test]
    fn bloom_bounds_are_internally_consistent() {
        assert!(BLOOM_K_MIN <= BLOOM_K_MAX);
        assert!(BLOOM_H_MIN <= BLOOM_H_MAX);
        assert!(BLOOM_H_EXACT_BOUND <= BLOOM_H_MAX);
    }
}

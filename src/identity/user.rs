//! Globally-interned `User` (§3) — one per CID, shared across every hub
//! session and `OnlineUser` that currently references it.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::identity::Cid;

bitflags::bitflags! {
    /// Boolean attributes derived from identity/support observations, not
    /// carried on the wire directly.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct UserFlags: u32 {
        const BOT                       = 1 << 0;
        const TLS                       = 1 << 1;
        const CCPM                      = 1 << 2;
        const PASSIVE                   = 1 << 3;
        const NMDC                      = 1 << 4;
        const ONLINE                    = 1 << 5;
        const ASCH                      = 1 << 6;
        const NO_ADC_1_0_PROTOCOL       = 1 << 7;
        const NO_ADCS_0_10_PROTOCOL     = 1 << 8;
        const NAT_TRAVERSAL             = 1 << 9;
    }
}

/// A client identity shared by every `OnlineUser` binding across hubs.
///
/// Reference-counted by the registry: created lazily on first sighting,
/// retained for the grace window after the last `OnlineUser` drops.
#[derive(Debug)]
pub struct User {
    cid: Cid,
    flags: AtomicU32,
    refcount: AtomicU32,
    /// Unix seconds of the last time this user went fully offline, `0` while online.
    offline_since: AtomicU64,
}

impl User {
    #[must_use]
    pub fn new(cid: Cid) -> Self {
        Self {
            cid,
            flags: AtomicU32::new(0),
            refcount: AtomicU32::new(1),
            offline_since: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn cid(&self) -> Cid {
        self.cid
    }

    #[must_use]
    pub fn flags(&self) -> UserFlags {
        UserFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: UserFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    pub fn add_flag(&self, flag: UserFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub fn remove_flag(&self, flag: UserFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.flags().contains(UserFlags::ONLINE)
    }

    pub fn incref(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the refcount after decrementing.
    pub fn decref(&self) -> u32 {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Marks the user fully offline (no remaining `OnlineUser` bindings),
    /// starting the grace-window clock.
    pub fn mark_offline_now(&self) {
        self.remove_flag(UserFlags::ONLINE);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.offline_since.store(now, Ordering::Release);
    }

    pub fn mark_online(&self) {
        self.add_flag(UserFlags::ONLINE);
        self.offline_since.store(0, Ordering::Release);
    }

    /// Whether this user is a GC candidate: only the registry's own
    /// reference remains, it's offline, and the grace window has elapsed.
    #[must_use]
    pub fn is_reclaimable(&self, grace_window_secs: u64) -> bool {
        if self.refcount() > 1 || self.is_online() {
            return false;
        }
        let since = self.offline_since.load(Ordering::Acquire);
        if since == 0 {
            return false;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        now.saturating_sub(since) >= grace_window_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(byte: u8) -> Cid {
        Cid([byte; crate::constants::CID_LEN])
    }

    #[test]
    fn starts_with_refcount_one_and_offline() {
        let u = User::new(cid(1));
        assert_eq!(u.refcount(), 1);
        assert!(!u.is_online());
    }

    #[test]
    fn flags_round_trip() {
        let u = User::new(cid(2));
        u.add_flag(UserFlags::BOT | UserFlags::TLS);
        assert!(u.flags().contains(UserFlags::BOT));
        assert!(u.flags().contains(UserFlags::TLS));
        u.remove_flag(UserFlags::BOT);
        assert!(!u.flags().contains(UserFlags::BOT));
    }

    #[test]
    fn reclaimable_only_after_grace_window_with_refcount_one() {
        let u = User::new(cid(3));
        u.incref();
        u.mark_online();
        assert!(!u.is_reclaimable(0));
        u.decref();
        u.mark_offline_now();
        assert!(u.is_reclaimable(0));
    }
}

//! Upload/download slot accounting (§4.G slot accounting).

use std::sync::atomic::{AtomicU32, Ordering};

/// Per-user MCN slot count from the remote's advertised download speed,
/// piecewise over connection-speed class.
#[must_use]
pub fn slots_per_user(down_mbps: f64) -> u32 {
    if down_mbps <= 10.0 {
        2
    } else if down_mbps <= 25.0 {
        3
    } else if down_mbps <= 50.0 {
        4
    } else if down_mbps <= 100.0 {
        ((down_mbps / 10.0) as u32).saturating_sub(1)
    } else {
        15
    }
}

/// Global download/upload slot pools. Small-slot connections bypass the
/// global cap entirely (§4.G) and are not tracked here.
#[derive(Debug, Default)]
pub struct SlotPool {
    download_limit: AtomicU32,
    upload_limit: AtomicU32,
    downloads_in_use: AtomicU32,
    uploads_in_use: AtomicU32,
}

impl SlotPool {
    #[must_use]
    pub fn new(download_limit: u32, upload_limit: u32) -> Self {
        Self {
            download_limit: AtomicU32::new(download_limit),
            upload_limit: AtomicU32::new(upload_limit),
            downloads_in_use: AtomicU32::new(0),
            uploads_in_use: AtomicU32::new(0),
        }
    }

    pub fn set_download_limit(&self, limit: u32) {
        self.download_limit.store(limit, Ordering::Release);
    }

    pub fn set_upload_limit(&self, limit: u32) {
        self.upload_limit.store(limit, Ordering::Release);
    }

    /// Attempts to claim one download slot; `false` if the pool is full.
    pub fn try_acquire_download(&self) -> bool {
        try_acquire(&self.downloads_in_use, self.download_limit.load(Ordering::Acquire))
    }

    pub fn release_download(&self) {
        self.downloads_in_use.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1))).ok();
    }

    pub fn try_acquire_upload(&self) -> bool {
        try_acquire(&self.uploads_in_use, self.upload_limit.load(Ordering::Acquire))
    }

    pub fn release_upload(&self) {
        self.uploads_in_use.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1))).ok();
    }
}

fn try_acquire(counter: &AtomicU32, limit: u32) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| if v < limit { Some(v + 1) } else { None })
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_per_user_matches_spec_table() {
        assert_eq!(slots_per_user(1.0), 2);
        assert_eq!(slots_per_user(10.0), 2);
        assert_eq!(slots_per_user(15.0), 3);
        assert_eq!(slots_per_user(25.0), 3);
        assert_eq!(slots_per_user(30.0), 4);
        assert_eq!(slots_per_user(50.0), 4);
        assert_eq!(slots_per_user(80.0), 7);
        assert_eq!(slots_per_user(100.0), 9);
        assert_eq!(slots_per_user(200.0), 15);
    }

    #[test]
    fn slot_pool_enforces_limit() {
        let pool = SlotPool::new(2, 1);
        assert!(pool.try_acquire_download());
        assert!(pool.try_acquire_download());
        assert!(!pool.try_acquire_download());
        pool.release_download();
        assert!(pool.try_acquire_download());
    }

    #[test]
    fn upload_and_download_pools_are_independent() {
        let pool = SlotPool::new(1, 1);
        assert!(pool.try_acquire_download());
        assert!(pool.try_acquire_upload());
        assert!(!pool.try_acquire_download());
        assert!(!pool.try_acquire_upload());
    }
}

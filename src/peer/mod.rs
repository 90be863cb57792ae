//! Peer connection manager (§4.G): owns the per-user connection queue,
//! slot accounting, connect tokens, and the handshake/NAT-traversal state
//! machines. The socket work itself lives in [`listener`]; everything else
//! here is pure and unit-tested without I/O.

pub mod cqi;
pub mod handshake;
pub mod listener;
pub mod nat;
pub mod slots;
pub mod token;

use std::time::Instant;

use crate::client::ConnectKind;
use crate::identity::Cid;

pub use cqi::{Cqi, CqiState};

/// Which download bucket a CQI's next attempt should pull from, mirroring
/// the queue's own type split between small (filelist-sized) transfers,
/// ordinary bundle transfers, and additional MCN connections for the same
/// bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadKind {
    Any,
    Small,
    McnNormal,
}

/// What the queue had ready for a user we were about to dial. Hub hint can
/// change from what the CQI was created with if the queue knows the user
/// moved hubs and url-changing is allowed.
#[derive(Debug, Clone)]
pub struct QueuedDownload {
    pub hub_url: String,
    pub kind: DownloadKind,
}

/// External collaborator owning actual queue/bundle state. This crate only
/// calls it to ask "is there anything to download from this user right
/// now, and which hub should we use" — it never implements queueing itself.
pub trait QueueProvider: Send + Sync {
    fn start_download(
        &self,
        cid: Cid,
        hub_hint: &str,
        kind: DownloadKind,
        allow_hub_change: bool,
    ) -> Option<QueuedDownload>;
}

/// A side effect the per-second tick wants performed.
#[derive(Debug, Clone)]
pub enum PeerManagerAction {
    /// Hand this off to the client registry's `connect()`.
    RequestConnect { cid: Cid, hub_url: String, token: String, kind: ConnectKind },
    Failed { cid: Cid, reason: String },
    Remove { cid: Cid },
}

/// Owns every outstanding CQI plus the shared rate limiter, token map and
/// slot pools. Socket-free; [`listener`] drives the actual connects this
/// produces.
pub struct PeerManager {
    cqis: Vec<Cqi>,
    rate_limiter: cqi::FirstAttemptRateLimiter,
    pub expected: token::ExpectedConnections,
    pub slots: slots::SlotPool,
    download_rate_limit_per_sec: u32,
}

impl PeerManager {
    #[must_use]
    pub fn new(download_rate_limit_per_sec: u32, download_slots: u32, upload_slots: u32) -> Self {
        Self {
            cqis: Vec::new(),
            rate_limiter: cqi::FirstAttemptRateLimiter::new(),
            expected: token::ExpectedConnections::new(),
            slots: slots::SlotPool::new(download_slots, upload_slots),
            download_rate_limit_per_sec,
        }
    }

    /// Entry point for a caller that wants to start (or queue) a download
    /// from a user. Mirrors `getDownloadConnection`: admits the CQI per the
    /// MCN rules, or no-ops if one is already queued/running and the caps
    /// don't allow another.
    pub fn get_download_connection(
        &mut self,
        cid: Cid,
        hub_url: String,
        is_mcn_user: bool,
        max_conns: u32,
        small_slot: bool,
        now: Instant,
    ) -> bool {
        let existing: Vec<&Cqi> = self.cqis.iter().filter(|c| c.cid == cid).collect();
        if !cqi::admits_new_cqi(&existing, is_mcn_user, max_conns, small_slot) {
            return false;
        }
        self.cqis.push(Cqi::new(cid, hub_url, ConnectKind::Download, small_slot, now));
        true
    }

    /// Marks every CQI for a user (or a single token) for teardown on the
    /// next tick, mirroring `putCQI`/`disconnect(token)`.
    pub fn mark_removed(&mut self, cid: Cid) {
        for c in &mut self.cqis {
            if c.cid == cid {
                c.remove = true;
            }
        }
    }

    #[must_use]
    pub fn cqis_for(&self, cid: Cid) -> Vec<&Cqi> {
        self.cqis.iter().filter(|c| c.cid == cid).collect()
    }

    /// Runs one second-tick pass over every waiting/connecting CQI,
    /// grounded on the original client's `attemptDownloads`: connect
    /// timeouts flip back to `Waiting` with an incremented error count;
    /// eligible CQIs (first attempt under the global rate cap, or past
    /// their exponential back-off) ask the queue for work and either start
    /// connecting or get dropped if the queue has nothing left for them.
    pub fn tick(&mut self, now: Instant, is_online: impl Fn(Cid) -> bool, queue: &dyn QueueProvider) -> Vec<PeerManagerAction> {
        let mut actions = Vec::new();
        let mut remove_cids = Vec::new();

        for cqi in &mut self.cqis {
            if !matches!(cqi.state, CqiState::Waiting | CqiState::Connecting) {
                cqi.remove = false;
                continue;
            }

            if !is_online(cqi.cid) || cqi.remove {
                remove_cids.push(cqi.cid);
                continue;
            }

            if cqi.state == CqiState::Connecting {
                if cqi.is_connect_timed_out(now) {
                    cqi.errors += 1;
                    cqi.enter(CqiState::Waiting, now);
                    actions.push(PeerManagerAction::Failed { cid: cqi.cid, reason: "connection timeout".into() });
                }
                continue;
            }

            if cqi.errors == -1 && cqi.last_attempt.is_some() {
                continue;
            }

            let is_first_attempt = cqi.last_attempt.is_none();
            let eligible = if is_first_attempt {
                self.rate_limiter.try_admit(now, self.download_rate_limit_per_sec)
            } else {
                cqi.is_past_backoff(now)
            };
            if !eligible {
                continue;
            }

            cqi.last_attempt = Some(now);
            let kind = if cqi.small_slot { DownloadKind::Small } else { DownloadKind::Any };
            match queue.start_download(cqi.cid, &cqi.hub_url, kind, true) {
                Some(queued) => {
                    cqi.hub_url = queued.hub_url.clone();
                    cqi.enter(CqiState::Connecting, now);
                    let token = token::generate();
                    self.expected.register(
                        token.clone(),
                        token::ExpectedConnection {
                            cid: cqi.cid,
                            hub_url: queued.hub_url.clone(),
                            nat_role: None,
                            private_message: false,
                        },
                    );
                    actions.push(PeerManagerAction::RequestConnect {
                        cid: cqi.cid,
                        hub_url: queued.hub_url,
                        token,
                        kind: cqi.kind,
                    });
                }
                None => remove_cids.push(cqi.cid),
            }
        }

        self.cqis.retain(|c| !remove_cids.contains(&c.cid));
        for cid in remove_cids {
            actions.push(PeerManagerAction::Remove { cid });
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CID_LEN;

    fn cid(b: u8) -> Cid {
        Cid([b; CID_LEN])
    }

    struct AlwaysReady;
    impl QueueProvider for AlwaysReady {
        fn start_download(&self, _cid: Cid, hub_hint: &str, kind: DownloadKind, _allow_hub_change: bool) -> Option<QueuedDownload> {
            Some(QueuedDownload { hub_url: hub_hint.to_string(), kind })
        }
    }

    struct NeverReady;
    impl QueueProvider for NeverReady {
        fn start_download(&self, _cid: Cid, _hub_hint: &str, _kind: DownloadKind, _allow_hub_change: bool) -> Option<QueuedDownload> {
            None
        }
    }

    #[test]
    fn get_download_connection_rejects_second_non_mcn_cqi() {
        let mut mgr = PeerManager::new(1, 3, 3);
        let now = Instant::now();
        assert!(mgr.get_download_connection(cid(1), "adc://h".into(), false, 0, false, now));
        assert!(!mgr.get_download_connection(cid(1), "adc://h".into(), false, 0, false, now));
    }

    #[test]
    fn tick_starts_waiting_cqi_and_registers_token() {
        let mut mgr = PeerManager::new(10, 3, 3);
        let now = Instant::now();
        mgr.get_download_connection(cid(1), "adc://h".into(), false, 0, false, now);

        let actions = mgr.tick(now, |_| true, &AlwaysReady);
        assert_eq!(actions.len(), 1);
        let token = match &actions[0] {
            PeerManagerAction::RequestConnect { cid: c, hub_url, token, .. } => {
                assert_eq!(*c, cid(1));
                assert_eq!(hub_url, "adc://h");
                token.clone()
            }
            other => panic!("unexpected: {other:?}"),
        };
        assert_eq!(mgr.cqis_for(cid(1))[0].state, CqiState::Connecting);
        assert!(mgr.expected.get(&token).is_some());
    }

    #[test]
    fn tick_drops_cqi_when_queue_has_nothing() {
        let mut mgr = PeerManager::new(10, 3, 3);
        let now = Instant::now();
        mgr.get_download_connection(cid(1), "adc://h".into(), false, 0, false, now);

        let actions = mgr.tick(now, |_| true, &NeverReady);
        assert!(matches!(actions[0], PeerManagerAction::Remove { cid: c } if c == cid(1)));
        assert!(mgr.cqis_for(cid(1)).is_empty());
    }

    #[test]
    fn tick_removes_cqi_for_offline_user() {
        let mut mgr = PeerManager::new(10, 3, 3);
        let now = Instant::now();
        mgr.get_download_connection(cid(1), "adc://h".into(), false, 0, false, now);

        let actions = mgr.tick(now, |_| false, &AlwaysReady);
        assert!(matches!(actions[0], PeerManagerAction::Remove { cid: c } if c == cid(1)));
    }

    #[test]
    fn tick_times_out_stalled_connecting_cqi() {
        let mut mgr = PeerManager::new(10, 3, 3);
        let now = Instant::now();
        mgr.get_download_connection(cid(1), "adc://h".into(), false, 0, false, now);
        mgr.tick(now, |_| true, &AlwaysReady);

        let later = now + std::time::Duration::from_secs(51);
        let actions = mgr.tick(later, |_| true, &AlwaysReady);
        assert!(actions.iter().any(|a| matches!(a, PeerManagerAction::Failed { cid: c, .. } if *c == cid(1))));
        assert_eq!(mgr.cqis_for(cid(1))[0].state, CqiState::Waiting);
        assert_eq!(mgr.cqis_for(cid(1))[0].errors, 1);
    }
}

//! Client registry (§4.F): interns `User`s by CID, owns the hub-URL → hub
//! session map, and routes `connect`/`privateMessage`/`sendUDP` to whichever
//! hub session currently hosts the target.
//!
//! Each hub session's reducer is opaque outside its own worker task; the
//! registry never reaches into it directly. Instead it spawns one pump task
//! per hub that drains the session's `HubEvent` stream, keeps a CID→SID (or
//! CID→nick, for NMDC) index current, and forwards every event on to the
//! owner's sink — the "listener as channel" convention used throughout this
//! crate (§9).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::client::types::{ConnectKind, HintedUser};
use crate::codec::AdcCommand;
use crate::crypto::sudp;
use crate::error::ConnectError;
use crate::hub::{self, ConnectTarget, HubConnectOptions, HubEvent, HubHandle};
use crate::identity::{Cid, Pid, Sid, User};

/// Per-hub bookkeeping the registry needs to route by CID: the live handle
/// plus the CID↔session-identifier index the event pump keeps current.
struct HubEntry {
    handle: HubHandle,
    is_adc: bool,
    /// Our own nick on this hub; only meaningful for NMDC, which has no CID
    /// to identify the sender of a `$To:` private message.
    own_nick: String,
    sid_by_cid: HashMap<Cid, Sid>,
    cid_by_sid: HashMap<Sid, Cid>,
}

/// Owns every hub session this process maintains and the CID-keyed identity
/// table shared across them.
pub struct ClientRegistry {
    own_cid: Cid,
    own_pid: Pid,
    users: Arc<DashMap<Cid, Arc<User>>>,
    hubs: Arc<DashMap<String, HubEntry>>,
    udp: Arc<UdpSocket>,
    events: mpsc::Sender<HubEvent>,
}

impl ClientRegistry {
    /// `events` receives every `HubEvent` from every hub this registry
    /// manages, tagged with nothing beyond what `HubEvent` itself carries —
    /// callers that need to know which hub an event came from should use
    /// `HubEvent::UserConnected`/`UserUpdated`'s SID together with a prior
    /// `hub_url_for` lookup, since SIDs alone aren't globally unique.
    #[must_use]
    pub fn new(own_cid: Cid, own_pid: Pid, udp: Arc<UdpSocket>, events: mpsc::Sender<HubEvent>) -> Self {
        Self {
            own_cid,
            own_pid,
            users: Arc::new(DashMap::new()),
            hubs: Arc::new(DashMap::new()),
            udp,
            events,
        }
    }

    /// Connects to a hub and registers it under `url`. Returns `None` if a
    /// session for this URL already exists — the caller should treat that
    /// as "already connected", not an error.
    pub async fn create_client(&self, opts: HubConnectOptions) -> Result<Option<()>, ConnectError> {
        let url = opts.url.clone();
        if self.hubs.contains_key(&url) {
            return Ok(None);
        }
        let is_adc = url.starts_with("adc://") || url.starts_with("adcs://");
        let own_nick = opts.nick.clone();
        let (handle, evt_rx) = hub::connect(opts, Vec::new())
            .await
            .map_err(|e| ConnectError::Generic(e.to_string()))?;

        self.hubs.insert(
            url.clone(),
            HubEntry {
                handle: handle.clone(),
                is_adc,
                own_nick,
                sid_by_cid: HashMap::new(),
                cid_by_sid: HashMap::new(),
            },
        );

        tokio::spawn(pump_events(url, evt_rx, self.hub_index_sink()));
        Ok(Some(()))
    }

    /// A cheap clone of what the event pump needs to update this registry's
    /// per-hub index without holding a reference back into `self`.
    fn hub_index_sink(&self) -> HubIndexSink {
        HubIndexSink {
            hubs: self.hubs.clone(),
            users: self.users.clone(),
            events: self.events.clone(),
        }
    }

    /// Removes and shuts down a hub session.
    pub async fn put_client(&self, url: &str) {
        if let Some((_, entry)) = self.hubs.remove(url) {
            entry.handle.disconnect().await;
        }
    }

    /// Renames a hub session's key, e.g. after a redirect, without
    /// disturbing its running worker task.
    pub fn set_client_url(&self, old_url: &str, new_url: &str) {
        if let Some((_, entry)) = self.hubs.remove(old_url) {
            self.hubs.insert(new_url.to_string(), entry);
        }
    }

    /// Initiates a peer connection to `target` (§4.F `connect()`). Prefers
    /// the hinted hub; falls back to any hub that currently hosts the CID
    /// when `allow_hub_change` permits it.
    pub async fn connect(
        &self,
        target: &HintedUser,
        token: &str,
        allow_hub_change: bool,
        _kind: ConnectKind,
        my_ip: SocketAddr,
    ) -> Result<(), ConnectError> {
        let hub_url = self
            .resolve_hub(target, allow_hub_change)
            .ok_or_else(|| ConnectError::BadState("user not found on any known hub".into()))?;

        let entry = self
            .hubs
            .get(&hub_url)
            .ok_or_else(|| ConnectError::BadState(format!("no live session for {hub_url}")))?;

        let connect_target = if entry.is_adc {
            let sid = *entry
                .sid_by_cid
                .get(&target.cid)
                .ok_or_else(|| ConnectError::BadState("CID not seen on this hub".into()))?;
            ConnectTarget::Sid(sid)
        } else {
            let nick = target
                .nmdc_nick
                .clone()
                .ok_or_else(|| ConnectError::BadState("no nick for NMDC target".into()))?;
            ConnectTarget::Nick(nick)
        };

        entry
            .handle
            .request_connect(connect_target, my_ip.ip().to_string(), token.to_string())
            .await;
        Ok(())
    }

    fn resolve_hub(&self, target: &HintedUser, allow_hub_change: bool) -> Option<String> {
        let hosts = |entry: &HubEntry| {
            (entry.is_adc && entry.sid_by_cid.contains_key(&target.cid))
                || (!entry.is_adc && target.nmdc_nick.is_some())
        };
        if let Some(hinted) = &target.hub_url {
            if let Some(entry) = self.hubs.get(hinted) {
                if hosts(&entry) {
                    return Some(hinted.clone());
                }
            }
        }
        if !allow_hub_change {
            return None;
        }
        self.hubs.iter().find(|e| hosts(e.value())).map(|e| e.key().clone())
    }

    /// Sends a chat message to `target` on whichever hub hosts them.
    pub async fn private_message(
        &self,
        target: &HintedUser,
        text: &str,
        third_person: bool,
    ) -> Result<(), ConnectError> {
        let hub_url = self
            .resolve_hub(target, true)
            .ok_or_else(|| ConnectError::BadState("user not found on any known hub".into()))?;
        let entry = self
            .hubs
            .get(&hub_url)
            .ok_or_else(|| ConnectError::BadState(format!("no live session for {hub_url}")))?;

        if entry.is_adc {
            let sid = *entry
                .sid_by_cid
                .get(&target.cid)
                .ok_or_else(|| ConnectError::BadState("CID not seen on this hub".into()))?;
            let mut msg = AdcCommand::new(crate::codec::AdcClass::Direct, crate::codec::adc::verb::MSG)
                .with_to(sid)
                .with_positional(text)
                .with_named("PM", self.own_cid.to_base32());
            if third_person {
                msg = msg.with_named("ME", "1");
            }
            entry.handle.send(crate::hub::Action::Send(msg)).await;
        } else {
            let nick = target
                .nmdc_nick
                .clone()
                .ok_or_else(|| ConnectError::BadState("no nick for NMDC target".into()))?;
            let to_nick = crate::codec::nmdc::escape(&nick);
            let from_nick = crate::codec::nmdc::escape(&entry.own_nick);
            let body = crate::codec::nmdc::escape(text);
            let marker = if third_person { "*" } else { "$" };
            let line = format!("$To: {to_nick} From: {from_nick} {marker}<{from_nick}> {body}");
            entry.handle.send(crate::hub::Action::SendNmdc(line)).await;
        }
        Ok(())
    }

    /// Serializes and, when the remote supports `SUDP` and we have key
    /// material, AES-128-CBC-encrypts `cmd` before sending it by UDP.
    ///
    /// The SUDP key is the first 16 bytes of the remote's CID, matching the
    /// convention of keying UDP search replies off the public identifier
    /// already exchanged on the hub rather than deriving a fresh secret.
    pub async fn send_udp(&self, cmd: &AdcCommand, cid: Cid, addr: SocketAddr, supports_sudp: bool) -> std::io::Result<()> {
        let plaintext = cmd.serialize();
        let payload = if supports_sudp {
            let mut key = [0u8; 16];
            key.copy_from_slice(&cid.0[..16]);
            sudp::encrypt(&key, plaintext.as_bytes())
        } else {
            plaintext.into_bytes()
        };
        self.udp.send_to(&payload, addr).await.map(|_| ())
    }

    /// Sweeps the identity table for `User`s only the registry still
    /// references and whose offline grace window has elapsed (§4.F minute
    /// timer).
    pub fn collect_garbage(&self) {
        let grace = crate::constants::USER_GRACE_WINDOW.as_secs();
        self.users.retain(|_, user| !user.is_reclaimable(grace));
    }

    #[must_use]
    pub fn own_cid(&self) -> Cid {
        self.own_cid
    }

    #[must_use]
    pub fn own_pid(&self) -> Pid {
        self.own_pid
    }
}

#[derive(Clone)]
struct HubIndexSink {
    hubs: Arc<DashMap<String, HubEntry>>,
    users: Arc<DashMap<Cid, Arc<User>>>,
    events: mpsc::Sender<HubEvent>,
}

/// Finds or creates the canonical `Arc<User>` for `cid` and registers one
/// more `OnlineUser` binding on it — the one place the crate performs the
/// "intern by CID" the data model promises (§3), since a CID can appear on
/// more than one hub. `User::new`'s baseline refcount of 1 is the
/// registry's own hold; every binding beyond that is an explicit `incref`.
fn intern(users: &DashMap<Cid, Arc<User>>, cid: Cid) -> Arc<User> {
    let user = match users.get(&cid) {
        Some(existing) => existing.clone(),
        None => {
            let user = Arc::new(User::new(cid));
            users.insert(cid, user.clone());
            user
        }
    };
    user.incref();
    user.mark_online();
    user
}

async fn pump_events(url: String, mut evt_rx: mpsc::Receiver<HubEvent>, sink: HubIndexSink) {
    while let Some(event) = evt_rx.recv().await {
        match &event {
            HubEvent::UserConnected { sid, cid } => {
                intern(&sink.users, *cid);
                if let Some(mut entry) = sink.hubs.get_mut(&url) {
                    entry.sid_by_cid.insert(*cid, *sid);
                    entry.cid_by_sid.insert(*sid, *cid);
                }
            }
            HubEvent::UserRemoved { sid } => {
                let removed_cid = sink.hubs.get_mut(&url).and_then(|mut entry| {
                    let cid = entry.cid_by_sid.remove(sid);
                    if let Some(cid) = cid {
                        entry.sid_by_cid.remove(&cid);
                    }
                    cid
                });
                if let Some(cid) = removed_cid {
                    if let Some(user) = sink.users.get(&cid) {
                        if user.decref() <= 1 {
                            user.mark_offline_now();
                        }
                    }
                }
            }
            _ => {}
        }
        if sink.events.send(event).await.is_err() {
            break;
        }
    }
    log::debug!("event pump for {url} stopped: hub worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::workers::HubCommand;

    fn cid(byte: u8) -> Cid {
        Cid([byte; crate::constants::CID_LEN])
    }

    async fn registry_no_udp() -> ClientRegistry {
        ClientRegistry {
            own_cid: cid(1),
            own_pid: Pid([1; crate::constants::CID_LEN]),
            users: Arc::new(DashMap::new()),
            hubs: Arc::new(DashMap::new()),
            udp: Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap()),
            events: mpsc::channel(1).0,
        }
    }

    fn insert_hub(reg: &ClientRegistry, url: &str, is_adc: bool, own_nick: &str) -> mpsc::Receiver<HubCommand> {
        let (handle, rx) = HubHandle::for_test();
        reg.hubs.insert(
            url.to_string(),
            HubEntry {
                handle,
                is_adc,
                own_nick: own_nick.to_string(),
                sid_by_cid: HashMap::new(),
                cid_by_sid: HashMap::new(),
            },
        );
        rx
    }

    #[test]
    fn intern_reuses_existing_user_and_increfs() {
        let users = DashMap::new();
        let a = intern(&users, cid(9));
        assert_eq!(a.refcount(), 2);
        let b = intern(&users, cid(9));
        assert_eq!(b.refcount(), 3);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn resolve_hub_prefers_hinted_hub_when_it_hosts_target() {
        let reg = registry_no_udp().await;
        let target_cid = cid(5);
        let _rx_a = insert_hub(&reg, "adc://a", true, "");
        let _rx_b = insert_hub(&reg, "adc://b", true, "");
        reg.hubs.get_mut("adc://b").unwrap().sid_by_cid.insert(target_cid, Sid(42));

        let hinted = HintedUser::adc(target_cid, "adc://b");
        assert_eq!(reg.resolve_hub(&hinted, false), Some("adc://b".to_string()));
    }

    #[tokio::test]
    async fn resolve_hub_falls_back_to_any_hosting_hub_when_allowed() {
        let reg = registry_no_udp().await;
        let target_cid = cid(6);
        let _rx_a = insert_hub(&reg, "adc://a", true, "");
        let _rx_b = insert_hub(&reg, "adc://b", true, "");
        reg.hubs.get_mut("adc://b").unwrap().sid_by_cid.insert(target_cid, Sid(7));

        let hinted = HintedUser::adc(target_cid, "adc://a");
        assert_eq!(reg.resolve_hub(&hinted, true), Some("adc://b".to_string()));
    }

    #[tokio::test]
    async fn resolve_hub_returns_none_without_hub_change() {
        let reg = registry_no_udp().await;
        let target_cid = cid(8);
        let _rx_a = insert_hub(&reg, "adc://a", true, "");
        let _rx_b = insert_hub(&reg, "adc://b", true, "");
        reg.hubs.get_mut("adc://b").unwrap().sid_by_cid.insert(target_cid, Sid(7));

        let hinted = HintedUser::adc(target_cid, "adc://a");
        assert_eq!(reg.resolve_hub(&hinted, false), None);
    }

    #[tokio::test]
    async fn private_message_nmdc_escapes_and_sends_one_frame() {
        let reg = registry_no_udp().await;
        let mut rx = insert_hub(&reg, "dchub://h", false, "me|nick");
        let target = HintedUser::nmdc(cid(3), "dchub://h", "bob");

        reg.private_message(&target, "hi|there", false).await.unwrap();

        match rx.recv().await.unwrap() {
            HubCommand::SendFrame(crate::hub::Action::SendNmdc(line)) => {
                assert!(line.starts_with("$To: bob From: me"));
                assert!(!line.contains('|'));
                assert!(!line.ends_with('|'));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}

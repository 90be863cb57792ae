//! Legacy NMDC hub session core (§4.D, SPEC_FULL §10.5). Lighter than its
//! ADC counterpart: NMDC has no SIDs, so users are keyed by nick, and the
//! only framing mode is line-based (no zpipe, no binary blom transfer).

use std::collections::HashMap;

use crate::codec::nmdc::{self, ClientTag, MyInfo, NmdcConnMode};
use crate::hub::adc_session::{Action, ConnectRequest, LocalConnectivity, LocalIdentity};
use crate::hub::events::HubEvent;
use crate::hub::state::HubState;
use crate::identity::{ConnectMode, Identity};

/// The NMDC hub session's in-memory state.
pub struct NmdcHubSession {
    pub url: String,
    pub state: HubState,
    pub nick: String,
    password: Option<String>,
    pub identities: HashMap<String, Identity>,
    pub connectivity: LocalConnectivity,
    local_port: u16,
    local_identity: LocalIdentity,
}

impl NmdcHubSession {
    #[must_use]
    pub fn new(url: String, nick: String, password: Option<String>) -> Self {
        Self {
            url,
            state: HubState::Disconnected,
            nick,
            password,
            identities: HashMap::new(),
            connectivity: LocalConnectivity::default(),
            local_port: 0,
            local_identity: LocalIdentity::default(),
        }
    }

    /// Installs the `Config`-derived identity fields used to build our own
    /// `$MyINFO` on `$Hello` (§6 "canonical emission every NMDC client must
    /// send").
    pub fn set_local_identity(&mut self, identity: LocalIdentity) {
        self.local_identity = identity;
    }

    /// Builds the `$MyINFO` this client advertises for itself.
    fn own_my_info(&self) -> MyInfo {
        let li = &self.local_identity;
        MyInfo {
            nick: self.nick.clone(),
            description: li.description.clone(),
            tag: Some(ClientTag {
                client: "adcore".to_string(),
                version: li.version.clone(),
                mode: if self.connectivity.active_v4 || self.connectivity.active_v6 {
                    NmdcConnMode::Active
                } else {
                    NmdcConnMode::Passive
                },
                hubs: (li.hubs_normal, li.hubs_registered, li.hubs_op),
                slots: li.upload_slots,
            }),
            connection: "100".to_string(),
            flag_byte: 0x01,
            email: li.email.clone(),
            share_size: li.share_size,
        }
    }

    pub fn on_socket_connected(&mut self) -> Vec<Action> {
        self.state = HubState::Protocol;
        Vec::new()
    }

    /// Records the peer listener's bound plain-TCP port, used in any
    /// `$ConnectToMe` we send.
    pub fn set_local_port(&mut self, port: u16) {
        self.local_port = port;
    }

    /// Initiates a peer connection to `target_nick` (§4.F `connect()`):
    /// `$ConnectToMe` if we're reachable, `$RevConnectToMe` otherwise.
    pub fn request_connect(&mut self, target_nick: &str, my_ip: &str, token: &str) -> Vec<Action> {
        let we_are_active = self.connectivity.active_v4 || self.connectivity.active_v6;
        if we_are_active {
            return vec![
                Action::SendNmdc(format!(
                    "$ConnectToMe {target_nick} {my_ip}:{port}",
                    port = self.local_port
                )),
                Action::Connect(ConnectRequest {
                    remote_sid: crate::identity::Sid::HUB,
                    protocol: "NMDC".to_string(),
                    port: 0,
                    token: token.to_string(),
                    secure: false,
                    nat_role: None,
                }),
            ];
        }
        if self
            .identities
            .get(target_nick)
            .is_some_and(|i| i.connect_mode == ConnectMode::ActiveV4)
        {
            return vec![Action::SendNmdc(format!(
                "$RevConnectToMe {} {target_nick}",
                self.nick
            ))];
        }
        vec![Action::Event(HubEvent::StatusMessage(
            "cannot connect: no shared reachable IP family".into(),
        ))]
    }

    /// Dispatches one stripped, unescaped NMDC line (without the trailing `|`).
    pub fn handle(&mut self, line: &str) -> Vec<Action> {
        let Ok((verb, payload)) = nmdc::split_command(line) else {
            return vec![Action::Event(HubEvent::StatusMessage(
                nmdc::unescape(line),
            ))];
        };
        match verb {
            "Lock" => self.handle_lock(payload),
            "HubName" => vec![Action::Event(HubEvent::HubUpdated)],
            "GetPass" => self.handle_getpass(),
            "BadPass" => vec![Action::Event(HubEvent::StatusMessage(
                "hub rejected password".into(),
            )), Action::Disconnect],
            "Hello" => self.handle_hello(payload),
            "MyINFO" => self.handle_myinfo(payload),
            "Quit" => self.handle_quit(payload),
            "ConnectToMe" => self.handle_connect_to_me(payload),
            "RevConnectToMe" => self.handle_rev_connect_to_me(payload),
            "Search" => vec![Action::Event(HubEvent::StatusMessage(format!(
                "search: {payload}"
            )))],
            "SR" => vec![Action::Event(HubEvent::StatusMessage(format!(
                "search result: {payload}"
            )))],
            "ForceMove" => vec![Action::Event(HubEvent::StatusMessage(format!(
                "redirected to {payload}"
            ))), Action::Disconnect],
            "To:" => vec![Action::Event(HubEvent::StatusMessage(
                nmdc::unescape(payload),
            ))],
            _ => vec![Action::Event(HubEvent::StatusMessage(format!(
                "${verb} {payload}"
            )))],
        }
    }

    fn handle_lock(&mut self, payload: &str) -> Vec<Action> {
        let lock = payload.split(' ').next().unwrap_or(payload);
        let key = lock_to_key(lock.as_bytes());
        self.state = HubState::Protocol;
        vec![
            Action::SendNmdc(format!("$Key {}", escape_key(&key))),
            Action::SendNmdc(format!("$ValidateNick {}", self.nick)),
        ]
    }

    fn handle_getpass(&mut self) -> Vec<Action> {
        self.state = HubState::Verify;
        match &self.password {
            Some(pw) => vec![Action::SendNmdc(format!("$MyPass {pw}"))],
            None => vec![Action::Event(HubEvent::StatusMessage(
                "hub requires a password we don't have".into(),
            )), Action::Disconnect],
        }
    }

    fn handle_hello(&mut self, payload: &str) -> Vec<Action> {
        if payload.trim() != self.nick {
            return Vec::new();
        }
        self.state = HubState::Normal;
        vec![
            Action::SendNmdc("$Version 1,0091".to_string()),
            Action::SendNmdc(format!("$MyINFO {}", nmdc::format_my_info(&self.own_my_info()))),
            Action::Event(HubEvent::StatusMessage(format!(
                "connected to {} as {}",
                self.url, self.nick
            ))),
        ]
    }

    fn handle_myinfo(&mut self, payload: &str) -> Vec<Action> {
        let Ok(info) = nmdc::parse_my_info(payload) else {
            return Vec::new();
        };
        let nick = info.nick.clone();
        let identity = self.identities.entry(nick.clone()).or_default();
        apply_my_info(identity, &info);

        if nick == self.nick {
            identity.connect_mode = ConnectMode::Me;
        } else {
            identity.connect_mode = classify(identity, &self.connectivity);
        }

        vec![Action::Event(HubEvent::StatusMessage(format!(
            "MyINFO from {nick}"
        )))]
    }

    fn handle_quit(&mut self, payload: &str) -> Vec<Action> {
        let nick = payload.trim();
        self.identities.remove(nick);
        if nick == self.nick {
            return vec![Action::Disconnect];
        }
        Vec::new()
    }

    fn handle_connect_to_me(&mut self, payload: &str) -> Vec<Action> {
        let mut parts = payload.splitn(2, ' ');
        let Some(target) = parts.next() else { return Vec::new() };
        if target != self.nick {
            return Vec::new();
        }
        let Some(addr) = parts.next() else { return Vec::new() };
        let Some((_, port_str)) = addr.rsplit_once(':') else {
            return Vec::new();
        };
        let Ok(port) = port_str.parse() else { return Vec::new() };
        vec![Action::Connect(ConnectRequest {
            remote_sid: crate::identity::Sid::HUB,
            protocol: "NMDC".to_string(),
            port,
            token: String::new(),
            secure: false,
            nat_role: None,
        })]
    }

    fn handle_rev_connect_to_me(&mut self, payload: &str) -> Vec<Action> {
        let mut parts = payload.split(' ');
        let Some(_seeker) = parts.next() else { return Vec::new() };
        let Some(_target) = parts.next() else { return Vec::new() };
        if !(self.connectivity.active_v4 || self.connectivity.active_v6) {
            return Vec::new();
        }
        vec![Action::Event(HubEvent::StatusMessage(
            "answering RevConnectToMe as active".into(),
        ))]
    }
}

fn apply_my_info(identity: &mut Identity, info: &MyInfo) {
    identity.set("NI", info.nick.clone());
    identity.set("DE", info.description.clone());
    identity.share_bytes = info.share_size;
    if let Some(ClientTag { slots, mode, .. }) = &info.tag {
        identity.slots = *slots;
        identity.supports = match mode {
            NmdcConnMode::Active => vec!["TCP4".to_string()],
            NmdcConnMode::Passive | NmdcConnMode::Socks5 => Vec::new(),
        };
    }
}

fn classify(identity: &Identity, connectivity: &LocalConnectivity) -> ConnectMode {
    if identity.supports("TCP4") {
        return ConnectMode::ActiveV4;
    }
    if connectivity.active_v4 {
        return ConnectMode::PassiveV4;
    }
    ConnectMode::NoConnectPassive
}

/// The classic NMDC `Lock`-to-`Key` transform.
fn lock_to_key(lock: &[u8]) -> Vec<u8> {
    if lock.len() < 3 {
        return Vec::new();
    }
    let n = lock.len();
    let mut key = vec![0u8; n];
    key[0] = lock[0] ^ lock[n - 1] ^ lock[n - 2] ^ 5;
    for i in 1..n {
        key[i] = lock[i] ^ lock[i - 1];
    }
    for b in &mut key {
        *b = (*b << 4) | (*b >> 4);
    }
    key
}

/// Escapes the handful of bytes the `$Key` line can't carry literally, as
/// `/%DCNnnn%/` with `nnn` the decimal value.
fn escape_key(key: &[u8]) -> String {
    let mut out = String::with_capacity(key.len());
    for &b in key {
        match b {
            0 | 5 | 36 | 96 | 124 | 126 => out.push_str(&format!("/%DCN{b:03}%/")),
            _ => out.push(b as char),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_to_key_preserves_length_and_is_deterministic() {
        let lock = b"EXTENDEDPROTOCOLABCABCABCABCABCABC";
        let key1 = lock_to_key(lock);
        let key2 = lock_to_key(lock);
        assert_eq!(key1.len(), lock.len());
        assert_eq!(key1, key2);
    }

    #[test]
    fn hello_for_self_moves_to_normal() {
        let mut s = NmdcHubSession::new("nmdc://hub".into(), "bob".into(), None);
        s.state = HubState::Protocol;
        let actions = s.handle("$Hello bob");
        assert_eq!(s.state, HubState::Normal);
        assert!(!actions.is_empty());
    }

    #[test]
    fn hello_for_other_nick_is_ignored() {
        let mut s = NmdcHubSession::new("nmdc://hub".into(), "bob".into(), None);
        s.state = HubState::Protocol;
        let actions = s.handle("$Hello alice");
        assert_ne!(s.state, HubState::Normal);
        assert!(actions.is_empty());
    }

    #[test]
    fn myinfo_updates_identity_table() {
        let mut s = NmdcHubSession::new("nmdc://hub".into(), "bob".into(), None);
        s.handle("$MyINFO $ALL alice hi<ApexDC V:1.0,M:A,H:1/0/0,S:3>$ $\x03$$500$");
        let identity = s.identities.get("alice").unwrap();
        assert_eq!(identity.slots, 3);
        assert_eq!(identity.connect_mode, ConnectMode::ActiveV4);
    }

    #[test]
    fn quit_for_self_disconnects() {
        let mut s = NmdcHubSession::new("nmdc://hub".into(), "bob".into(), None);
        let actions = s.handle("$Quit bob");
        assert!(actions.iter().any(|a| matches!(a, Action::Disconnect)));
    }

    #[test]
    fn request_connect_sends_connecttome_when_active() {
        let mut s = NmdcHubSession::new("nmdc://hub".into(), "bob".into(), None);
        s.connectivity.active_v4 = true;
        s.set_local_port(3000);
        let actions = s.request_connect("alice", "1.2.3.4", "tok");
        assert!(actions.iter().any(|a| matches!(a, Action::SendNmdc(line) if line.starts_with("$ConnectToMe alice 1.2.3.4:3000"))));
    }

    #[test]
    fn request_connect_sends_revconnecttome_when_remote_active_and_we_are_not() {
        let mut s = NmdcHubSession::new("nmdc://hub".into(), "bob".into(), None);
        s.handle("$MyINFO $ALL alice hi<ApexDC V:1.0,M:A,H:1/0/0,S:3>$ $\x03$$500$");
        let actions = s.request_connect("alice", "1.2.3.4", "tok");
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::SendNmdc(line) if line == "$RevConnectToMe bob alice")));
    }

    #[test]
    fn getpass_without_password_disconnects() {
        let mut s = NmdcHubSession::new("nmdc://hub".into(), "bob".into(), None);
        let actions = s.handle("$GetPass");
        assert!(actions.iter().any(|a| matches!(a, Action::Disconnect)));
    }
}

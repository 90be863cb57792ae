//! Peer connection handshake state machines (§4.G):
//!
//! ```text
//! CONNECT → SUPNICK → (ADC:) INF → KEY ↔ (NMDC:) LOCK → DIRECTION → KEY
//!   → IDLE (upload) | ACTIVE download
//! ```
//!
//! Both reducers are pure, mirroring the hub session reducers: no socket
//! access, just `(state, input) -> actions`. The surrounding connection
//! worker drives a [`crate::socket::BufferedSocket`] against them.

use crate::identity::Cid;

/// A side effect the handshake reducer wants performed.
#[derive(Debug, Clone)]
pub enum PeerAction {
    SendAdc(crate::codec::AdcCommand),
    SendNmdc(String),
    /// The handshake resolved: we're either ready to request data (download)
    /// or ready to serve it (upload/idle).
    Resolved(Role),
    Disconnect(String),
}

/// Which side of the transfer this connection settled into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Download,
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdcState {
    Connect,
    Supnick,
    Inf,
    Done,
}

/// Outgoing ADC peer handshake (we dialed, or we're answering a `CTM`).
pub struct AdcPeerHandshake {
    state: AdcState,
    incoming: bool,
    token: String,
    hub_url: String,
    own_cid: Cid,
    pub remote_cid: Option<Cid>,
    pub private_message: bool,
}

impl AdcPeerHandshake {
    #[must_use]
    pub fn new(incoming: bool, token: String, hub_url: String, own_cid: Cid) -> Self {
        Self {
            state: AdcState::Connect,
            incoming,
            token,
            hub_url,
            own_cid,
            remote_cid: None,
            private_message: false,
        }
    }

    /// Called once the socket connects; starts with `SUP` for either side.
    pub fn on_connected(&mut self) -> Vec<PeerAction> {
        self.state = AdcState::Supnick;
        vec![PeerAction::SendAdc(sup_command())]
    }

    pub fn handle(&mut self, cmd: &crate::codec::AdcCommand) -> Vec<PeerAction> {
        use crate::codec::adc::verb;
        match (self.state, cmd.verb) {
            (AdcState::Supnick, v) if v == verb::SUP => self.handle_sup(),
            (AdcState::Inf, v) if v == verb::INF => self.handle_inf(cmd),
            _ => vec![PeerAction::Disconnect(format!(
                "unexpected {} in state {:?}",
                cmd.verb.as_str(),
                self.state
            ))],
        }
    }

    fn handle_sup(&mut self) -> Vec<PeerAction> {
        self.state = AdcState::Inf;
        if self.incoming {
            vec![PeerAction::SendAdc(sup_command())]
        } else {
            vec![PeerAction::SendAdc(self.inf_command())]
        }
    }

    fn handle_inf(&mut self, cmd: &crate::codec::AdcCommand) -> Vec<PeerAction> {
        let Some(remote_cid) = cmd.get_named("ID").and_then(|s| Cid::parse(s).ok()) else {
            return vec![PeerAction::Disconnect("INF missing ID".into())];
        };
        self.remote_cid = Some(remote_cid);
        self.private_message = cmd.get_named("PM") == Some("1");

        let mut actions = Vec::new();
        if self.incoming {
            actions.push(PeerAction::SendAdc(self.inf_command()));
        }
        self.state = AdcState::Done;
        let role = if self.incoming { Role::Upload } else { Role::Download };
        actions.push(PeerAction::Resolved(role));
        actions
    }

    fn inf_command(&self) -> crate::codec::AdcCommand {
        use crate::codec::{adc::verb, AdcClass, AdcCommand};
        let mut cmd = AdcCommand::new(AdcClass::Client, verb::INF).with_named("ID", self.own_cid.to_base32());
        if !self.incoming {
            cmd = cmd.with_named("TO", &self.token);
        }
        if self.private_message {
            cmd = cmd.with_named("PM", "1");
        }
        cmd
    }

    #[must_use]
    pub fn hub_url(&self) -> &str {
        &self.hub_url
    }
}

fn sup_command() -> crate::codec::AdcCommand {
    use crate::codec::{adc::verb, AdcClass, AdcCommand};
    AdcCommand::new(AdcClass::Client, verb::SUP)
        .with_positional("ADBASE")
        .with_positional("ADTIGR")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NmdcState {
    Connect,
    Lock,
    Direction,
    Done,
}

/// NMDC peer handshake: `$MyNick`/`$Lock` ↔ `$Key`, then `$Direction`
/// priority resolution (ConnectionManager::on(Direction...) in the original
/// client — highest random number wins the download side; a tie
/// disconnects both).
pub struct NmdcPeerHandshake {
    state: NmdcState,
    incoming: bool,
    own_nick: String,
    wants_download: bool,
    our_number: u32,
    their_number: Option<u32>,
}

impl NmdcPeerHandshake {
    #[must_use]
    pub fn new(incoming: bool, own_nick: String, wants_download: bool, our_number: u32) -> Self {
        Self {
            state: NmdcState::Connect,
            incoming,
            own_nick,
            wants_download,
            our_number,
            their_number: None,
        }
    }

    pub fn on_connected(&mut self) -> Vec<PeerAction> {
        self.state = NmdcState::Lock;
        vec![
            PeerAction::SendNmdc(format!("$MyNick {}", self.own_nick)),
            PeerAction::SendNmdc("$Lock EXTENDEDPROTOCOLABCABCABCABCABCABC Pk=adcore".to_string()),
        ]
    }

    pub fn handle(&mut self, verb: &str, payload: &str) -> Vec<PeerAction> {
        match (self.state, verb) {
            (NmdcState::Lock, "Lock") => self.handle_lock(payload),
            (NmdcState::Direction, "Direction") => self.handle_direction(payload),
            (NmdcState::Direction, "Key") => Vec::new(),
            _ => vec![PeerAction::Disconnect(format!("unexpected ${verb} in state {:?}", self.state))],
        }
    }

    fn handle_lock(&mut self, payload: &str) -> Vec<PeerAction> {
        let lock = payload.split(' ').next().unwrap_or(payload);
        let key = lock_to_key(lock.as_bytes());
        self.state = NmdcState::Direction;
        let dir = if self.wants_download { "Download" } else { "Upload" };
        vec![
            PeerAction::SendNmdc(format!("${dir} {}", self.our_number)),
            PeerAction::SendNmdc(format!("$Key {}", escape_key(&key))),
        ]
    }

    fn handle_direction(&mut self, payload: &str) -> Vec<PeerAction> {
        let mut parts = payload.splitn(2, ' ');
        let their_dir = parts.next().unwrap_or("");
        let their_number: u32 = parts.next().and_then(|n| n.parse().ok()).unwrap_or(0);
        self.their_number = Some(their_number);

        match resolve_direction(self.wants_download, self.our_number, their_dir, their_number) {
            Ok(role) => {
                self.state = NmdcState::Done;
                vec![PeerAction::Resolved(role)]
            }
            Err(DirectionConflict::BothWantUpload) => {
                vec![PeerAction::Disconnect("both sides offered to upload".into())]
            }
            Err(DirectionConflict::Tie) => {
                vec![PeerAction::Disconnect("direction resolution tied".into())]
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirectionConflict {
    BothWantUpload,
    Tie,
}

/// Resolves which side uploads given both sides' declared intent (§ grounded
/// on the original client's `onDirection`): if the remote says `Upload`,
/// we're fine downloading (unless we also offered to upload). If both say
/// `Download`, the higher random number wins download; an exact tie
/// disconnects both sides.
fn resolve_direction(
    we_want_download: bool,
    our_number: u32,
    their_dir: &str,
    their_number: u32,
) -> Result<Role, DirectionConflict> {
    if their_dir == "Upload" {
        if !we_want_download {
            return Err(DirectionConflict::BothWantUpload);
        }
        return Ok(Role::Download);
    }
    if !we_want_download {
        return Ok(Role::Upload);
    }
    match our_number.cmp(&their_number) {
        std::cmp::Ordering::Greater => Ok(Role::Download),
        std::cmp::Ordering::Less => Ok(Role::Upload),
        std::cmp::Ordering::Equal => Err(DirectionConflict::Tie),
    }
}

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
    use crate::constants::CID_LEN;

    fn cid(b: u8) -> Cid {
        Cid([b; CID_LEN])
    }

    #[test]
    fn outgoing_adc_handshake_sends_sup_then_inf_with_token() {
        let mut h = AdcPeerHandshake::new(false, "tok1".into(), "adc://hub".into(), cid(1));
        let actions = h.on_connected();
        assert!(matches!(&actions[0], PeerAction::SendAdc(cmd) if cmd.verb == crate::codec::adc::verb::SUP));

        let remote_sup = crate::codec::AdcCommand::new(crate::codec::AdcClass::Client, crate::codec::adc::verb::SUP)
            .with_positional("ADBASE")
            .with_positional("ADTIGR");
        let actions = h.handle(&remote_sup);
        match &actions[0] {
            PeerAction::SendAdc(cmd) => {
                assert_eq!(cmd.verb, crate::codec::adc::verb::INF);
                assert_eq!(cmd.get_named("ID"), Some(cid(1).to_base32().as_str()));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn incoming_adc_handshake_resolves_to_upload() {
        let mut h = AdcPeerHandshake::new(true, String::new(), "adc://hub".into(), cid(1));
        let _ = h.on_connected();
        let remote_sup = crate::codec::AdcCommand::new(crate::codec::AdcClass::Client, crate::codec::adc::verb::SUP)
            .with_positional("ADBASE")
            .with_positional("ADTIGR");
        let _ = h.handle(&remote_sup);

        let remote_inf = crate::codec::AdcCommand::new(crate::codec::AdcClass::Client, crate::codec::adc::verb::INF)
            .with_named("ID", cid(2).to_base32());
        let actions = h.handle(&remote_inf);
        assert!(actions.iter().any(|a| matches!(a, PeerAction::Resolved(Role::Upload))));
        assert_eq!(h.remote_cid, Some(cid(2)));
    }

    #[test]
    fn nmdc_higher_number_wins_download() {
        assert_eq!(resolve_direction(true, 500, "Download", 100), Ok(Role::Download));
        assert_eq!(resolve_direction(true, 100, "Download", 500), Ok(Role::Upload));
    }

    #[test]
    fn nmdc_tie_is_a_conflict() {
        assert_eq!(resolve_direction(true, 100, "Download", 100), Err(DirectionConflict::Tie));
    }

    #[test]
    fn nmdc_remote_upload_means_we_download() {
        assert_eq!(resolve_direction(true, 1, "Upload", 999), Ok(Role::Download));
    }

    #[test]
    fn nmdc_both_offering_upload_conflicts() {
        assert_eq!(resolve_direction(false, 1, "Upload", 999), Err(DirectionConflict::BothWantUpload));
    }

    #[test]
    fn lock_to_key_is_deterministic() {
        let lock = b"EXTENDEDPROTOCOLABCABCABCABCABCABC";
        assert_eq!(lock_to_key(lock), lock_to_key(lock));
    }
}

//! ADC hub session core (§4.D): a pure reducer from `(state, AdcCommand) ->
//! actions`. Kept free of I/O so the state machine, INF diffing, and
//! connect-mode classification are unit-testable without a socket; the
//! surrounding `workers.rs` task drives a `BufferedSocket` and feeds it
//! frames.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use crate::codec::adc::verb;
use crate::codec::{AdcClass, AdcCommand};
use crate::hub::bloom::{self, BloomParams};
use crate::hub::events::{HubEvent, Severity, Status, UserCommandKind};
use crate::hub::outbox::{ForbiddenCommands, OwnSidStamp};
use crate::hub::search::{FloodGate, OutboundSearchQueue};
use crate::hub::state::HubState;
use crate::identity::{Cid, ConnectMode, Identity, Pid, Sid, User};

/// A side effect the reducer wants performed: a frame to send, an event to
/// surface, a framing-mode change, or a handoff to the peer connection
/// manager.
#[derive(Debug)]
pub enum Action {
    Send(AdcCommand),
    /// A raw NMDC line to send, without the `$`/`|` framing (added by the
    /// worker loop's NMDC writer).
    SendNmdc(String),
    Event(HubEvent),
    EnableZpipe,
    DisableZpipe,
    ExpectBinary(usize),
    SendBinary(Vec<u8>),
    Connect(ConnectRequest),
    Disconnect,
}

/// Which side should dial for a negotiated peer connection, and with what
/// parameters (§4.D CTM/RCM/NAT/RNT).
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub remote_sid: Sid,
    pub protocol: String,
    pub port: u16,
    pub token: String,
    pub secure: bool,
    pub nat_role: Option<NatRole>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatRole {
    Client,
    Server,
}

/// Local connectivity facts the reducer needs to classify remote users and
/// answer CTM/RCM without reaching into the connectivity manager directly.
#[derive(Debug, Clone, Default)]
pub struct LocalConnectivity {
    pub active_v4: bool,
    pub active_v6: bool,
    pub supports_nat0: bool,
}

/// Own-identity fields advertised on the first outbound `INF` (§4.D
/// "Required keys on first INF"). Built by the caller from `Config` (plus
/// whatever the share/connectivity collaborators report) and installed via
/// [`AdcHubSession::set_local_identity`] before the session is driven;
/// `ID`/`PD` are handled separately since they come from the session's own
/// CID/PID rather than this bag.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub nick: String,
    pub description: String,
    pub version: String,
    pub email: String,
    pub upload_slots: u32,
    pub free_slots: u32,
    pub share_size: u64,
    pub share_files: u64,
    pub hubs_normal: u32,
    pub hubs_registered: u32,
    pub hubs_op: u32,
    pub supports: Vec<String>,
    pub download_speed_bps: u64,
    pub upload_speed_bps: u64,
    pub keyprint: Option<String>,
    pub ip4: Option<String>,
    pub ip6: Option<String>,
    pub udp4_port: Option<u16>,
    pub udp6_port: Option<u16>,
}

impl Default for LocalIdentity {
    fn default() -> Self {
        Self {
            nick: String::new(),
            description: String::new(),
            version: format!("adcore {}", env!("CARGO_PKG_VERSION")),
            email: String::new(),
            upload_slots: 0,
            free_slots: 0,
            share_size: 0,
            share_files: 0,
            hubs_normal: 1,
            hubs_registered: 0,
            hubs_op: 0,
            supports: vec!["SEGA".into(), "NAT0".into(), "ASCH".into()],
            download_speed_bps: 0,
            upload_speed_bps: 0,
            keyprint: None,
            ip4: None,
            ip6: None,
            udp4_port: None,
            udp6_port: None,
        }
    }
}

/// The ADC hub session's full in-memory state (§3 `Client`).
pub struct AdcHubSession {
    pub url: String,
    pub state: HubState,
    pub own_sid: Sid,
    pub own_cid: Option<Cid>,
    own_pid: Option<Pid>,
    salt: Option<Vec<u8>>,
    pub users: HashMap<Sid, Arc<User>>,
    pub identities: HashMap<Sid, Identity>,
    cid_index: HashMap<Cid, Sid>,
    forbidden: Arc<parking_lot::Mutex<ForbiddenCommands>>,
    own_sid_stamp: OwnSidStamp,
    pub remote_supports: HashSet<String>,
    last_info: HashMap<String, String>,
    flood_gate: FloodGate,
    pub search_queue: OutboundSearchQueue,
    pub available_bytes: u64,
    pub auto_reconnect: bool,
    local_file_count: u64,
    pub connectivity: LocalConnectivity,
    local_port: u16,
    local_identity: LocalIdentity,
}

impl AdcHubSession {
    #[must_use]
    pub fn new(url: String, cid: Cid, pid: Pid) -> Self {
        Self {
            url,
            state: HubState::Disconnected,
            own_sid: Sid::HUB,
            own_cid: Some(cid),
            own_pid: Some(pid),
            salt: None,
            users: HashMap::new(),
            identities: HashMap::new(),
            cid_index: HashMap::new(),
            forbidden: Arc::new(parking_lot::Mutex::new(ForbiddenCommands::new())),
            own_sid_stamp: OwnSidStamp::new(),
            remote_supports: HashSet::new(),
            last_info: HashMap::new(),
            flood_gate: FloodGate::new(),
            search_queue: OutboundSearchQueue::default_interval(),
            available_bytes: 0,
            auto_reconnect: true,
            local_file_count: 0,
            connectivity: LocalConnectivity::default(),
            local_port: 0,
            local_identity: LocalIdentity::default(),
        }
    }

    /// Records the peer listener's bound plain-TCP port, used as the `port`
    /// argument of any `CTM` we send (§4.G listeners own the actual bind).
    pub fn set_local_port(&mut self, port: u16) {
        self.local_port = port;
    }

    /// Installs the `Config`-derived identity fields sent on the first
    /// outbound `INF` (§4.D). Must be called before `ISID` arrives; a
    /// session driven without this sends only `ID`/`PD`, which is only
    /// correct for tests that don't care about the rest of the bag.
    pub fn set_local_identity(&mut self, identity: LocalIdentity) {
        self.local_identity = identity;
    }

    /// Shared forbidden-verb tracker, installed into the outbound hook
    /// chain by `lifecycle::connect` so every outbound frame is filtered
    /// consistently with what this reducer has itself observed.
    #[must_use]
    pub fn forbidden_commands(&self) -> Arc<parking_lot::Mutex<ForbiddenCommands>> {
        self.forbidden.clone()
    }

    /// Shared own-SID stamp, installed into the outbound hook chain so
    /// externally-built frames (registry-initiated `MSG`/`CTM` sends) get
    /// `FROM` filled in the same way the reducer's own sends do.
    #[must_use]
    pub fn own_sid_stamp(&self) -> OwnSidStamp {
        self.own_sid_stamp.clone()
    }

    /// Transition on the transport becoming connected: send our `SUP`.
    pub fn on_socket_connected(&mut self) -> Vec<Action> {
        self.state = HubState::Protocol;
        let mut sup = AdcCommand::new(AdcClass::Hub, verb::SUP);
        for feat in ["BAS0", "BASE", "TIGR", "UCM0", "BLO0", "ZLIF", "HBRI"] {
            sup = sup.with_named("AD", feat);
        }
        vec![Action::Send(sup)]
    }

    /// Dispatches one parsed inbound ADC command, returning the actions the
    /// caller should perform.
    pub fn handle(&mut self, cmd: AdcCommand) -> Vec<Action> {
        match cmd.verb {
            v if v == verb::SUP => self.handle_sup(&cmd),
            v if v == verb::SID => self.handle_sid(&cmd),
            v if v == verb::INF => self.handle_inf(&cmd),
            v if v == verb::GPA => self.handle_gpa(&cmd),
            v if v == verb::MSG => self.handle_msg(&cmd),
            v if v == verb::QUI => self.handle_qui(&cmd),
            v if v == verb::STA => self.handle_sta(&cmd),
            v if v == verb::SCH => self.handle_sch(&cmd),
            v if v == verb::RES => self.handle_res(&cmd),
            v if v == verb::CTM => self.handle_ctm(&cmd),
            v if v == verb::RCM => self.handle_rcm(&cmd),
            v if v == verb::NAT => self.handle_nat(&cmd),
            v if v == verb::RNT => self.handle_rnt(&cmd),
            v if v == verb::ZON => vec![Action::EnableZpipe],
            v if v == verb::ZOF => vec![Action::DisableZpipe],
            v if v == verb::GET => self.handle_get(&cmd),
            v if v == verb::CMD => self.handle_cmd(&cmd),
            _ => vec![Action::Event(HubEvent::StatusMessage(format!(
                "unhandled verb {}",
                cmd.verb.as_str()
            )))],
        }
    }

    fn handle_sup(&mut self, cmd: &AdcCommand) -> Vec<Action> {
        for add in cmd.get_named_all("AD") {
            self.remote_supports.insert(add.to_string());
        }
        for rm in cmd.get_named_all("RM") {
            self.remote_supports.remove(rm);
        }
        if self.state == HubState::Protocol
            && !(self.remote_supports.contains("BASE") || self.remote_supports.contains("BAS0"))
        {
            return vec![
                Action::Event(HubEvent::StatusMessage(
                    "hub did not advertise BASE/BAS0, disconnecting".into(),
                )),
                Action::Disconnect,
            ];
        }
        if !self.remote_supports.contains("TIGR") {
            return vec![Action::Event(HubEvent::StatusMessage(
                "hub lacks TIGR, falling back to legacy password hashing".into(),
            ))];
        }
        Vec::new()
    }

    fn handle_sid(&mut self, cmd: &AdcCommand) -> Vec<Action> {
        let Some(sid_str) = cmd.positional(0) else {
            return vec![Action::Event(HubEvent::StatusMessage("ISID missing SID".into()))];
        };
        let Ok(sid) = Sid::parse(sid_str) else {
            return vec![Action::Event(HubEvent::StatusMessage("ISID bad SID".into()))];
        };
        self.own_sid = sid;
        self.own_sid_stamp.set(sid);
        self.state = HubState::Identify;

        let mut inf = AdcCommand::new(AdcClass::Broadcast, verb::INF).with_from(self.own_sid);
        if let Some(cid) = self.own_cid {
            inf = self.diff_named(inf, "ID", &cid.to_base32());
        }
        if let Some(pid) = self.own_pid.take() {
            inf = inf.with_named("PD", pid.to_base32());
        }

        let li = self.local_identity.clone();
        inf = self.diff_named(inf, "NI", &li.nick);
        inf = self.diff_named(inf, "DE", &li.description);
        inf = self.diff_named(inf, "VE", &li.version);
        inf = self.diff_named(inf, "SL", &li.upload_slots.to_string());
        inf = self.diff_named(inf, "FS", &li.free_slots.to_string());
        inf = self.diff_named(inf, "SS", &li.share_size.to_string());
        inf = self.diff_named(inf, "SF", &li.share_files.to_string());
        inf = self.diff_named(inf, "EM", &li.email);
        inf = self.diff_named(inf, "HN", &li.hubs_normal.to_string());
        inf = self.diff_named(inf, "HR", &li.hubs_registered.to_string());
        inf = self.diff_named(inf, "HO", &li.hubs_op.to_string());
        inf = self.diff_named(inf, "SU", &li.supports.join(","));
        inf = self.diff_named(inf, "DS", &li.download_speed_bps.to_string());
        inf = self.diff_named(inf, "US", &li.upload_speed_bps.to_string());
        if let Some(kp) = &li.keyprint {
            inf = self.diff_named(inf, "KP", kp);
        }
        if let Some(ip4) = &li.ip4 {
            inf = self.diff_named(inf, "I4", ip4);
        }
        if let Some(ip6) = &li.ip6 {
            inf = self.diff_named(inf, "I6", ip6);
        }
        if let Some(port) = li.udp4_port {
            inf = self.diff_named(inf, "U4", &port.to_string());
        }
        if let Some(port) = li.udp6_port {
            inf = self.diff_named(inf, "U6", &port.to_string());
        }

        vec![Action::Send(inf)]
    }

    /// Appends a named field only if it differs from the last value we sent
    /// under that key (delta-INF diffing, §4.D).
    fn diff_named(&mut self, cmd: AdcCommand, key: &str, value: &str) -> AdcCommand {
        if self.last_info.get(key).map(String::as_str) == Some(value) {
            return cmd;
        }
        self.last_info.insert(key.to_string(), value.to_string());
        cmd.with_named(key, value)
    }

    fn handle_inf(&mut self, cmd: &AdcCommand) -> Vec<Action> {
        let Some(sid) = cmd.from else {
            return vec![Action::Event(HubEvent::StatusMessage("INF missing FROM".into()))];
        };

        if let Some(cid_str) = cmd.get_named("ID") {
            if let Ok(cid) = Cid::parse(cid_str) {
                if let Some(&existing_sid) = self.cid_index.get(&cid) {
                    if existing_sid != sid {
                        return vec![Action::Event(HubEvent::StatusMessage(
                            "dropping INF: same CID, different SID".into(),
                        ))];
                    }
                }
                self.cid_index.insert(cid, sid);
            }
        }

        let user = self
            .users
            .entry(sid)
            .or_insert_with(|| {
                let cid = cmd
                    .get_named("ID")
                    .and_then(|s| Cid::parse(s).ok())
                    .unwrap_or_else(|| Cid([0u8; crate::constants::CID_LEN]));
                Arc::new(User::new(cid))
            })
            .clone();
        let identity = self.identities.entry(sid).or_default();

        let mut changed_su = false;
        let mut changed_i4 = false;
        let mut changed_i6 = false;

        for param in &cmd.params {
            if param.len() < 2 {
                continue;
            }
            let (key, value) = param.split_at(2);
            match key {
                "SS" => {
                    let new_val: u64 = value.parse().unwrap_or(0);
                    self.available_bytes = self
                        .available_bytes
                        .saturating_sub(identity.share_bytes)
                        .saturating_add(new_val);
                    identity.share_bytes = new_val;
                }
                "SU" => {
                    identity.supports = value.split(',').map(str::to_string).collect();
                    changed_su = true;
                }
                "I4" => {
                    identity.ip4 = value.parse().ok();
                    changed_i4 = true;
                }
                "I6" => {
                    identity.ip6 = value.parse().ok();
                    changed_i6 = true;
                }
                "KP" => identity.keyprint = Some(value.to_string()),
                "SL" => identity.slots = value.parse().unwrap_or(0),
                "DS" => identity.download_speed_bps = value.parse().unwrap_or(0),
                "US" => identity.upload_speed_bps = value.parse().unwrap_or(0),
                _ => {
                    identity.set(key, value);
                }
            }
        }

        user.set_flags(derive_user_flags(identity));
        user.mark_online();

        let is_self = sid == self.own_sid;
        if is_self && (changed_su || changed_i4 || changed_i6) {
            self.reclassify_all();
            return vec![Action::Event(HubEvent::UserUpdated { sid }), Action::Event(HubEvent::HubUpdated)];
        }
        if is_self && self.state != HubState::Normal {
            self.state = HubState::Normal;
            return vec![Action::Event(HubEvent::UserConnected {
                sid,
                cid: user.cid(),
            })];
        }

        vec![Action::Event(HubEvent::UserUpdated { sid })]
    }

    fn reclassify_all(&mut self) {
        let own = self.identities.get(&self.own_sid).cloned();
        let Some(own) = own else { return };
        for (sid, identity) in &mut self.identities {
            if *sid == self.own_sid {
                identity.connect_mode = ConnectMode::Me;
                continue;
            }
            identity.connect_mode = classify_connect_mode(&own, identity, &self.connectivity);
        }
    }

    fn handle_gpa(&mut self, cmd: &AdcCommand) -> Vec<Action> {
        let Some(salt_str) = cmd.positional(0) else {
            return vec![Action::Event(HubEvent::StatusMessage("GPA missing salt".into()))];
        };
        let Ok(salt) = data_encoding::BASE32_NOPAD.decode(salt_str.as_bytes()) else {
            return vec![Action::Event(HubEvent::StatusMessage("GPA bad salt encoding".into()))];
        };
        self.salt = Some(salt);
        self.state = HubState::Verify;
        vec![Action::Event(HubEvent::StatusMessage(
            "hub requested password verification".into(),
        ))]
    }

    /// Computes and returns the `PAS` frame to send once the caller has
    /// supplied the plaintext password (kept out of the reducer's own
    /// state).
    pub fn build_pas_response(&mut self, password: &[u8]) -> Option<AdcCommand> {
        let salt = self.salt.take()?;
        let legacy = !self.remote_supports.contains("TIGR");
        let cid_prefix = if legacy { self.own_cid.as_ref() } else { None };
        let response = crate::crypto::password::compute_response(password, &salt, cid_prefix);
        Some(AdcCommand::new(AdcClass::Hub, verb::PAS).with_positional(response))
    }

    fn handle_msg(&mut self, cmd: &AdcCommand) -> Vec<Action> {
        let text = cmd.positional(0).unwrap_or_default().to_string();
        vec![Action::Event(HubEvent::StatusMessage(text))]
    }

    fn handle_qui(&mut self, cmd: &AdcCommand) -> Vec<Action> {
        let Some(sid_str) = cmd.positional(0) else {
            return Vec::new();
        };
        let Ok(sid) = Sid::parse(sid_str) else {
            return Vec::new();
        };

        if let Some(user) = self.users.remove(&sid) {
            user.decref();
            user.mark_offline_now();
        }
        self.identities.remove(&sid);
        self.cid_index.retain(|_, v| *v != sid);

        let mut actions = vec![Action::Event(HubEvent::UserRemoved { sid })];
        if sid == self.own_sid {
            if let Some(tl) = cmd.get_named("TL") {
                if tl == "-1" {
                    self.auto_reconnect = false;
                }
            }
            if let Some(msg) = cmd.get_named("MS") {
                actions.push(Action::Event(HubEvent::StatusMessage(msg.to_string())));
            }
            actions.push(Action::Disconnect);
        }
        actions
    }

    fn handle_sta(&mut self, cmd: &AdcCommand) -> Vec<Action> {
        let Some(header) = cmd.positional(0).map(str::to_string) else {
            return Vec::new();
        };
        let (sev_code, message) = match cmd.params.get(1) {
            Some(m) => (header, m.clone()),
            None => (header.clone(), String::new()),
        };
        if sev_code.len() < 3 {
            return vec![Action::Event(HubEvent::StatusMessage(message))];
        }
        let severity = Severity::from_digit(sev_code.as_bytes()[0] - b'0');
        let code: u16 = sev_code[1..].parse().unwrap_or(0);

        if let Some(fourcc) = cmd.get_named("FC") {
            if fourcc.len() == 3 {
                let mut bytes = [0u8; 3];
                bytes.copy_from_slice(fourcc.as_bytes());
                self.forbidden.lock().forbid(crate::codec::AdcVerb(bytes));
            }
        }

        let status = Status {
            severity,
            code,
            message: message.clone(),
            forbidden_command: cmd.get_named("FC").and_then(|f| {
                if f.len() == 3 {
                    let mut bytes = [0u8; 3];
                    bytes.copy_from_slice(f.as_bytes());
                    Some(crate::codec::AdcVerb(bytes))
                } else {
                    None
                }
            }),
            token: cmd.get_named("TO").map(str::to_string),
        };

        let mut actions = vec![Action::Event(HubEvent::StatusMessage(format!(
            "[{code}] {}",
            status.message
        )))];
        if matches!(status.severity, Severity::Fatal) {
            actions.push(Action::Disconnect);
        }
        actions
    }

    fn handle_sch(&mut self, cmd: &AdcCommand) -> Vec<Action> {
        let Some(seeker) = cmd.from else { return Vec::new() };
        if !self.flood_gate.admit(seeker, Instant::now()) {
            return vec![Action::Event(HubEvent::SearchFlood { seeker })];
        }
        vec![Action::Event(HubEvent::StatusMessage(format!(
            "search from {}",
            seeker.to_base32()
        )))]
    }

    fn handle_res(&mut self, cmd: &AdcCommand) -> Vec<Action> {
        let Some(from) = cmd.from else { return Vec::new() };
        let token = cmd.get_named("TO").map(str::to_string);
        vec![Action::Event(HubEvent::SearchResult { from, token })]
    }

    /// Initiates a peer connection to `target` on behalf of the client
    /// registry's `connect()` (§4.F): picks `CTM` vs `RCM` vs a NAT-traversal
    /// handoff from our own reachability and the target's advertised one.
    pub fn request_connect(&mut self, target: Sid, token: &str) -> Vec<Action> {
        let Some(identity) = self.identities.get(&target) else {
            return vec![Action::Event(HubEvent::StatusMessage(
                "connect requested for unknown SID".into(),
            ))];
        };
        let secure = identity.keyprint.is_some();
        let protocol = if secure { "ADCS/0.10" } else { "ADC/1.0" };
        let we_are_active = self.connectivity.active_v4 || self.connectivity.active_v6;

        if we_are_active {
            return vec![
                Action::Send(
                    AdcCommand::new(AdcClass::Direct, verb::CTM)
                        .with_from(self.own_sid)
                        .with_to(target)
                        .with_positional(protocol)
                        .with_positional(self.local_port.to_string())
                        .with_positional(token),
                ),
                Action::Connect(ConnectRequest {
                    remote_sid: target,
                    protocol: protocol.to_string(),
                    port: 0,
                    token: token.to_string(),
                    secure,
                    nat_role: None,
                }),
            ];
        }
        if matches!(identity.connect_mode, ConnectMode::ActiveV4 | ConnectMode::ActiveV6) {
            return vec![Action::Send(
                AdcCommand::new(AdcClass::Direct, verb::RCM)
                    .with_from(self.own_sid)
                    .with_to(target)
                    .with_positional(protocol)
                    .with_positional(token),
            )];
        }
        if self.connectivity.supports_nat0 && identity.supports("NAT0") {
            return vec![Action::Connect(ConnectRequest {
                remote_sid: target,
                protocol: protocol.to_string(),
                port: 0,
                token: token.to_string(),
                secure,
                nat_role: Some(NatRole::Client),
            })];
        }
        vec![Action::Event(HubEvent::StatusMessage(
            "cannot connect: no shared reachable IP family".into(),
        ))]
    }

    fn handle_ctm(&mut self, cmd: &AdcCommand) -> Vec<Action> {
        let Some(from) = cmd.from else {
            return vec![Action::Event(HubEvent::StatusMessage("CTM missing FROM".into()))];
        };
        if cmd.class == AdcClass::Direct && cmd.to != Some(self.own_sid) {
            return Vec::new();
        }
        let (Some(protocol), Some(port_str), Some(token)) =
            (cmd.positional(0), cmd.positional(1), cmd.positional(2))
        else {
            return vec![Action::Event(HubEvent::StatusMessage("CTM missing params".into()))];
        };
        let secure = protocol == "ADCS/0.10";
        let Ok(port) = port_str.parse() else {
            return vec![Action::Event(HubEvent::StatusMessage("CTM bad port".into()))];
        };
        vec![Action::Connect(ConnectRequest {
            remote_sid: from,
            protocol: protocol.to_string(),
            port,
            token: token.to_string(),
            secure,
            nat_role: None,
        })]
    }

    fn handle_rcm(&mut self, cmd: &AdcCommand) -> Vec<Action> {
        let Some(from) = cmd.from else { return Vec::new() };
        let we_are_active = self.connectivity.active_v4 || self.connectivity.active_v6;
        let remote_supports_nat0 = self
            .identities
            .get(&from)
            .is_some_and(|i| i.supports("NAT0"));

        if we_are_active {
            let protocol = cmd.positional(0).unwrap_or("ADC/1.0").to_string();
            let token = cmd.positional(1).unwrap_or_default().to_string();
            return vec![Action::Send(
                AdcCommand::new(AdcClass::Direct, verb::CTM)
                    .with_from(self.own_sid)
                    .with_to(from)
                    .with_positional(protocol.clone())
                    .with_positional("0")
                    .with_positional(token.clone()),
            ), Action::Connect(ConnectRequest {
                remote_sid: from,
                protocol,
                port: 0,
                token,
                secure: false,
                nat_role: None,
            })];
        }
        if self.connectivity.supports_nat0 && remote_supports_nat0 {
            let token = cmd.positional(1).unwrap_or_default().to_string();
            return vec![Action::Connect(ConnectRequest {
                remote_sid: from,
                protocol: cmd.positional(0).unwrap_or("ADC/1.0").to_string(),
                port: 0,
                token,
                secure: false,
                nat_role: Some(NatRole::Client),
            })];
        }
        Vec::new()
    }

    fn handle_nat(&mut self, cmd: &AdcCommand) -> Vec<Action> {
        let Some(from) = cmd.from else { return Vec::new() };
        let (Some(protocol), Some(port_str), Some(token)) =
            (cmd.positional(0), cmd.positional(1), cmd.positional(2))
        else {
            return Vec::new();
        };
        let Ok(port) = port_str.parse() else { return Vec::new() };
        vec![Action::Connect(ConnectRequest {
            remote_sid: from,
            protocol: protocol.to_string(),
            port,
            token: token.to_string(),
            secure: false,
            nat_role: Some(NatRole::Server),
        })]
    }

    fn handle_rnt(&mut self, cmd: &AdcCommand) -> Vec<Action> {
        self.handle_nat(cmd)
    }

    fn handle_get(&mut self, cmd: &AdcCommand) -> Vec<Action> {
        if cmd.positional(0) != Some("blom") {
            return Vec::new();
        }
        let k: u32 = cmd.get_named("BK").and_then(|v| v.parse().ok()).unwrap_or(0);
        let h: u32 = cmd.get_named("BH").and_then(|v| v.parse().ok()).unwrap_or(0);
        let m: u64 = cmd.get_named("BE").and_then(|v| v.parse().ok()).unwrap_or(0);

        let params = BloomParams { k, h, m };
        if bloom::validate(params, self.local_file_count).is_err() {
            let sta = AdcCommand::new(AdcClass::Hub, verb::STA)
                .with_from(self.own_sid)
                .with_positional("241")
                .with_positional("Unsupported m");
            return vec![
                Action::Send(sta),
                Action::Event(HubEvent::StatusMessage("GET blom rejected: bad parameters".into())),
            ];
        }

        let bits = bloom::build(params, std::iter::empty());
        let mut send = AdcCommand::new(AdcClass::Hub, verb::SND)
            .with_positional("blom")
            .with_named("BK", k.to_string())
            .with_named("BH", h.to_string())
            .with_named("BE", m.to_string());
        if m == 0 {
            return vec![Action::Send(send)];
        }
        send = send.with_named("BL", bits.len().to_string());
        vec![Action::Send(send), Action::SendBinary(bits)]
    }

    fn handle_cmd(&mut self, cmd: &AdcCommand) -> Vec<Action> {
        let kind = if cmd.get_named("SP").is_some() {
            UserCommandKind::Separator
        } else if cmd.get_named("RM").is_some() {
            UserCommandKind::Remove
        } else {
            UserCommandKind::Raw
        };
        let context = cmd.get_named("CT").and_then(|v| v.parse().ok()).unwrap_or(0);
        let name = cmd.positional(0).unwrap_or_default().to_string();
        vec![Action::Event(HubEvent::UserCommand {
            kind,
            context,
            name,
            raw: cmd.serialize(),
        })]
    }
}

fn derive_user_flags(identity: &Identity) -> crate::identity::UserFlags {
    use crate::identity::UserFlags;
    let mut flags = UserFlags::empty();
    if identity.is_bot() {
        flags |= UserFlags::BOT;
    }
    if identity.supports("ADC0") {
        flags |= UserFlags::TLS;
    }
    if identity.supports("CCPM") && identity.supports("ADC0") {
        flags |= UserFlags::CCPM;
    }
    if identity.supports("ASCH") {
        flags |= UserFlags::ASCH;
    }
    flags
}

fn classify_connect_mode(
    own: &Identity,
    remote: &Identity,
    connectivity: &LocalConnectivity,
) -> ConnectMode {
    let allow_v4 = remote.ip4.is_some() && own.ip4.is_some();
    let allow_v6 = remote.ip6.is_some() && own.ip6.is_some();

    let remote_active_v4 = allow_v4 && remote.supports("TCP4");
    let remote_active_v6 = allow_v6 && remote.supports("TCP6");

    if remote_active_v4 {
        return ConnectMode::ActiveV4;
    }
    if remote_active_v6 {
        return ConnectMode::ActiveV6;
    }
    if allow_v4 && connectivity.active_v4 {
        return ConnectMode::PassiveV4;
    }
    if allow_v6 && connectivity.active_v6 {
        return ConnectMode::PassiveV6;
    }
    if allow_v4 || allow_v6 {
        return ConnectMode::NoConnectPassive;
    }
    ConnectMode::NoConnectIp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CID_LEN;

    fn session() -> AdcHubSession {
        AdcHubSession::new(
            "adc://hub.example".into(),
            Cid([1u8; CID_LEN]),
            Pid([2u8; CID_LEN]),
        )
    }

    #[test]
    fn sup_without_base_disconnects() {
        let mut s = session();
        s.state = HubState::Protocol;
        let cmd = AdcCommand::parse("ISUP ADTIGR").unwrap();
        let actions = s.handle(cmd);
        assert!(actions.iter().any(|a| matches!(a, Action::Disconnect)));
    }

    #[test]
    fn sup_with_base_is_accepted() {
        let mut s = session();
        s.state = HubState::Protocol;
        let cmd = AdcCommand::parse("ISUP ADBASE ADTIGR").unwrap();
        let actions = s.handle(cmd);
        assert!(actions.is_empty());
        assert!(s.remote_supports.contains("BASE"));
    }

    #[test]
    fn sid_assignment_sends_inf_with_id() {
        let mut s = session();
        s.state = HubState::Protocol;
        let cmd = AdcCommand::parse("ISID AAAB").unwrap();
        let actions = s.handle(cmd);
        assert_eq!(s.state, HubState::Identify);
        assert_eq!(s.own_sid, Sid::parse("AAAB").unwrap());
        let Action::Send(inf) = &actions[0] else { panic!("expected Send") };
        assert!(inf.get_named("ID").is_some());
        assert!(inf.get_named("PD").is_some());
    }

    #[test]
    fn duplicate_cid_different_sid_is_dropped() {
        let mut s = session();
        s.handle(AdcCommand::parse("BINF AAAB IDAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").unwrap());
        let actions = s.handle(
            AdcCommand::parse("BINF AAAC IDAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").unwrap(),
        );
        assert!(matches!(&actions[0], Action::Event(HubEvent::StatusMessage(m)) if m.contains("same CID")));
        assert!(!s.users.contains_key(&Sid::parse("AAAC").unwrap()));
    }

    #[test]
    fn gpa_then_pas_consumes_salt_once() {
        let mut s = session();
        let salt_b32 = data_encoding::BASE32_NOPAD.encode(&[1, 2, 3, 4]);
        s.handle(AdcCommand::parse(&format!("IGPA {salt_b32}")).unwrap());
        assert!(s.build_pas_response(b"secret").is_some());
        assert!(s.build_pas_response(b"secret").is_none());
    }

    #[test]
    fn qui_for_own_sid_disconnects() {
        let mut s = session();
        s.own_sid = Sid::parse("AAAB").unwrap();
        let actions = s.handle(AdcCommand::parse("IQUI AAAB TL-1").unwrap());
        assert!(!s.auto_reconnect);
        assert!(actions.iter().any(|a| matches!(a, Action::Disconnect)));
    }

    #[test]
    fn forbidden_command_recorded_from_sta() {
        let mut s = session();
        s.handle(AdcCommand::parse("ISTA 243 forbidden FCSCH").unwrap());
        assert!(s.forbidden_commands().lock().is_forbidden(crate::codec::adc::verb::SCH));
    }

    #[test]
    fn request_connect_sends_ctm_when_we_are_active() {
        let mut s = session();
        s.own_sid = Sid(1);
        s.connectivity.active_v4 = true;
        let target = Sid(2);
        s.identities.insert(target, Identity::default());

        let actions = s.request_connect(target, "tok1");
        assert!(actions.iter().any(|a| matches!(a, Action::Send(cmd) if cmd.verb == verb::CTM)));
        assert!(actions.iter().any(|a| matches!(a, Action::Connect(_))));
    }

    #[test]
    fn request_connect_sends_rcm_when_remote_is_active_and_we_are_not() {
        let mut s = session();
        s.own_sid = Sid(1);
        let target = Sid(2);
        let mut identity = Identity::default();
        identity.connect_mode = ConnectMode::ActiveV4;
        s.identities.insert(target, identity);

        let actions = s.request_connect(target, "tok2");
        assert!(actions.iter().any(|a| matches!(a, Action::Send(cmd) if cmd.verb == verb::RCM)));
    }

    #[test]
    fn request_connect_gives_up_with_no_shared_family() {
        let mut s = session();
        s.own_sid = Sid(1);
        let target = Sid(2);
        s.identities.insert(target, Identity::default());

        let actions = s.request_connect(target, "tok3");
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Event(HubEvent::StatusMessage(_)))));
    }

    #[test]
    fn flood_gate_blacklists_repeated_seeker() {
        let mut s = session();
        let mut last = Vec::new();
        for _ in 0..crate::constants::SEARCH_FLOOD_THRESHOLD {
            last = s.handle(AdcCommand::parse("BSCH AAAB ANfoo").unwrap());
        }
        assert!(matches!(&last[0], Action::Event(HubEvent::SearchFlood { .. })));
    }

    #[test]
    fn get_blom_with_bad_k_is_rejected_without_binary_payload() {
        let mut s = session();
        let actions = s.handle(AdcCommand::parse("HGET blom BK0 BH10 BE100").unwrap());
        assert_eq!(actions.len(), 2);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Send(cmd) if cmd.verb == verb::STA && cmd.positional(0) == Some("241"))));
        assert!(!actions.iter().any(|a| matches!(a, Action::SendBinary(_))));
    }
}

//! `OnlineUser` — the binding of a `User` to one hub session at one SID
//! (§3), and the `Identity` attribute bag it owns.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use crate::identity::{Sid, User};

/// How a remote user is reachable relative to our own connectivity, derived
/// per §4.D's connect-mode classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectMode {
    /// This `OnlineUser` is us.
    Me,
    ActiveV4,
    ActiveV6,
    PassiveV4,
    PassiveV6,
    /// Both sides passive; no way to establish a direct connection.
    NoConnectPassive,
    /// No shared IP family at all.
    NoConnectIp,
}

/// Free-form identity attribute bag, keyed by the 2-char ADC field it was
/// last set from (`NI`, `DE`, `SS`, ...). NMDC sessions populate the same
/// map from `$MyINFO`/tag fields using the ADC-equivalent keys so the rest
/// of the crate never branches on protocol.
#[derive(Clone, Debug, Default)]
pub struct Identity {
    fields: HashMap<String, String>,
    pub ip4: Option<IpAddr>,
    pub ip6: Option<IpAddr>,
    pub udp_port: Option<u16>,
    pub share_bytes: u64,
    pub slots: u32,
    pub supports: Vec<String>,
    pub download_speed_bps: u64,
    pub upload_speed_bps: u64,
    pub keyprint: Option<String>,
    pub connect_mode: ConnectMode,
}

impl Default for ConnectMode {
    fn default() -> Self {
        ConnectMode::NoConnectIp
    }
}

impl Identity {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Sets a field, returning the previous value if it changed (used by
    /// the hub session's delta-INF diffing).
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Option<String> {
        let value = value.into();
        match self.fields.get(key) {
            Some(old) if *old == value => None,
            _ => self.fields.insert(key.to_string(), value),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.fields.remove(key)
    }

    #[must_use]
    pub fn supports(&self, feature: &str) -> bool {
        self.supports.iter().any(|f| f == feature)
    }

    #[must_use]
    pub fn nick(&self) -> &str {
        self.get("NI").unwrap_or("")
    }

    #[must_use]
    pub fn is_bot(&self) -> bool {
        self.get("BO").is_some_and(|v| v == "1")
    }
}

/// A `User` bound to one hub session at one SID, with its per-session
/// attribute state.
#[derive(Debug)]
pub struct OnlineUser {
    pub user: Arc<User>,
    pub sid: Sid,
    pub identity: Identity,
}

impl OnlineUser {
    #[must_use]
    pub fn new(user: Arc<User>, sid: Sid) -> Self {
        Self {
            user,
            sid,
            identity: Identity::default(),
        }
    }

    #[must_use]
    pub fn is_self(&self, own_sid: Sid) -> bool {
        self.sid == own_sid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Cid;

    #[test]
    fn identity_set_returns_previous_value_only_on_change() {
        let mut identity = Identity::default();
        assert_eq!(identity.set("NI", "bob"), None);
        assert_eq!(identity.set("NI", "bob"), None);
        assert_eq!(identity.set("NI", "alice"), Some("bob".to_string()));
    }

    #[test]
    fn online_user_wraps_shared_user() {
        let user = Arc::new(User::new(Cid([1u8; crate::constants::CID_LEN])));
        let ou = OnlineUser::new(user.clone(), Sid(7));
        assert!(ou.is_self(Sid(7)));
        assert_eq!(Arc::strong_count(&user), 2);
    }
}

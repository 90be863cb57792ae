//! Hub session state machine (§4.D).
//!
//! ```text
//!   DISCONNECTED ──connect()──▶ CONNECTING
//!       ▲                           │ socket Connected
//!       │                           ▼
//!       │                       PROTOCOL  (send SUP; NMDC: expect $Lock)
//!       │                           │ remote SUP supports {BASE or BAS0}
//!       │                           ▼
//!       │                       IDENTIFY  (we got our SID; send INF)
//!       │                           │ hub sends GPA?  yes──▶ VERIFY ─PAS─┐
//!       │                           │                  no                │
//!       │                           ▼                                    │
//!       │                        NORMAL  ◀─────────────────────────────┘
//!       │                           │
//!       └──disconnect/failed────────┘
//! ```
//!
//! Transitions happen only on command ingress; the only time-based
//! transitions are the `NORMAL` keepalive and the `DISCONNECTED`
//! auto-reconnect.

/// Where a hub session currently sits in the connect/login sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HubState {
    Disconnected,
    Connecting,
    Protocol,
    Identify,
    Verify,
    Normal,
}

impl HubState {
    #[must_use]
    pub fn is_connected(self) -> bool {
        !matches!(self, HubState::Disconnected | HubState::Connecting)
    }

    #[must_use]
    pub fn can_send_user_commands(self) -> bool {
        matches!(self, HubState::Normal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_normal_allows_user_traffic() {
        assert!(HubState::Normal.can_send_user_commands());
        assert!(!HubState::Verify.can_send_user_commands());
        assert!(!HubState::Identify.can_send_user_commands());
    }

    #[test]
    fn connecting_is_not_yet_connected() {
        assert!(!HubState::Disconnected.is_connected());
        assert!(!HubState::Connecting.is_connected());
        assert!(HubState::Protocol.is_connected());
    }
}

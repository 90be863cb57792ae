//! Connect tokens and the expected-connection map (§4.G).
//!
//! Every `CTM`/`RCM`/`DNAT` exchange is tagged with a token the peer
//! connection manager uses to recognize the resulting inbound socket (or
//! the `DRNT` reply) and recover which CID/hub it belongs to.

use std::collections::HashMap;

use rand::Rng;

use crate::hub::NatRole;
use crate::identity::Cid;

/// Generates a random lowercase-alphanumeric connect token, long enough that
/// collisions across concurrently pending connections are not a concern.
#[must_use]
pub fn generate() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..10).map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char).collect()
}

/// What an outstanding token resolves to once its matching connection (or
/// `DRNT`) arrives.
#[derive(Clone, Debug)]
pub struct ExpectedConnection {
    pub cid: Cid,
    pub hub_url: String,
    /// Set only while a `DNAT`/`DRNT` exchange for this token is in flight.
    pub nat_role: Option<NatRole>,
    /// True if this connection is for a `CCPM` private-message channel
    /// rather than a file transfer (`PM1` on the incoming handshake).
    pub private_message: bool,
}

/// Tracks tokens we've handed out until the matching inbound connection (or
/// NAT reply) claims them.
#[derive(Debug, Default)]
pub struct ExpectedConnections {
    pending: HashMap<String, ExpectedConnection>,
}

impl ExpectedConnections {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, token: String, expected: ExpectedConnection) {
        self.pending.insert(token, expected);
    }

    #[must_use]
    pub fn get(&self, token: &str) -> Option<&ExpectedConnection> {
        self.pending.get(token)
    }

    pub fn take(&mut self, token: &str) -> Option<ExpectedConnection> {
        self.pending.remove(token)
    }

    pub fn set_nat_role(&mut self, token: &str, role: NatRole) {
        if let Some(entry) = self.pending.get_mut(token) {
            entry.nat_role = Some(role);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid() -> Cid {
        Cid([7u8; crate::constants::CID_LEN])
    }

    #[test]
    fn generated_tokens_have_expected_length_and_alphabet() {
        let token = generate();
        assert_eq!(token.len(), 10);
        assert!(token.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn register_then_take_round_trips() {
        let mut map = ExpectedConnections::new();
        map.register(
            "tok1".to_string(),
            ExpectedConnection {
                cid: cid(),
                hub_url: "adc://hub".to_string(),
                nat_role: None,
                private_message: false,
            },
        );
        assert!(map.get("tok1").is_some());
        let taken = map.take("tok1").unwrap();
        assert_eq!(taken.cid, cid());
        assert!(map.take("tok1").is_none());
    }

    #[test]
    fn set_nat_role_updates_pending_entry() {
        let mut map = ExpectedConnections::new();
        map.register(
            "tok2".to_string(),
            ExpectedConnection {
                cid: cid(),
                hub_url: "adc://hub".to_string(),
                nat_role: None,
                private_message: false,
            },
        );
        map.set_nat_role("tok2", NatRole::Server);
        assert_eq!(map.get("tok2").unwrap().nat_role, Some(NatRole::Server));
    }
}

//! NAT traversal (`NAT`/`RNT`) hole-punching orchestration (§4.G):
//!
//! ```text
//! (passive) receives RCM, can't CTM back → sends NAT <port> <token>
//! (passive) receives NAT → sends RNT <port> <token>, dials remote:theirPort
//! (passive) receives RNT → dials remote:theirPort
//! ```
//!
//! Both half-open SYNs land close enough together to punch through most
//! home routers. Everything here is pure: the manager owns the actual
//! socket connect and the expected-connection bookkeeping.

use crate::hub::NatRole;

/// What the NAT reducer wants the caller to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatAction {
    /// Send a `NAT` (class `D`) command: `protocol localPort token`.
    SendNat { protocol: &'static str, local_port: u16, token: String },
    /// Send an `RNT` (class `D`) command: `protocol localPort token`.
    SendRnt { protocol: &'static str, local_port: u16, token: String },
    /// Dial the remote at this address, tagging the resulting connection
    /// with the given NAT role for when it completes the handshake.
    Dial { remote_port: u16, token: String, role: NatRole },
}

/// We're passive and just received an `RCM` we can't answer with a direct
/// `CTM`; the remote advertised `NAT0`, so we kick off the hole-punch by
/// announcing the local port we'll be dialing out from.
#[must_use]
pub fn start_traversal(protocol: &'static str, local_port: u16, token: String) -> Vec<NatAction> {
    vec![NatAction::SendNat { protocol, local_port, token }]
}

/// We received a `NAT <protocol> <theirPort> <token>`: reply with our own
/// `RNT` and dial them back immediately. We take the `Server` role, since
/// we're the side answering the original `RCM`.
#[must_use]
pub fn on_nat_received(protocol: &'static str, local_port: u16, their_port: u16, token: String) -> Vec<NatAction> {
    vec![
        NatAction::SendRnt { protocol, local_port, token: token.clone() },
        NatAction::Dial { remote_port: their_port, token, role: NatRole::Server },
    ]
}

/// We received the `RNT <protocol> <theirPort> <token>` reply to our `NAT`:
/// dial them back. We take the `Client` role, since we initiated the
/// traversal.
#[must_use]
pub fn on_rnt_received(their_port: u16, token: String) -> Vec<NatAction> {
    vec![NatAction::Dial { remote_port: their_port, token, role: NatRole::Client }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_traversal_announces_local_port() {
        let actions = start_traversal("ADC/1.0", 4321, "tok".into());
        assert_eq!(actions, vec![NatAction::SendNat { protocol: "ADC/1.0", local_port: 4321, token: "tok".into() }]);
    }

    #[test]
    fn receiving_nat_replies_and_dials_as_server() {
        let actions = on_nat_received("ADC/1.0", 4321, 12345, "tok".into());
        assert_eq!(
            actions,
            vec![
                NatAction::SendRnt { protocol: "ADC/1.0", local_port: 4321, token: "tok".into() },
                NatAction::Dial { remote_port: 12345, token: "tok".into(), role: NatRole::Server },
            ]
        );
    }

    #[test]
    fn receiving_rnt_dials_as_client() {
        let actions = on_rnt_received(12345, "tok".into());
        assert_eq!(actions, vec![NatAction::Dial { remote_port: 12345, token: "tok".into(), role: NatRole::Client }]);
    }
}

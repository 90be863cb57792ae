//! Hub session core (§3 `Client`, §4.D): protocol-specific reducers
//! ([`AdcHubSession`], [`NmdcHubSession`]) plus the socket-driving glue
//! that turns either one into a running connection ([`lifecycle`],
//! [`workers`]).

pub mod adc_session;
pub mod bloom;
pub mod events;
pub mod lifecycle;
pub mod nmdc_session;
pub mod outbox;
pub mod search;
pub mod state;
pub mod workers;

pub use adc_session::{Action, AdcHubSession, ConnectRequest, LocalConnectivity, LocalIdentity, NatRole};
pub use events::{HubEvent, Severity, Status, UserCommandKind};
pub use lifecycle::{connect, HubConnectOptions};
pub use nmdc_session::NmdcHubSession;
pub use outbox::{ForbiddenCommands, HookChain, OutgoingHubCommandHook, OwnSidStamp};
pub use state::HubState;
pub use workers::{HubCommand, HubHandle};

/// Who a `connect()` call should reach: a SID on an ADC hub, or a nick on
/// an NMDC one. Opaque to the client registry beyond routing.
#[derive(Clone, Debug)]
pub enum ConnectTarget {
    Sid(crate::identity::Sid),
    Nick(String),
}

/// Either protocol's session reducer, dispatched on by the worker loop so
/// the rest of the crate doesn't need to branch on protocol.
pub enum AnyHubSession {
    Adc(AdcHubSession),
    Nmdc(NmdcHubSession),
}

impl AnyHubSession {
    /// Records this hub's view of our own peer-listener port, used when we
    /// need to tell a remote user to dial us (`CTM`/`$ConnectToMe`).
    pub fn set_local_port(&mut self, port: u16) {
        match self {
            AnyHubSession::Adc(s) => s.set_local_port(port),
            AnyHubSession::Nmdc(s) => s.set_local_port(port),
        }
    }

    /// Initiates a peer connection to `target` (§4.F `connect()`). `my_ip`
    /// is only consulted for NMDC's `$ConnectToMe`, which must carry our
    /// address literally; ADC's `CTM` lets the hub relay it via SID lookup.
    pub fn request_connect(&mut self, target: &ConnectTarget, my_ip: &str, token: &str) -> Vec<Action> {
        match (self, target) {
            (AnyHubSession::Adc(s), ConnectTarget::Sid(sid)) => s.request_connect(*sid, token),
            (AnyHubSession::Nmdc(s), ConnectTarget::Nick(nick)) => {
                s.request_connect(nick, my_ip, token)
            }
            _ => vec![Action::Event(HubEvent::StatusMessage(
                "connect target does not match hub protocol".into(),
            ))],
        }
    }

    fn on_connected(&mut self) -> Vec<Action> {
        match self {
            AnyHubSession::Adc(s) => s.on_socket_connected(),
            AnyHubSession::Nmdc(s) => s.on_socket_connected(),
        }
    }

    fn handle_line(&mut self, line: &str) -> Vec<Action> {
        match self {
            AnyHubSession::Adc(s) => match crate::codec::AdcCommand::parse(line) {
                Ok(cmd) => s.handle(cmd),
                Err(e) => vec![Action::Event(HubEvent::StatusMessage(format!(
                    "bad ADC line: {e}"
                )))],
            },
            AnyHubSession::Nmdc(s) => s.handle(line),
        }
    }

    fn submit_password(&mut self, password: &[u8]) -> Option<Action> {
        match self {
            AnyHubSession::Adc(s) => s.build_pas_response(password).map(Action::Send),
            AnyHubSession::Nmdc(_) => None,
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            AnyHubSession::Adc(s) => &s.url,
            AnyHubSession::Nmdc(s) => &s.url,
        }
    }
}

impl std::fmt::Debug for AnyHubSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnyHubSession::Adc(_) => f.write_str("AnyHubSession::Adc"),
            AnyHubSession::Nmdc(_) => f.write_str("AnyHubSession::Nmdc"),
        }
    }
}

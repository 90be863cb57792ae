//! Events a hub session emits to its owner (the client registry / UI sink).
//!
//! Delivered over an mpsc channel rather than a callback interface, per the
//! crate-wide "listener as channel" convention (§9).

use crate::hub::adc_session::ConnectRequest;
use crate::identity::{Cid, Sid};

/// A typed `STA` severity, parsed from the `[SSS]` prefix (SPEC_FULL §10.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Success,
    Recoverable,
    Fatal,
}

impl Severity {
    #[must_use]
    pub fn from_digit(d: u8) -> Self {
        match d {
            0 => Severity::Success,
            2 => Severity::Fatal,
            _ => Severity::Recoverable,
        }
    }
}

/// A parsed `STA` status: severity, numeric code, message, and optional
/// named fields (`FC`, `PR`, `TO`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub severity: Severity,
    pub code: u16,
    pub message: String,
    pub forbidden_command: Option<crate::codec::AdcVerb>,
    pub token: Option<String>,
}

/// Events surfaced to the owner of a running hub session.
#[derive(Clone, Debug)]
pub enum HubEvent {
    /// A chat or protocol status message worth showing the user.
    StatusMessage(String),
    /// A new user came online in this session.
    UserConnected { sid: Sid, cid: Cid },
    /// An existing user's identity changed.
    UserUpdated { sid: Sid },
    /// A user left (or was dropped as a duplicate-CID spam guard).
    UserRemoved { sid: Sid },
    /// Our own identity or the hub's aggregate counters changed.
    HubUpdated,
    /// The session failed and is no longer usable.
    Failed { reason: String },
    /// A hub-defined user command arrived (`CMD`).
    UserCommand {
        kind: UserCommandKind,
        context: u32,
        name: String,
        raw: String,
    },
    /// A search result arrived for one of our outbound searches.
    SearchResult { from: Sid, token: Option<String> },
    /// The inbound-search flood gate blacklisted a seeker.
    SearchFlood { seeker: Sid },
    /// A `CTM`/`RCM`/`NAT`/`RNT` exchange needs the peer connection manager
    /// to dial or listen on our behalf.
    ConnectRequested(ConnectRequest),
}

/// `CMD` message kind (§4.D).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserCommandKind {
    Separator,
    Remove,
    Raw,
}

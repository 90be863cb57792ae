//! Small value types shared by the client registry (§4.F).

use crate::identity::Cid;

/// A target user for `connect()`/`privateMessage()`: the interned CID plus
/// whatever hub-location hint the caller has (a search result, a queued
/// download, a bookmark). ADC routes by CID; NMDC has none, so `nmdc_nick`
/// carries the nick on `hub_url`'s session instead.
#[derive(Clone, Debug)]
pub struct HintedUser {
    pub cid: Cid,
    pub hub_url: Option<String>,
    pub nmdc_nick: Option<String>,
}

impl HintedUser {
    #[must_use]
    pub fn adc(cid: Cid, hub_url: impl Into<String>) -> Self {
        Self { cid, hub_url: Some(hub_url.into()), nmdc_nick: None }
    }

    #[must_use]
    pub fn nmdc(cid: Cid, hub_url: impl Into<String>, nick: impl Into<String>) -> Self {
        Self {
            cid,
            hub_url: Some(hub_url.into()),
            nmdc_nick: Some(nick.into()),
        }
    }
}

/// What a requested peer connection is for (§3 CQI `connection-kind`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectKind {
    Download,
    Upload,
    PrivateMessage,
}

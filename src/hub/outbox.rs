//! Outbound command hook and the forbidden-command filter (§4.D).
//!
//! Every outbound `AdcCommand` passes through the hook before the session
//! serializes it with our own SID. The hook may add/replace parameters or
//! reject the send outright; the hook chain runs synchronously on the
//! session's own task, never across an await point.

use std::collections::HashSet;
use std::sync::Arc;

use crate::codec::{AdcCommand, AdcVerb};
use crate::error::ConnectError;
use crate::identity::Sid;

/// A single outgoing-command hook.
pub trait OutgoingHubCommandHook: Send + Sync {
    /// Inspects or rewrites `cmd` before send. Returning `Err` drops the
    /// frame and surfaces the rejection to the caller.
    fn apply(&self, cmd: AdcCommand) -> Result<AdcCommand, ConnectError>;
}

/// Ordered chain of hooks run for every outbound frame.
#[derive(Default)]
pub struct HookChain {
    hooks: Vec<Box<dyn OutgoingHubCommandHook>>,
}

impl HookChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hook: Box<dyn OutgoingHubCommandHook>) {
        self.hooks.push(hook);
    }

    pub fn run(&self, mut cmd: AdcCommand) -> Result<AdcCommand, ConnectError> {
        for hook in &self.hooks {
            cmd = hook.apply(cmd)?;
        }
        Ok(cmd)
    }
}

/// Tracks `FourCC` verbs the hub has rejected once via `STA
/// ERROR_COMMAND_ACCESS FC<verb>`; monotonic within a session (§8 invariant
/// 6), reset only on reconnect.
#[derive(Debug, Default)]
pub struct ForbiddenCommands {
    verbs: HashSet<AdcVerb>,
}

impl ForbiddenCommands {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forbid(&mut self, verb: AdcVerb) {
        self.verbs.insert(verb);
    }

    #[must_use]
    pub fn is_forbidden(&self, verb: AdcVerb) -> bool {
        self.verbs.contains(&verb)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.verbs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.verbs.is_empty()
    }
}

impl OutgoingHubCommandHook for std::sync::Arc<parking_lot::Mutex<ForbiddenCommands>> {
    fn apply(&self, cmd: AdcCommand) -> Result<AdcCommand, ConnectError> {
        if self.lock().is_forbidden(cmd.verb) {
            return Err(ConnectError::HookRejected(format!(
                "verb {} is forbidden on this session",
                cmd.verb.as_str()
            )));
        }
        Ok(cmd)
    }
}

/// Stamps `FROM` with our own SID on any outbound frame that lacks one —
/// the mechanism behind "the frame is serialized with our own SID baked in"
/// (§4.D), since frames built outside the reducer (the client registry's
/// `MSG`/`SCH`/`CTM` sends) don't have access to the session's own SID.
#[derive(Clone, Default)]
pub struct OwnSidStamp(Arc<parking_lot::Mutex<Option<Sid>>>);

impl OwnSidStamp {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, sid: Sid) {
        *self.0.lock() = Some(sid);
    }
}

impl OutgoingHubCommandHook for OwnSidStamp {
    fn apply(&self, cmd: AdcCommand) -> Result<AdcCommand, ConnectError> {
        if cmd.from.is_some() {
            return Ok(cmd);
        }
        match *self.0.lock() {
            Some(sid) => Ok(cmd.with_from(sid)),
            None => Ok(cmd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::AdcClass;
    use crate::identity::Sid;
    use std::sync::Arc;

    #[test]
    fn forbidden_set_is_monotonic() {
        let mut forbidden = ForbiddenCommands::new();
        forbidden.forbid(crate::codec::adc::verb::SCH);
        assert_eq!(forbidden.len(), 1);
        forbidden.forbid(crate::codec::adc::verb::SCH);
        assert_eq!(forbidden.len(), 1);
        forbidden.forbid(crate::codec::adc::verb::MSG);
        assert_eq!(forbidden.len(), 2);
    }

    #[test]
    fn forbidden_hook_rejects_matching_verb() {
        let forbidden = Arc::new(parking_lot::Mutex::new(ForbiddenCommands::new()));
        forbidden.lock().forbid(crate::codec::adc::verb::SCH);

        let mut chain = HookChain::new();
        chain.push(Box::new(forbidden));

        let cmd = AdcCommand::new(AdcClass::Broadcast, crate::codec::adc::verb::SCH).with_from(Sid(1));
        assert!(chain.run(cmd).is_err());

        let cmd = AdcCommand::new(AdcClass::Broadcast, crate::codec::adc::verb::MSG).with_from(Sid(1));
        assert!(chain.run(cmd).is_ok());
    }

    #[test]
    fn own_sid_stamp_fills_missing_from_only() {
        let stamp = OwnSidStamp::new();
        stamp.set(Sid(7));

        let cmd = AdcCommand::new(AdcClass::Direct, crate::codec::adc::verb::MSG);
        let stamped = stamp.apply(cmd).unwrap();
        assert_eq!(stamped.from, Some(Sid(7)));

        let explicit = AdcCommand::new(AdcClass::Direct, crate::codec::adc::verb::MSG).with_from(Sid(2));
        let unchanged = stamp.apply(explicit).unwrap();
        assert_eq!(unchanged.from, Some(Sid(2)));
    }
}

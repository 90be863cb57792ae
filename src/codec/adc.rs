//! ADC command parsing and serialization (§4.A, §6).
//!
//! A frame is `X YYY [FROM] [TO]? [FEATURES]? param*` written on the wire as
//! a single header token (`X` + 3-letter verb, no space) followed by
//! space-separated parameters, e.g. `BINF AAAB ID<cid> NIbob`.

use std::fmt;

use crate::error::ProtocolError;
use crate::identity::Sid;

/// Message class, the first byte of the header token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Class {
    /// Broadcast to every user in the hub.
    Broadcast,
    /// Direct to one SID.
    Direct,
    /// Echo: direct, but the hub also loops it back to the sender.
    Echo,
    /// Feature-filtered broadcast.
    FeatureFiltered,
    /// Addressed to the hub itself.
    Hub,
    /// Informational, hub-originated, no FROM.
    Info,
    /// Client-local pseudo-command (peer connection handshake).
    Client,
    /// Carried over UDP (search results).
    Udp,
}

impl Class {
    fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        Ok(match b {
            b'B' => Class::Broadcast,
            b'D' => Class::Direct,
            b'E' => Class::Echo,
            b'F' => Class::FeatureFiltered,
            b'H' => Class::Hub,
            b'I' => Class::Info,
            b'C' => Class::Client,
            b'U' => Class::Udp,
            _ => return Err(ProtocolError::Malformed(format!("unknown class byte {b:?}"))),
        })
    }

    fn to_byte(self) -> u8 {
        match self {
            Class::Broadcast => b'B',
            Class::Direct => b'D',
            Class::Echo => b'E',
            Class::FeatureFiltered => b'F',
            Class::Hub => b'H',
            Class::Info => b'I',
            Class::Client => b'C',
            Class::Udp => b'U',
        }
    }

    fn has_from(self) -> bool {
        matches!(self, Class::Broadcast | Class::Direct | Class::Echo | Class::FeatureFiltered)
    }

    fn has_to(self) -> bool {
        matches!(self, Class::Direct | Class::Echo)
    }

    fn has_feature_filter(self) -> bool {
        matches!(self, Class::FeatureFiltered)
    }
}

/// A 3-letter ADC verb, e.g. `INF`, `SCH`, `CTM`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Verb(pub [u8; 3]);

impl Verb {
    #[must_use]
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("???")
    }
}

impl fmt::Debug for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Named verb constants referenced by the hub session handlers.
#[allow(missing_docs)]
pub mod verb {
    use super::Verb;

    pub const SUP: Verb = Verb(*b"SUP");
    pub const SID: Verb = Verb(*b"SID");
    pub const INF: Verb = Verb(*b"INF");
    pub const MSG: Verb = Verb(*b"MSG");
    pub const SCH: Verb = Verb(*b"SCH");
    pub const RES: Verb = Verb(*b"RES");
    pub const CTM: Verb = Verb(*b"CTM");
    pub const RCM: Verb = Verb(*b"RCM");
    pub const NAT: Verb = Verb(*b"NAT");
    pub const RNT: Verb = Verb(*b"RNT");
    pub const GPA: Verb = Verb(*b"GPA");
    pub const PAS: Verb = Verb(*b"PAS");
    pub const QUI: Verb = Verb(*b"QUI");
    pub const STA: Verb = Verb(*b"STA");
    pub const CMD: Verb = Verb(*b"CMD");
    pub const GET: Verb = Verb(*b"GET");
    pub const SND: Verb = Verb(*b"SND");
    pub const TCP: Verb = Verb(*b"TCP");
    pub const ZON: Verb = Verb(*b"ZON");
    pub const ZOF: Verb = Verb(*b"ZOF");
    pub const PSR: Verb = Verb(*b"PSR");
    pub const PBD: Verb = Verb(*b"PBD");
    pub const UBD: Verb = Verb(*b"UBD");
    pub const UBN: Verb = Verb(*b"UBN");
}

/// A fully parsed ADC command: header plus ordered parameter tokens.
///
/// Parameters are kept in wire order and in their unescaped form. Most ADC
/// parameters are two-char-key-prefixed (`NIbob`, `SL3`); a handful of
/// commands (`CTM`, `RCM`, `NAT`, `RNT`, the leading `STA` message) use
/// bare positional tokens instead. Callers pick whichever accessor matches
/// the command they're handling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdcCommand {
    pub class: Class,
    pub verb: Verb,
    pub from: Option<Sid>,
    pub to: Option<Sid>,
    pub feature_filter: Option<String>,
    pub params: Vec<String>,
}

impl AdcCommand {
    /// Starts building a new command of the given class/verb.
    #[must_use]
    pub fn new(class: Class, verb: Verb) -> Self {
        Self {
            class,
            verb,
            from: None,
            to: None,
            feature_filter: None,
            params: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_from(mut self, from: Sid) -> Self {
        self.from = Some(from);
        self
    }

    #[must_use]
    pub fn with_to(mut self, to: Sid) -> Self {
        self.to = Some(to);
        self
    }

    /// Appends a raw positional token (used for `CTM`/`RCM`/`NAT`/`RNT` and
    /// the leading message of `STA`/`MSG`).
    #[must_use]
    pub fn with_positional(mut self, value: impl Into<String>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Appends a two-char-key named parameter, e.g. `("NI", "bob")` -> `NIbob`.
    #[must_use]
    pub fn with_named(mut self, key: &str, value: impl AsRef<str>) -> Self {
        debug_assert_eq!(key.len(), 2, "ADC named keys are exactly two characters");
        self.params.push(format!("{key}{}", value.as_ref()));
        self
    }

    /// Returns the value of the first named parameter with this two-char key.
    #[must_use]
    pub fn get_named(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.len() >= 2 && &p[..2] == key)
            .map(|p| &p[2..])
    }

    /// Returns every named parameter value matching this key, in wire order
    /// (used for repeatable keys like `SCH AN`).
    pub fn get_named_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> {
        self.params
            .iter()
            .filter(move |p| p.len() >= 2 && &p[..2] == key)
            .map(|p| &p[2..])
    }

    /// Returns the `n`th positional token (0-indexed) among the raw params.
    #[must_use]
    pub fn positional(&self, n: usize) -> Option<&str> {
        self.params.get(n).map(String::as_str)
    }

    /// Parses a single ADC wire line (without the trailing `\n`).
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let tokens = tokenize(line)?;
        let header = tokens
            .first()
            .ok_or_else(|| ProtocolError::Malformed("empty ADC line".into()))?;
        let header_bytes = header.as_bytes();
        if header_bytes.len() != 4 {
            return Err(ProtocolError::Malformed(format!("bad header {header:?}")));
        }
        let class = Class::from_byte(header_bytes[0])?;
        let mut verb_bytes = [0u8; 3];
        verb_bytes.copy_from_slice(&header_bytes[1..4]);
        let verb = Verb(verb_bytes);

        let mut idx = 1;
        let from = if class.has_from() {
            let sid = Sid::parse(tokens.get(idx).ok_or_else(|| {
                ProtocolError::Malformed(format!("{verb:?}: missing FROM SID"))
            })?)?;
            idx += 1;
            Some(sid)
        } else {
            None
        };
        let to = if class.has_to() {
            let sid = Sid::parse(
                tokens
                    .get(idx)
                    .ok_or_else(|| ProtocolError::Malformed(format!("{verb:?}: missing TO SID")))?,
            )?;
            idx += 1;
            Some(sid)
        } else {
            None
        };
        let feature_filter = if class.has_feature_filter() {
            let f = tokens
                .get(idx)
                .ok_or_else(|| ProtocolError::Malformed(format!("{verb:?}: missing feature filter")))?
                .clone();
            idx += 1;
            Some(f)
        } else {
            None
        };

        Ok(AdcCommand {
            class,
            verb,
            from,
            to,
            feature_filter,
            params: tokens[idx..].to_vec(),
        })
    }

    /// Serializes back to a wire line (without the trailing `\n`).
    #[must_use]
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        out.push(self.class.to_byte() as char);
        out.push_str(self.verb.as_str());
        if let Some(from) = self.from {
            out.push(' ');
            out.push_str(&from.to_base32());
        }
        if let Some(to) = self.to {
            out.push(' ');
            out.push_str(&to.to_base32());
        }
        if let Some(f) = &self.feature_filter {
            out.push(' ');
            out.push_str(f);
        }
        for p in &self.params {
            out.push(' ');
            out.push_str(&escape(p));
        }
        out
    }
}

/// Splits an ADC line into whitespace-separated tokens, honoring `\ `, `\n`,
/// `\s` and `\\` escapes so an escaped space never ends a token.
fn tokenize(line: &str) -> Result<Vec<String>, ProtocolError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(' ') | Some('s') => current.push(' '),
                    Some('n') => current.push('\n'),
                    Some('\\') => current.push('\\'),
                    Some(other) => {
                        return Err(ProtocolError::Encoding(format!(
                            "invalid escape sequence \\{other}"
                        )))
                    }
                    None => return Err(ProtocolError::Encoding("dangling backslash".into())),
                }
            }
            ' ' => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Escapes a single parameter value for the wire.
#[must_use]
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ' ' => out.push_str("\\s"),
            '\n' => out.push_str("\\n"),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binf_header() {
        let cmd = AdcCommand::parse("BINF AAAB NIbob SL3").unwrap();
        assert_eq!(cmd.class, Class::Broadcast);
        assert_eq!(cmd.verb, verb::INF);
        assert_eq!(cmd.from, Some(Sid::parse("AAAB").unwrap()));
        assert_eq!(cmd.get_named("NI"), Some("bob"));
        assert_eq!(cmd.get_named("SL"), Some("3"));
    }

    #[test]
    fn parses_direct_with_to() {
        let cmd = AdcCommand::parse("DCTM AAAB AAAC ADC/1.0 412 tok1").unwrap();
        assert_eq!(cmd.class, Class::Direct);
        assert_eq!(cmd.to, Some(Sid::parse("AAAC").unwrap()));
        assert_eq!(cmd.positional(0), Some("ADC/1.0"));
        assert_eq!(cmd.positional(1), Some("412"));
        assert_eq!(cmd.positional(2), Some("tok1"));
    }

    #[test]
    fn parses_feature_filtered() {
        let cmd = AdcCommand::parse("FSCH AAAB +TCP4-NAT0 ANfoo").unwrap();
        assert_eq!(cmd.class, Class::FeatureFiltered);
        assert_eq!(cmd.feature_filter.as_deref(), Some("+TCP4-NAT0"));
        assert_eq!(cmd.get_named("AN"), Some("foo"));
    }

    #[test]
    fn escapes_roundtrip_through_parse_and_serialize() {
        let cmd = AdcCommand::new(Class::Broadcast, verb::MSG)
            .with_from(Sid(1))
            .with_positional("hello world\\with\nnewline");
        let wire = cmd.serialize();
        let parsed = AdcCommand::parse(&wire).unwrap();
        assert_eq!(parsed, cmd);
    }

    #[test]
    fn rejects_malformed_header() {
        assert!(AdcCommand::parse("XY").is_err());
        assert!(AdcCommand::parse("ZINF").is_err());
    }

    #[test]
    fn get_named_all_collects_repeated_keys() {
        let cmd = AdcCommand::parse("BSCH AAAB ANfoo ANbar EX.mp3").unwrap();
        let ans: Vec<_> = cmd.get_named_all("AN").collect();
        assert_eq!(ans, vec!["foo", "bar"]);
    }
}

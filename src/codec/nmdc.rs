//! NMDC command parsing and the `<Client ...>` identity tag grammar (§6,
//! SPEC_FULL §10.5).
//!
//! NMDC frames are `|`-terminated (stripped by the framer before reaching
//! here). Most commands are `$Verb param1 param2`; `$MyINFO` packs its
//! fields into a fixed `$`-delimited layout that embeds the client tag
//! inside the description field.

use crate::error::ProtocolError;

/// `M:` field of the client tag: how the remote reaches the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NmdcConnMode {
    Active,
    Passive,
    Socks5,
}

impl NmdcConnMode {
    fn parse(c: char) -> Result<Self, ProtocolError> {
        match c {
            'A' => Ok(NmdcConnMode::Active),
            'P' => Ok(NmdcConnMode::Passive),
            '5' => Ok(NmdcConnMode::Socks5),
            other => Err(ProtocolError::Malformed(format!("bad NMDC M: value {other:?}"))),
        }
    }

    fn to_char(self) -> char {
        match self {
            NmdcConnMode::Active => 'A',
            NmdcConnMode::Passive => 'P',
            NmdcConnMode::Socks5 => '5',
        }
    }
}

/// The `<Client V:x,M:A|P|5,H:n/m/o,S:s>` tag carried in `$MyINFO`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientTag {
    pub client: String,
    pub version: String,
    pub mode: NmdcConnMode,
    /// Hub counts: (normal, registered, op).
    pub hubs: (u32, u32, u32),
    pub slots: u32,
}

impl ClientTag {
    /// Parses `<Client V:1.0,M:A,H:1/0/0,S:5>`.
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        let inner = s
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .ok_or_else(|| ProtocolError::Malformed(format!("bad client tag {s:?}")))?;
        let mut parts = inner.splitn(2, ' ');
        let client = parts
            .next()
            .ok_or_else(|| ProtocolError::Malformed("empty client tag".into()))?
            .to_string();
        let fields = parts.next().unwrap_or("");

        let mut version = String::new();
        let mut mode = NmdcConnMode::Passive;
        let mut hubs = (0, 0, 0);
        let mut slots = 0;

        for field in fields.split(',') {
            let Some((key, value)) = field.split_once(':') else {
                continue;
            };
            match key {
                "V" => version = value.to_string(),
                "M" => {
                    let c = value
                        .chars()
                        .next()
                        .ok_or_else(|| ProtocolError::Malformed("empty M: field".into()))?;
                    mode = NmdcConnMode::parse(c)?;
                }
                "H" => {
                    let mut nums = value.splitn(3, '/');
                    hubs = (
                        nums.next().unwrap_or("0").parse().unwrap_or(0),
                        nums.next().unwrap_or("0").parse().unwrap_or(0),
                        nums.next().unwrap_or("0").parse().unwrap_or(0),
                    );
                }
                "S" => slots = value.parse().unwrap_or(0),
                _ => {}
            }
        }

        Ok(ClientTag { client, version, mode, hubs, slots })
    }

    #[must_use]
    pub fn format(&self) -> String {
        format!(
            "<{} V:{},M:{},H:{}/{}/{},S:{}>",
            self.client,
            self.version,
            self.mode.to_char(),
            self.hubs.0,
            self.hubs.1,
            self.hubs.2,
            self.slots
        )
    }
}

/// A parsed `$MyINFO` line's fields (canonical layout, see `format_my_info`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MyInfo {
    pub nick: String,
    pub description: String,
    pub tag: Option<ClientTag>,
    pub connection: String,
    pub flag_byte: u8,
    pub email: String,
    pub share_size: u64,
}

/// Parses `$ALL nick description<tag>$ $connection\x01$email$bytes$`
/// (the `$MyINFO ` verb prefix is already stripped by the caller).
pub fn parse_my_info(payload: &str) -> Result<MyInfo, ProtocolError> {
    let payload = payload
        .strip_prefix("$ALL ")
        .ok_or_else(|| ProtocolError::Malformed("MyINFO missing $ALL".into()))?;

    let (nick, rest) = payload
        .split_once(' ')
        .ok_or_else(|| ProtocolError::Malformed("MyINFO missing nick".into()))?;

    let (desc_and_tag, rest) = rest
        .split_once("$ $")
        .ok_or_else(|| ProtocolError::Malformed("MyINFO missing $ $ separator".into()))?;

    let (description, tag) = match desc_and_tag.rfind('<') {
        Some(start) if desc_and_tag.ends_with('>') => (
            desc_and_tag[..start].to_string(),
            Some(ClientTag::parse(&desc_and_tag[start..])?),
        ),
        _ => (desc_and_tag.to_string(), None),
    };

    let mut fields = rest.splitn(3, '$');
    let connection_and_flag = fields
        .next()
        .ok_or_else(|| ProtocolError::Malformed("MyINFO missing connection field".into()))?;
    let email = fields.next().unwrap_or("").to_string();
    let share_size: u64 = fields
        .next()
        .unwrap_or("0")
        .trim_end_matches('$')
        .parse()
        .map_err(|_| ProtocolError::Malformed("MyINFO bad share size".into()))?;

    let (connection, flag_byte) = match connection_and_flag.as_bytes().last() {
        Some(&b) if b < 0x20 => (
            connection_and_flag[..connection_and_flag.len() - 1].to_string(),
            b,
        ),
        _ => (connection_and_flag.to_string(), 0),
    };

    Ok(MyInfo {
        nick: nick.to_string(),
        description,
        tag,
        connection,
        flag_byte,
        email,
        share_size,
    })
}

/// Formats a `MyInfo` back to the canonical `$MyINFO` payload (without the
/// leading `$MyINFO ` verb or trailing `|` terminator).
#[must_use]
pub fn format_my_info(info: &MyInfo) -> String {
    let tag = info.tag.as_ref().map(ClientTag::format).unwrap_or_default();
    format!(
        "$ALL {} {}{}$ $\x01{}${}${}$",
        escape(&info.nick),
        escape(&info.description),
        tag,
        info.connection,
        escape(&info.email),
        info.share_size
    )
}

/// Splits a stripped NMDC line (`$Verb rest...`) into its verb and payload.
pub fn split_command(line: &str) -> Result<(&str, &str), ProtocolError> {
    let line = line
        .strip_prefix('$')
        .ok_or_else(|| ProtocolError::Malformed(format!("NMDC line missing $: {line:?}")))?;
    Ok(match line.split_once(' ') {
        Some((verb, rest)) => (verb, rest),
        None => (line, ""),
    })
}

/// Escapes `&`, `|` and `$` per the NMDC chat/field escaping table.
#[must_use]
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '|' => out.push_str("&#124;"),
            '$' => out.push_str("&#36;"),
            c => out.push(c),
        }
    }
    out
}

/// Reverses [`escape`].
#[must_use]
pub fn unescape(value: &str) -> String {
    value.replace("&#36;", "$").replace("&#124;", "|").replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_tag() {
        let tag = ClientTag::parse("<ApexDC V:1.4.4,M:A,H:2/0/1,S:5>").unwrap();
        assert_eq!(tag.client, "ApexDC");
        assert_eq!(tag.version, "1.4.4");
        assert_eq!(tag.mode, NmdcConnMode::Active);
        assert_eq!(tag.hubs, (2, 0, 1));
        assert_eq!(tag.slots, 5);
    }

    #[test]
    fn client_tag_round_trips() {
        let tag = ClientTag {
            client: "adcore".into(),
            version: "0.1".into(),
            mode: NmdcConnMode::Passive,
            hubs: (1, 2, 3),
            slots: 4,
        };
        let formatted = tag.format();
        let parsed = ClientTag::parse(&formatted).unwrap();
        assert_eq!(parsed, tag);
    }

    #[test]
    fn splits_verb_and_payload() {
        let (verb, payload) = split_command("$MyINFO $ALL bob stuff$ $\x01$$0$").unwrap();
        assert_eq!(verb, "MyINFO");
        assert!(payload.starts_with("$ALL bob"));
    }

    #[test]
    fn parses_my_info_with_tag() {
        let payload =
            "$ALL bob a description<adcore V:0.1,M:A,H:1/0/0,S:5>$ $\x03$mail@example.com$12345$";
        let info = parse_my_info(payload).unwrap();
        assert_eq!(info.nick, "bob");
        assert_eq!(info.description, "a description");
        assert_eq!(info.tag.unwrap().slots, 5);
        assert_eq!(info.email, "mail@example.com");
        assert_eq!(info.share_size, 12345);
    }

    #[test]
    fn escape_unescape_round_trips() {
        let original = "a & b | c $ d";
        assert_eq!(unescape(&escape(original)), original);
    }
}

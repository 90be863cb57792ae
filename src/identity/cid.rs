//! CID, PID and SID — the three identifier types from §3.
//!
//! CID/PID are 24 raw bytes, base32-encoded on the wire via the standard
//! RFC4648 alphabet (`data_encoding::BASE32_NOPAD`, already used elsewhere
//! in this codebase for QR-friendly identifiers). SID is a 32-bit value
//! whose wire form is always exactly 4 characters drawn from the same
//! alphabet — each character is one 5-bit digit, so only the low 20 bits of
//! the `u32` are ever meaningful and `AAAA` decodes to exactly `0`.

use data_encoding::BASE32_NOPAD;
use sha2::{Digest as _, Sha256};
use tiger::{Digest as _, Tiger};

use crate::constants::CID_LEN;
use crate::error::ProtocolError;

const SID_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// 24-byte Client ID. Equality and hashing are on raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid(pub [u8; CID_LEN]);

/// 24-byte Private ID. Never transmitted; proves CID ownership once at login.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Pid(pub [u8; CID_LEN]);

impl Cid {
    /// Derives the CID from a PID as `Tiger(pid)`, truncated to 24 bytes.
    ///
    /// Tiger produces a 24-byte digest natively, so this is exact, not a
    /// truncation of a wider hash.
    #[must_use]
    pub fn from_pid(pid: &Pid) -> Self {
        let mut hasher = Tiger::new();
        hasher.update(pid.0);
        let digest = hasher.finalize();
        let mut out = [0u8; CID_LEN];
        out.copy_from_slice(&digest[..CID_LEN]);
        Cid(out)
    }

    /// Parses a base32-encoded CID from the wire.
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        let bytes = BASE32_NOPAD
            .decode(s.as_bytes())
            .map_err(|e| ProtocolError::Encoding(format!("bad CID base32: {e}")))?;
        if bytes.len() != CID_LEN {
            return Err(ProtocolError::Encoding(format!(
                "CID must decode to {CID_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; CID_LEN];
        out.copy_from_slice(&bytes);
        Ok(Cid(out))
    }

    /// Encodes as the base32 string sent on the wire.
    #[must_use]
    pub fn to_base32(&self) -> String {
        BASE32_NOPAD.encode(&self.0)
    }
}

impl Pid {
    /// Generates a fresh random PID.
    #[must_use]
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut out = [0u8; CID_LEN];
        rand::rng().fill_bytes(&mut out);
        Pid(out)
    }

    /// Parses a base32-encoded PID (only ever read back from local storage,
    /// never from the wire).
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        let bytes = BASE32_NOPAD
            .decode(s.as_bytes())
            .map_err(|e| ProtocolError::Encoding(format!("bad PID base32: {e}")))?;
        if bytes.len() != CID_LEN {
            return Err(ProtocolError::Encoding(format!(
                "PID must decode to {CID_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; CID_LEN];
        out.copy_from_slice(&bytes);
        Ok(Pid(out))
    }

    #[must_use]
    pub fn to_base32(&self) -> String {
        BASE32_NOPAD.encode(&self.0)
    }
}

impl std::fmt::Debug for Cid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cid({})", self.to_base32())
    }
}

// PID is intentionally not Debug-printable in full; it's a secret.
impl std::fmt::Debug for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pid(<redacted>)")
    }
}

/// 32-bit hub-session-scoped identifier. `AAAA` (`0`) is reserved for the hub.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Sid(pub u32);

impl Sid {
    /// The reserved SID denoting the hub itself.
    pub const HUB: Sid = Sid(0);

    /// Parses the 4-character wire form.
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return Err(ProtocolError::Encoding(format!(
                "SID must be exactly 4 characters, got {s:?}"
            )));
        }
        let mut value: u32 = 0;
        for &b in bytes {
            let digit = SID_ALPHABET
                .iter()
                .position(|&c| c == b.to_ascii_uppercase())
                .ok_or_else(|| ProtocolError::Encoding(format!("invalid SID character in {s:?}")))?;
            value = (value << 5) | digit as u32;
        }
        Ok(Sid(value))
    }

    /// Encodes to the 4-character wire form.
    #[must_use]
    pub fn to_base32(&self) -> String {
        let mut out = [0u8; 4];
        let mut v = self.0;
        for i in (0..4).rev() {
            out[i] = SID_ALPHABET[(v & 0x1f) as usize];
            v >>= 5;
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    /// `true` for every SID except the reserved hub SID.
    #[must_use]
    pub fn is_user(&self) -> bool {
        *self != Sid::HUB
    }
}

impl std::fmt::Debug for Sid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sid({})", self.to_base32())
    }
}

/// SHA-256-of-DER-cert keyprint, formatted `SHA256/<base32>` as advertised
/// in `INF KP` and used for TLS pinning.
#[must_use]
pub fn keyprint_of_der(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    format!("SHA256/{}", BASE32_NOPAD.encode(&digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sid_hub_is_zero() {
        assert_eq!(Sid::parse("AAAA").unwrap(), Sid::HUB);
        assert_eq!(Sid::HUB.to_base32(), "AAAA");
    }

    #[test]
    fn sid_round_trips() {
        for raw in [1u32, 42, 1_048_575, 500_000] {
            let sid = Sid(raw & 0xF_FFFF);
            let wire = sid.to_base32();
            assert_eq!(Sid::parse(&wire).unwrap(), sid);
        }
    }

    #[test]
    fn cid_from_pid_is_deterministic() {
        let pid = Pid([7u8; CID_LEN]);
        let cid1 = Cid::from_pid(&pid);
        let cid2 = Cid::from_pid(&pid);
        assert_eq!(cid1, cid2);
    }

    #[test]
    fn cid_base32_round_trips() {
        let cid = Cid([9u8; CID_LEN]);
        let wire = cid.to_base32();
        assert_eq!(Cid::parse(&wire).unwrap(), cid);
    }

    #[test]
    fn keyprint_has_expected_prefix() {
        let kp = keyprint_of_der(b"fake-der-bytes");
        assert!(kp.starts_with("SHA256/"));
    }
}

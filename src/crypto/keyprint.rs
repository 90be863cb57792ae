//! Keyprint computation and pinned verification (§4.G).
//!
//! `KP` on the wire is `SHA256/<base32(sha256(leaf_der))>`. We never
//! validate a certificate chain — every leaf is self-signed — so the only
//! trust decision is "does this leaf's keyprint match what the peer
//! advertised in its `INF`/`CINF`".

pub use crate::identity::cid::keyprint_of_der as compute;

use crate::error::CryptoError;

/// Verifies a presented leaf certificate's keyprint against the value the
/// peer advertised out-of-band (in `INF KP` / `CINF KP`).
pub fn verify(leaf_der: &[u8], expected: &str) -> Result<(), CryptoError> {
    let actual = compute(leaf_der);
    if actual == expected {
        Ok(())
    } else {
        Err(CryptoError::KeyprintMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_keyprint_verifies() {
        let der = b"pretend-der-bytes";
        let kp = compute(der);
        assert!(verify(der, &kp).is_ok());
    }

    #[test]
    fn mismatched_keyprint_is_rejected() {
        let der = b"pretend-der-bytes";
        let err = verify(der, "SHA256/WRONG").unwrap_err();
        assert!(matches!(err, CryptoError::KeyprintMismatch { .. }));
    }
}

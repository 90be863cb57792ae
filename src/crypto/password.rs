//! `GPA`/`PAS` password response hashing (§4.D).
//!
//! Response = `base32(Tiger(password ∥ salt))`. Hubs that didn't advertise
//! `TIGR` in `SUP` use a variant that additionally keys the hash to our own
//! CID, since they can't be relying on the Tiger extension's salt handling
//! alone to bind the response to us.

use data_encoding::BASE32_NOPAD;
use tiger::Tiger;
use tiger::Digest as _;

use crate::identity::Cid;

/// Computes the `PAS` response for a `GPA` salt.
///
/// `own_cid` is `Some` only when the hub lacks `TIGR` support, per the
/// legacy fallback.
#[must_use]
pub fn compute_response(password: &[u8], salt: &[u8], own_cid: Option<&Cid>) -> String {
    let mut hasher = Tiger::new();
    if let Some(cid) = own_cid {
        hasher.update(cid.0);
    }
    hasher.update(password);
    hasher.update(salt);
    BASE32_NOPAD.encode(&hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CID_LEN;

    #[test]
    fn deterministic_for_same_inputs() {
        let a = compute_response(b"hunter2", b"salt-bytes", None);
        let b = compute_response(b"hunter2", b"salt-bytes", None);
        assert_eq!(a, b);
    }

    #[test]
    fn cid_prefix_changes_response() {
        let cid = Cid([5u8; CID_LEN]);
        let without = compute_response(b"hunter2", b"salt-bytes", None);
        let with = compute_response(b"hunter2", b"salt-bytes", Some(&cid));
        assert_ne!(without, with);
    }
}

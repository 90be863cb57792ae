//! Self-signed leaf certificate generation (§4.G crypto service).
//!
//! The client's identity certificate is a fresh RSA-2048 key pair,
//! self-signed with `CN` set to the client's own CID (base32). There is no
//! CA: peers pin on the SHA-256 keyprint advertised in `INF KP`/`CINF KP`,
//! not on chain validity.

use std::fs::{self, File};
use std::io::Write as _;
use std::path::Path;

use rand::RngCore;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SerialNumber};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls_pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};

use crate::error::CryptoError;
use crate::identity::Cid;

/// Certificate lifetime, per §4.J.
const VALIDITY_DAYS: i64 = 360;

/// A freshly generated identity certificate and its private key, both DER.
pub struct GeneratedCert {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivatePkcs8KeyDer<'static>,
}

/// Generates a new self-signed RSA-2048 certificate with `CN=<cid base32>`,
/// a random 64-bit serial and a 360-day validity window.
pub fn generate_self_signed(cid: &Cid) -> Result<GeneratedCert, CryptoError> {
    let private_key = RsaPrivateKey::new(&mut rand::rng(), 2048)
        .map_err(|e| CryptoError::Certificate(format!("RSA key generation failed: {e}")))?;
    let pkcs8_der = private_key
        .to_pkcs8_der()
        .map_err(|e| CryptoError::Certificate(format!("PKCS8 encoding failed: {e}")))?;

    let key_pair = KeyPair::from_der(pkcs8_der.as_bytes())
        .map_err(|e| CryptoError::Certificate(format!("rcgen key pair import failed: {e}")))?;

    let mut params = CertificateParams::new(Vec::new())
        .map_err(|e| CryptoError::Certificate(format!("cert params failed: {e}")))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cid.to_base32());
    params.distinguished_name = dn;

    let mut serial_bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut serial_bytes);
    params.serial_number = Some(SerialNumber::from_slice(&serial_bytes));

    params.not_before = OffsetDateTime::now_utc();
    params.not_after = params.not_before + Duration::days(VALIDITY_DAYS);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CryptoError::Certificate(format!("self-signing failed: {e}")))?;

    Ok(GeneratedCert {
        cert_der: cert.der().clone(),
        key_der: PrivatePkcs8KeyDer::from(pkcs8_der.as_bytes().to_vec()),
    })
}

/// Writes `cert.der`/`key.der` under `certs_dir`, fsyncing each file and the
/// containing directory so a crash right after generation can't leave a
/// cert without its key (or vice versa).
pub fn persist(cert: &GeneratedCert, certs_dir: &Path) -> Result<(), CryptoError> {
    fs::create_dir_all(certs_dir)
        .map_err(|e| CryptoError::Certificate(format!("failed to create certs dir: {e}")))?;

    write_fsynced(&certs_dir.join("cert.der"), cert.cert_der.as_ref())?;
    write_fsynced(&certs_dir.join("key.der"), cert.key_der.secret_pkcs8_der())?;

    File::open(certs_dir)
        .and_then(|dir| dir.sync_all())
        .map_err(|e| CryptoError::Certificate(format!("failed to fsync certs dir: {e}")))?;

    Ok(())
}

fn write_fsynced(path: &Path, bytes: &[u8]) -> Result<(), CryptoError> {
    let mut file =
        File::create(path).map_err(|e| CryptoError::Certificate(format!("failed to create {}: {e}", path.display())))?;
    file.write_all(bytes)
        .map_err(|e| CryptoError::Certificate(format!("failed to write {}: {e}", path.display())))?;
    file.sync_all()
        .map_err(|e| CryptoError::Certificate(format!("failed to fsync {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CID_LEN;

    #[test]
    fn generates_nonempty_cert_and_key() {
        let cid = Cid([3u8; CID_LEN]);
        let cert = generate_self_signed(&cid).unwrap();
        assert!(!cert.cert_der.as_ref().is_empty());
        assert!(!cert.key_der.secret_pkcs8_der().is_empty());
    }

    #[test]
    fn generated_certs_have_distinct_serials() {
        let cid = Cid([4u8; CID_LEN]);
        let a = generate_self_signed(&cid).unwrap();
        let b = generate_self_signed(&cid).unwrap();
        assert_ne!(a.cert_der.as_ref(), b.cert_der.as_ref());
    }

    #[test]
    fn persist_writes_both_files_under_certs_dir() {
        let cid = Cid([5u8; CID_LEN]);
        let cert = generate_self_signed(&cid).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let certs_dir = dir.path().join("certs");

        persist(&cert, &certs_dir).unwrap();

        assert!(certs_dir.join("cert.der").exists());
        assert!(certs_dir.join("key.der").exists());
        assert_eq!(fs::read(certs_dir.join("cert.der")).unwrap(), cert.cert_der.as_ref());
    }
}

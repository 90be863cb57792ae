//! TLS context construction (§4.G), TLS 1.2+ only, self-signed leafs pinned
//! by keyprint rather than validated against a CA.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use rustls_pki_types::PrivatePkcs8KeyDer;

use crate::error::CryptoError;

use super::keyprint;

/// Builds the server-side TLS config for our own hub/peer listeners, using
/// the client's self-signed identity certificate.
pub fn server_config(
    cert_der: CertificateDer<'static>,
    key_der: PrivatePkcs8KeyDer<'static>,
) -> Result<Arc<ServerConfig>, CryptoError> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())
        .map_err(|e| CryptoError::Tls(format!("server config build failed: {e}")))?;
    Ok(Arc::new(config))
}

/// Builds the client-side TLS config used when dialing a hub or peer.
///
/// If `expected_keyprint` is set, the presented leaf must match it exactly.
/// Otherwise, when `allow_untrusted` is set, any self-signed leaf is
/// accepted (used for first-contact connections before a keyprint is
/// known); when neither applies, all leafs are rejected.
pub fn client_config(
    expected_keyprint: Option<String>,
    allow_untrusted: bool,
) -> Result<Arc<ClientConfig>, CryptoError> {
    let verifier = Arc::new(PinnedVerifier {
        expected_keyprint,
        allow_untrusted,
    });
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Never consults a CA; either pins on keyprint or accepts any self-signed
/// leaf, matching peers whose only identity proof is the CID in the
/// application-layer handshake.
#[derive(Debug)]
struct PinnedVerifier {
    expected_keyprint: Option<String>,
    allow_untrusted: bool,
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match &self.expected_keyprint {
            Some(expected) => keyprint::verify(end_entity.as_ref(), expected)
                .map(|()| ServerCertVerified::assertion())
                .map_err(|e| rustls::Error::General(e.to_string())),
            None if self.allow_untrusted => Ok(ServerCertVerified::assertion()),
            None => Err(rustls::Error::General(
                "no pinned keyprint and untrusted leafs are disabled".into(),
            )),
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

/// Empty root store, retained for callers that want a conventional
/// CA-validating config for non-peer connections (currently unused, since
/// every ADC/NMDC TLS peer is self-signed).
#[must_use]
pub fn empty_root_store() -> RootCertStore {
    RootCertStore::empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_when_no_keyprint_and_untrusted_disallowed() {
        let verifier = PinnedVerifier {
            expected_keyprint: None,
            allow_untrusted: false,
        };
        let fake_cert = CertificateDer::from(vec![1, 2, 3]);
        let result = verifier.verify_server_cert(
            &fake_cert,
            &[],
            &ServerName::try_from("example").unwrap(),
            &[],
            UnixTime::now(),
        );
        assert!(result.is_err());
    }
}

//! Typed errors at the crate's internal seams.
//!
//! `anyhow` is reserved for the binary entry point and other OS-facing glue
//! (see `main.rs`, `config.rs`); everything a caller might want to match on
//! gets its own `thiserror` enum here, one per §7 error-table row family.

use thiserror::Error;

/// Errors raised while parsing or serializing wire commands (ADC or NMDC).
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame could not be tokenized at all (missing header, bad class byte).
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// A required feature was absent from the peer's advertised support set.
    #[error("missing required feature: {0}")]
    MissingFeature(String),

    /// The hub sent a command we don't recognize and can't safely ignore.
    #[error("unsupported command: {0}")]
    Unsupported(String),

    /// An escape sequence or base32 payload failed to decode.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The hub reported a `STA` error status.
    #[error("hub status error [{code}]: {message}")]
    HubStatus {
        /// Numeric STA code, e.g. 240 for `ERROR_BAD_PASSWORD`.
        code: u16,
        /// Human-readable message from the hub.
        message: String,
    },
}

/// Errors from establishing or maintaining a hub or peer connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Transient I/O failure; caller should retry with backoff.
    #[error("transient I/O error: {0}")]
    Transient(#[source] std::io::Error),

    /// Permanent I/O failure (DNS failure, reset during handshake, etc).
    /// CQI error count should be set to -1 (no auto-retry) when this fires
    /// mid-handshake.
    #[error("permanent I/O error: {0}")]
    Permanent(#[source] std::io::Error),

    /// TLS is required by policy but not available (no cert, peer doesn't
    /// support `ADCS`/`ADC0`, or keyprint mismatch).
    #[error("TLS required but unavailable: {0}")]
    TlsRequired(String),

    /// The requested protocol token isn't one we understand.
    #[error("unsupported protocol: {0}")]
    ProtocolUnsupported(String),

    /// The call was made while the session/connection was in a state that
    /// doesn't allow it (e.g. connect() before NORMAL).
    #[error("bad state for operation: {0}")]
    BadState(String),

    /// The outbox hook rejected the frame before it was sent.
    #[error("rejected by outbox hook: {0}")]
    HookRejected(String),

    /// A feature required for this operation (e.g. `CCPM`, `NAT0`) wasn't
    /// advertised by the remote or the local hub session.
    #[error("required feature missing: {0}")]
    FeatureMissing(String),

    /// Generic protocol-level failure with no more specific variant.
    #[error("protocol error: {0}")]
    Generic(String),
}

/// Errors from the crypto service (TLS contexts, certs, keyprints, SUDP).
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Certificate generation or loading failed.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// The leaf certificate's keyprint didn't match the expected `KP` value.
    #[error("keyprint mismatch: expected {expected}, got {actual}")]
    KeyprintMismatch {
        /// Keyprint advertised in the peer's `INF`.
        expected: String,
        /// Keyprint actually observed on the TLS leaf certificate.
        actual: String,
    },

    /// SUDP payload failed to decrypt or was malformed.
    #[error("SUDP decrypt failed: {0}")]
    SudpDecrypt(String),

    /// TLS context construction failed.
    #[error("TLS context error: {0}")]
    Tls(String),
}

/// Errors from the port-mapper backends.
#[derive(Debug, Error)]
pub enum PortMapError {
    /// No backend succeeded.
    #[error("all port-mapper backends failed")]
    NoBackend,

    /// The specific backend's gateway discovery or request failed.
    #[error("{backend} backend failed: {message}")]
    Backend {
        /// Backend name (`"upnp"`, `"nat-pmp"`).
        backend: &'static str,
        /// Failure detail.
        message: String,
    },
}

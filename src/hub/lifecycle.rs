//! Hub connect/shutdown orchestration (§4.D): resolves a hub URL, opens the
//! transport (plain or TLS), and wires a [`BufferedSocket`] to a freshly
//! spawned session worker.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::constants::{DEFAULT_ADC_PORT, DEFAULT_NMDC_PORT};
use crate::crypto::tls;
use crate::error::ConnectError;
use crate::hub::adc_session::{AdcHubSession, LocalIdentity};
use crate::hub::events::HubEvent;
use crate::hub::nmdc_session::NmdcHubSession;
use crate::hub::outbox::{HookChain, OutgoingHubCommandHook};
use crate::hub::workers::{self, HubHandle};
use crate::hub::AnyHubSession;
use crate::identity::{Cid, Pid};
use crate::socket::{AsyncStream, BufferedSocket};

/// Everything [`connect`] needs to establish and log into a hub.
#[derive(Clone, Debug)]
pub struct HubConnectOptions {
    pub url: String,
    pub nick: String,
    pub own_cid: Cid,
    pub own_pid: Pid,
    pub password: Option<String>,
    /// Pinned keyprint from a prior `INF KP`, if we've connected before.
    pub expected_keyprint: Option<String>,
    /// `Config`-derived identity fields for the first outbound `INF`
    /// (§4.D). ADC-only; ignored for NMDC sessions, which build their own
    /// `$MyINFO` from `nick` plus their own defaults.
    pub local_identity: LocalIdentity,
}

struct ParsedHubUrl {
    adc: bool,
    secure: bool,
    host: String,
    port: u16,
}

fn parse_hub_url(url: &str) -> Result<ParsedHubUrl, ConnectError> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| ConnectError::BadState(format!("hub URL missing scheme: {url}")))?;
    let (adc, secure) = match scheme {
        "adc" => (true, false),
        "adcs" => (true, true),
        "dchub" | "nmdc" => (false, false),
        "nmdcs" => (false, true),
        other => return Err(ConnectError::ProtocolUnsupported(other.to_string())),
    };
    let rest = rest.trim_end_matches('/');
    let default_port = if adc { DEFAULT_ADC_PORT } else { DEFAULT_NMDC_PORT };
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port_str)) => {
            let port: u16 = port_str
                .parse()
                .map_err(|_| ConnectError::BadState(format!("bad port in hub URL: {url}")))?;
            (host.to_string(), port)
        }
        None => (rest.to_string(), default_port),
    };
    Ok(ParsedHubUrl { adc, secure, host, port })
}

/// Connects to a hub, performs no protocol handshake itself (the session
/// reducer does that once the socket reports `Connected`), and returns a
/// handle plus the event stream.
pub async fn connect(
    opts: HubConnectOptions,
    extra_hooks: Vec<Box<dyn OutgoingHubCommandHook>>,
) -> Result<(HubHandle, tokio::sync::mpsc::Receiver<HubEvent>), ConnectError> {
    let parsed = parse_hub_url(&opts.url)?;

    let tcp = TcpStream::connect((parsed.host.as_str(), parsed.port))
        .await
        .map_err(ConnectError::Transient)?;
    let _ = tcp.set_nodelay(true);

    let stream: Box<dyn AsyncStream> = if parsed.secure {
        let config = tls::client_config(opts.expected_keyprint.clone(), opts.expected_keyprint.is_none())
            .map_err(|e| ConnectError::TlsRequired(e.to_string()))?;
        let connector = TlsConnector::from(Arc::clone(&config));
        let server_name = rustls_pki_types::ServerName::try_from(parsed.host.clone())
            .map_err(|e| ConnectError::TlsRequired(e.to_string()))?;
        let tls_stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(ConnectError::Permanent)?;
        Box::new(tls_stream)
    } else {
        Box::new(tcp)
    };

    let separator = if parsed.adc { b'\n' } else { b'|' };
    let (socket, socket_events) = BufferedSocket::spawn(stream, separator);

    let mut hook_chain = HookChain::new();
    let session = if parsed.adc {
        let mut session = AdcHubSession::new(opts.url.clone(), opts.own_cid, opts.own_pid);
        let mut identity = opts.local_identity.clone();
        if identity.nick.is_empty() {
            identity.nick = opts.nick.clone();
        }
        session.set_local_identity(identity);
        hook_chain.push(Box::new(session.own_sid_stamp()));
        hook_chain.push(Box::new(session.forbidden_commands()));
        AnyHubSession::Adc(session)
    } else {
        let mut session = NmdcHubSession::new(opts.url.clone(), opts.nick.clone(), opts.password.clone());
        session.set_local_identity(opts.local_identity.clone());
        AnyHubSession::Nmdc(session)
    };
    for hook in extra_hooks {
        hook_chain.push(hook);
    }

    Ok(workers::spawn(session, socket, socket_events, hook_chain))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_adc_url_with_default_port() {
        let parsed = parse_hub_url("adc://hub.example.org").unwrap();
        assert!(parsed.adc);
        assert!(!parsed.secure);
        assert_eq!(parsed.port, DEFAULT_ADC_PORT);
    }

    #[test]
    fn parses_adcs_url_with_explicit_port() {
        let parsed = parse_hub_url("adcs://hub.example.org:5555").unwrap();
        assert!(parsed.secure);
        assert_eq!(parsed.port, 5555);
    }

    #[test]
    fn parses_legacy_dchub_scheme() {
        let parsed = parse_hub_url("dchub://hub.example.org").unwrap();
        assert!(!parsed.adc);
        assert_eq!(parsed.port, DEFAULT_NMDC_PORT);
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(parse_hub_url("ftp://hub.example.org").is_err());
    }
}

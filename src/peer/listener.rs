//! Peer socket plumbing (§4.G listeners, §4.G.i connect): two per-family
//! TCP acceptors (plain + TLS) feeding the handshake reducers, plus the
//! outbound dialer used for both ordinary `CTM` connects and NAT-traversal
//! dials. One worker task per connection, matching the hub session's
//! one-task-per-socket convention.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::crypto::tls;
use crate::error::ConnectError;
use crate::identity::Cid;
use crate::socket::{AsyncStream, BufferedSocket, SocketEvent};

use super::handshake::{AdcPeerHandshake, NmdcPeerHandshake, PeerAction, Role};

/// Outcome of a completed (or failed) peer handshake, surfaced to whatever
/// owns the [`PeerManager`](super::PeerManager) so it can fold the result
/// back into the CQI/slot bookkeeping.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Resolved { role: Role, remote_cid: Option<Cid>, token: Option<String>, private_message: bool },
    Failed(String),
}

/// Cloneable handle to a running peer connection worker.
#[derive(Clone)]
pub struct PeerHandle {
    socket: BufferedSocket,
}

impl PeerHandle {
    pub async fn shutdown(&self) {
        self.socket.shutdown().await;
    }
}

/// Dials out to `addr` for an ADC peer connection (ordinary `CTM` connect,
/// or the second leg of a NAT-traversal dial) and drives the handshake.
pub async fn dial_adc(
    addr: SocketAddr,
    secure: bool,
    token: String,
    hub_url: String,
    own_cid: Cid,
) -> Result<(PeerHandle, tokio::sync::mpsc::Receiver<PeerEvent>), ConnectError> {
    let tcp = TcpStream::connect(addr).await.map_err(ConnectError::Transient)?;
    let _ = tcp.set_nodelay(true);

    let stream: Box<dyn AsyncStream> = if secure {
        let config = tls::client_config(None, true).map_err(|e| ConnectError::TlsRequired(e.to_string()))?;
        let connector = TlsConnector::from(config);
        let server_name = rustls_pki_types::ServerName::IpAddress(addr.ip().into());
        let tls_stream = connector.connect(server_name, tcp).await.map_err(ConnectError::Permanent)?;
        Box::new(tls_stream)
    } else {
        Box::new(tcp)
    };

    let handshake = AdcPeerHandshake::new(false, token, hub_url, own_cid);
    Ok(spawn_adc_worker(stream, handshake))
}

/// Dials out for an NMDC peer connection.
pub async fn dial_nmdc(
    addr: SocketAddr,
    secure: bool,
    own_nick: String,
    wants_download: bool,
    our_number: u32,
) -> Result<(PeerHandle, tokio::sync::mpsc::Receiver<PeerEvent>), ConnectError> {
    let tcp = TcpStream::connect(addr).await.map_err(ConnectError::Transient)?;
    let _ = tcp.set_nodelay(true);

    let stream: Box<dyn AsyncStream> = if secure {
        let config = tls::client_config(None, true).map_err(|e| ConnectError::TlsRequired(e.to_string()))?;
        let connector = TlsConnector::from(config);
        let server_name = rustls_pki_types::ServerName::IpAddress(addr.ip().into());
        let tls_stream = connector.connect(server_name, tcp).await.map_err(ConnectError::Permanent)?;
        Box::new(tls_stream)
    } else {
        Box::new(tcp)
    };

    let handshake = NmdcPeerHandshake::new(false, own_nick, wants_download, our_number);
    Ok(spawn_nmdc_worker(stream, handshake))
}

fn spawn_adc_worker(
    stream: Box<dyn AsyncStream>,
    mut handshake: AdcPeerHandshake,
) -> (PeerHandle, tokio::sync::mpsc::Receiver<PeerEvent>) {
    let (socket, mut socket_events) = BufferedSocket::spawn(stream, b'\n');
    let (evt_tx, evt_rx) = tokio::sync::mpsc::channel(16);
    let worker_socket = socket.clone();

    tokio::spawn(async move {
        while let Some(evt) = socket_events.recv().await {
            let actions = match evt {
                SocketEvent::Connected => handshake.on_connected(),
                SocketEvent::Line(line) => match crate::codec::AdcCommand::parse(&line) {
                    Ok(cmd) => handshake.handle(&cmd),
                    Err(e) => vec![PeerAction::Disconnect(e.to_string())],
                },
                SocketEvent::Binary(_) => continue,
                SocketEvent::Failed(reason) => {
                    let _ = evt_tx.send(PeerEvent::Failed(reason)).await;
                    break;
                }
            };
            if !apply_peer_actions(actions, &worker_socket, &evt_tx, handshake.remote_cid, handshake.private_message).await {
                break;
            }
        }
        worker_socket.shutdown().await;
    });

    (PeerHandle { socket }, evt_rx)
}

fn spawn_nmdc_worker(
    stream: Box<dyn AsyncStream>,
    mut handshake: NmdcPeerHandshake,
) -> (PeerHandle, tokio::sync::mpsc::Receiver<PeerEvent>) {
    let (socket, mut socket_events) = BufferedSocket::spawn(stream, b'|');
    let (evt_tx, evt_rx) = tokio::sync::mpsc::channel(16);
    let worker_socket = socket.clone();

    tokio::spawn(async move {
        while let Some(evt) = socket_events.recv().await {
            let actions = match evt {
                SocketEvent::Connected => handshake.on_connected(),
                SocketEvent::Line(line) => {
                    let (verb, payload) = split_nmdc_command(&line);
                    handshake.handle(verb, payload)
                }
                SocketEvent::Binary(_) => continue,
                SocketEvent::Failed(reason) => {
                    let _ = evt_tx.send(PeerEvent::Failed(reason)).await;
                    break;
                }
            };
            if !apply_peer_actions(actions, &worker_socket, &evt_tx, None, false).await {
                break;
            }
        }
        worker_socket.shutdown().await;
    });

    (PeerHandle { socket }, evt_rx)
}

fn split_nmdc_command(line: &str) -> (&str, &str) {
    let rest = line.strip_prefix('$').unwrap_or(line);
    match rest.split_once(' ') {
        Some((verb, payload)) => (verb, payload),
        None => (rest, ""),
    }
}

async fn apply_peer_actions(
    actions: Vec<PeerAction>,
    socket: &BufferedSocket,
    evt_tx: &tokio::sync::mpsc::Sender<PeerEvent>,
    remote_cid: Option<Cid>,
    private_message: bool,
) -> bool {
    for action in actions {
        match action {
            PeerAction::SendAdc(cmd) => {
                if socket.send_line(cmd.serialize()).await.is_err() {
                    return false;
                }
            }
            PeerAction::SendNmdc(line) => {
                if socket.send_line(line).await.is_err() {
                    return false;
                }
            }
            PeerAction::Resolved(role) => {
                let _ = evt_tx
                    .send(PeerEvent::Resolved { role, remote_cid, token: None, private_message })
                    .await;
            }
            PeerAction::Disconnect(reason) => {
                let _ = evt_tx.send(PeerEvent::Failed(reason)).await;
                return false;
            }
        }
    }
    true
}

/// One per-family, per-scheme TCP acceptor. Runs until [`shutdown`](Self::shutdown)
/// is called; every accepted socket is handed to its own handshake worker.
pub struct PeerListener {
    shutting_down: Arc<AtomicBool>,
}

type Resolved = (PeerHandle, tokio::sync::mpsc::Receiver<PeerEvent>);

impl PeerListener {
    /// Binds `addr` for inbound ADC peer connections. `tls_acceptor` is
    /// `None` for the plain-TCP listener, `Some` for the TLS one.
    pub async fn bind_adc(
        addr: SocketAddr,
        tls_acceptor: Option<TlsAcceptor>,
        own_cid: Cid,
        on_resolved: tokio::sync::mpsc::Sender<Resolved>,
    ) -> Result<(Self, u16), ConnectError> {
        let (listener, bound_port, shutting_down, flag) = bind_raw(addr).await?;
        tokio::spawn(async move {
            while let Some(stream) = accept_one(&listener, &tls_acceptor, &flag).await {
                let resolved = spawn_adc_worker(stream, AdcPeerHandshake::new(true, String::new(), String::new(), own_cid));
                if on_resolved.send(resolved).await.is_err() {
                    break;
                }
            }
        });
        Ok((Self { shutting_down }, bound_port))
    }

    /// Binds `addr` for inbound NMDC peer connections.
    pub async fn bind_nmdc(
        addr: SocketAddr,
        tls_acceptor: Option<TlsAcceptor>,
        own_nick: String,
        on_resolved: tokio::sync::mpsc::Sender<Resolved>,
    ) -> Result<(Self, u16), ConnectError> {
        let (listener, bound_port, shutting_down, flag) = bind_raw(addr).await?;
        tokio::spawn(async move {
            while let Some(stream) = accept_one(&listener, &tls_acceptor, &flag).await {
                let resolved = spawn_nmdc_worker(stream, NmdcPeerHandshake::new(true, own_nick.clone(), false, 0));
                if on_resolved.send(resolved).await.is_err() {
                    break;
                }
            }
        });
        Ok((Self { shutting_down }, bound_port))
    }

    /// Requests shutdown; the accept task observes this within one poll tick.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }
}

async fn bind_raw(addr: SocketAddr) -> Result<(TcpListener, u16, Arc<AtomicBool>, Arc<AtomicBool>), ConnectError> {
    let listener = TcpListener::bind(addr).await.map_err(ConnectError::Transient)?;
    let bound_port = listener.local_addr().map_err(ConnectError::Transient)?.port();
    let shutting_down = Arc::new(AtomicBool::new(false));
    let flag = shutting_down.clone();
    Ok((listener, bound_port, shutting_down, flag))
}

/// Accepts the next connection, applying the TLS handshake if configured.
/// Returns `None` once shutdown has been requested.
async fn accept_one(
    listener: &TcpListener,
    tls_acceptor: &Option<TlsAcceptor>,
    shutting_down: &AtomicBool,
) -> Option<Box<dyn AsyncStream>> {
    loop {
        if shutting_down.load(Ordering::Acquire) {
            return None;
        }
        let accepted = tokio::select! {
            result = listener.accept() => result,
            () = tokio::time::sleep(crate::constants::CANCEL_POLL_INTERVAL) => continue,
        };
        let Ok((tcp, _peer_addr)) = accepted else { continue };
        let _ = tcp.set_nodelay(true);

        return Some(if let Some(acceptor) = tls_acceptor.clone() {
            match acceptor.accept(tcp).await {
                Ok(tls_stream) => Box::new(tls_stream),
                Err(e) => {
                    log::warn!("peer TLS accept failed: {e}");
                    continue;
                }
            }
        } else {
            Box::new(tcp)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_nmdc_command_separates_verb_and_payload() {
        assert_eq!(split_nmdc_command("$MyNick bob"), ("MyNick", "bob"));
        assert_eq!(split_nmdc_command("$Key abc123"), ("Key", "abc123"));
        assert_eq!(split_nmdc_command("$Supports"), ("Supports", ""));
    }
}

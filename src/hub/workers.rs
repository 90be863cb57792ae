//! Drives one hub session's reducer against a live [`BufferedSocket`] (§5).
//!
//! One task per hub, mirroring the crate's one-task-per-socket convention.
//! Inbound [`SocketEvent`]s are fed through the session's reducer; the
//! resulting [`Action`]s are applied against the socket and the owner's
//! event channel. External callers talk to the task through [`HubHandle`].

use tokio::sync::mpsc;

use crate::hub::adc_session::Action;
use crate::hub::events::HubEvent;
use crate::hub::outbox::HookChain;
use crate::hub::{AnyHubSession, ConnectTarget};
use crate::socket::{BufferedSocket, SocketEvent};

/// Commands a [`HubHandle`] can send into the running worker.
#[derive(Debug)]
pub enum HubCommand {
    /// Responds to a pending `GPA` challenge (ADC) — ignored on NMDC
    /// sessions, which send their password eagerly from `$GetPass`.
    SubmitPassword(Vec<u8>),
    /// Sends a raw pre-built frame, post-hook-chain (used for user-initiated
    /// chat and searches).
    SendFrame(Action),
    /// Records our peer listener's bound plain-TCP port.
    SetLocalPort(u16),
    /// Asks the session to initiate a peer connection (§4.F `connect()`),
    /// on behalf of the client registry / peer connection manager.
    RequestConnect {
        target: ConnectTarget,
        my_ip: String,
        token: String,
    },
    Disconnect,
}

/// Cloneable handle to a running hub worker task.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl std::fmt::Debug for HubHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubHandle").finish_non_exhaustive()
    }
}

impl HubHandle {
    pub async fn submit_password(&self, password: Vec<u8>) {
        let _ = self.tx.send(HubCommand::SubmitPassword(password)).await;
    }

    pub async fn send(&self, action: Action) {
        let _ = self.tx.send(HubCommand::SendFrame(action)).await;
    }

    pub async fn set_local_port(&self, port: u16) {
        let _ = self.tx.send(HubCommand::SetLocalPort(port)).await;
    }

    pub async fn request_connect(&self, target: ConnectTarget, my_ip: String, token: String) {
        let _ = self
            .tx
            .send(HubCommand::RequestConnect { target, my_ip, token })
            .await;
    }

    pub async fn disconnect(&self) {
        let _ = self.tx.send(HubCommand::Disconnect).await;
    }
}

#[cfg(test)]
impl HubHandle {
    /// A handle with no worker behind it, for tests that only need to
    /// observe which commands a caller sends.
    #[must_use]
    pub(crate) fn for_test() -> (Self, mpsc::Receiver<HubCommand>) {
        let (tx, rx) = mpsc::channel(64);
        (Self { tx }, rx)
    }
}

/// Spawns the worker task and returns a handle plus the event stream.
pub fn spawn(
    session: AnyHubSession,
    socket: BufferedSocket,
    socket_events: mpsc::Receiver<SocketEvent>,
    hook_chain: HookChain,
) -> (HubHandle, mpsc::Receiver<HubEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (evt_tx, evt_rx) = mpsc::channel(256);

    tokio::spawn(run(session, socket, socket_events, cmd_rx, evt_tx, hook_chain));

    (HubHandle { tx: cmd_tx }, evt_rx)
}

async fn run(
    mut session: AnyHubSession,
    socket: BufferedSocket,
    mut socket_events: mpsc::Receiver<SocketEvent>,
    mut cmd_rx: mpsc::Receiver<HubCommand>,
    evt_tx: mpsc::Sender<HubEvent>,
    hook_chain: HookChain,
) {
    loop {
        tokio::select! {
            biased;

            evt = socket_events.recv() => {
                let Some(evt) = evt else { break };
                let actions = match evt {
                    SocketEvent::Connected => session.on_connected(),
                    SocketEvent::Line(line) => session.handle_line(&line),
                    SocketEvent::Binary(bytes) => {
                        vec![Action::Event(HubEvent::StatusMessage(format!(
                            "received {} unsolicited binary bytes",
                            bytes.len()
                        )))]
                    }
                    SocketEvent::Failed(reason) => {
                        let _ = evt_tx.send(HubEvent::Failed { reason }).await;
                        break;
                    }
                };
                if !apply_all(actions, &socket, &evt_tx, &hook_chain).await {
                    break;
                }
            }

            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    HubCommand::SubmitPassword(password) => {
                        if let Some(action) = session.submit_password(&password) {
                            if !apply_all(vec![action], &socket, &evt_tx, &hook_chain).await {
                                break;
                            }
                        }
                    }
                    HubCommand::SendFrame(action) => {
                        if !apply_all(vec![action], &socket, &evt_tx, &hook_chain).await {
                            break;
                        }
                    }
                    HubCommand::SetLocalPort(port) => session.set_local_port(port),
                    HubCommand::RequestConnect { target, my_ip, token } => {
                        let actions = session.request_connect(&target, &my_ip, &token);
                        if !apply_all(actions, &socket, &evt_tx, &hook_chain).await {
                            break;
                        }
                    }
                    HubCommand::Disconnect => {
                        socket.shutdown().await;
                        break;
                    }
                }
            }
        }
    }

    socket.shutdown().await;
}

/// Applies a batch of actions in order; returns `false` if the session
/// should stop (a `Disconnect` action, or a send that failed because the
/// socket already hung up).
async fn apply_all(
    actions: Vec<Action>,
    socket: &BufferedSocket,
    evt_tx: &mpsc::Sender<HubEvent>,
    hook_chain: &HookChain,
) -> bool {
    for action in actions {
        match action {
            Action::Send(cmd) => match hook_chain.run(cmd) {
                Ok(cmd) => {
                    if socket.send_line(cmd.serialize()).await.is_err() {
                        return false;
                    }
                }
                Err(e) => {
                    let _ = evt_tx
                        .send(HubEvent::StatusMessage(format!("outbound frame rejected: {e}")))
                        .await;
                }
            },
            Action::SendNmdc(line) => {
                if socket.send_line(line).await.is_err() {
                    return false;
                }
            }
            Action::SendBinary(bytes) => {
                if socket.send_raw(bytes).await.is_err() {
                    return false;
                }
            }
            Action::EnableZpipe => {
                let _ = socket.enable_zpipe().await;
            }
            Action::DisableZpipe => {
                let _ = socket.disable_zpipe().await;
            }
            Action::ExpectBinary(n) => {
                let _ = socket.expect_binary(n).await;
            }
            Action::Event(event) => {
                if evt_tx.send(event).await.is_err() {
                    return false;
                }
            }
            Action::Connect(req) => {
                if evt_tx.send(HubEvent::ConnectRequested(req)).await.is_err() {
                    return false;
                }
            }
            Action::Disconnect => return false,
        }
    }
    true
}

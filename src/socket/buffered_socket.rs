//! Per-connection buffered socket worker (§5: one worker per socket).
//!
//! Owns the transport (plain TCP or TLS, boxed behind [`AsyncStream`]) and a
//! [`FrameSplitter`]. Reads are pushed through the splitter and surfaced as
//! [`SocketEvent`]s on an mpsc channel; writes arrive as [`SocketCommand`]s
//! from the cloneable [`BufferedSocket`] handle. Shutdown is a monotonic
//! flag polled every tick, matching the crate's general cancellation style.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::codec::FrameSplitter;

use super::events::{SocketCommand, SocketEvent};

/// Object-safe alias for anything the socket worker can read/write —
/// `TcpStream` or `tokio_rustls::{Client,Server}TlsStream`.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Cloneable handle to a running socket worker.
#[derive(Clone)]
pub struct BufferedSocket {
    tx: mpsc::Sender<SocketCommand>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for BufferedSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedSocket")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl BufferedSocket {
    /// Spawns the worker task over an already-connected transport and
    /// returns a handle plus the event stream.
    pub fn spawn(
        stream: Box<dyn AsyncStream>,
        separator: u8,
    ) -> (Self, mpsc::Receiver<SocketEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (evt_tx, evt_rx) = mpsc::channel(256);
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(worker_loop(stream, separator, cmd_rx, evt_tx, closed.clone()));

        (Self { tx: cmd_tx, closed }, evt_rx)
    }

    /// Queues a text line for send; the worker appends the separator byte.
    pub async fn send_line(&self, line: impl Into<String>) -> Result<(), SendError> {
        self.tx
            .send(SocketCommand::SendLine(line.into()))
            .await
            .map_err(|_| SendError)
    }

    /// Queues raw bytes for send, unframed (used for binary payloads such
    /// as a `SND blom` body).
    pub async fn send_raw(&self, bytes: Vec<u8>) -> Result<(), SendError> {
        self.tx.send(SocketCommand::SendRaw(bytes)).await.map_err(|_| SendError)
    }

    pub async fn enable_zpipe(&self) -> Result<(), SendError> {
        self.tx.send(SocketCommand::EnableZpipe).await.map_err(|_| SendError)
    }

    pub async fn disable_zpipe(&self) -> Result<(), SendError> {
        self.tx.send(SocketCommand::DisableZpipe).await.map_err(|_| SendError)
    }

    /// Switches the splitter to deliver exactly `n` bytes as one
    /// `SocketEvent::Binary` before returning to line mode.
    pub async fn expect_binary(&self, n: usize) -> Result<(), SendError> {
        self.tx.send(SocketCommand::ExpectBinary(n)).await.map_err(|_| SendError)
    }

    /// Requests a clean shutdown of the worker task.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(SocketCommand::Shutdown).await;
        self.closed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// The channel side closed; the worker has already exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendError;

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "socket worker has already shut down")
    }
}

impl std::error::Error for SendError {}

async fn worker_loop(
    mut stream: Box<dyn AsyncStream>,
    separator: u8,
    mut cmd_rx: mpsc::Receiver<SocketCommand>,
    evt_tx: mpsc::Sender<SocketEvent>,
    closed: Arc<AtomicBool>,
) {
    let mut splitter = FrameSplitter::new(separator);
    let mut read_buf = [0u8; 8192];

    let _ = evt_tx.send(SocketEvent::Connected).await;

    loop {
        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SocketCommand::SendLine(line)) => {
                        let mut framed = line.into_bytes();
                        framed.push(separator);
                        if let Err(e) = stream.write_all(&framed).await {
                            log::warn!("socket write failed: {e}");
                            let _ = evt_tx.send(SocketEvent::Failed(e.to_string())).await;
                            break;
                        }
                    }
                    Some(SocketCommand::SendRaw(bytes)) => {
                        if let Err(e) = stream.write_all(&bytes).await {
                            log::warn!("socket write failed: {e}");
                            let _ = evt_tx.send(SocketEvent::Failed(e.to_string())).await;
                            break;
                        }
                    }
                    Some(SocketCommand::EnableZpipe) => splitter.enable_zpipe(),
                    Some(SocketCommand::DisableZpipe) => splitter.disable_zpipe(),
                    Some(SocketCommand::ExpectBinary(n)) => splitter.expect_binary(n),
                    Some(SocketCommand::Shutdown) | None => break,
                }
            }

            read = stream.read(&mut read_buf) => {
                match read {
                    Ok(0) => {
                        let _ = evt_tx.send(SocketEvent::Failed("connection closed".into())).await;
                        break;
                    }
                    Ok(n) => {
                        match splitter.push(&read_buf[..n]) {
                            Ok(frames) => {
                                for frame in frames {
                                    if evt_tx.send(frame.into()).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                log::warn!("frame decode error: {e}");
                                let _ = evt_tx.send(SocketEvent::Failed(e.to_string())).await;
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("socket read failed: {e}");
                        let _ = evt_tx.send(SocketEvent::Failed(e.to_string())).await;
                        break;
                    }
                }
            }
        }
    }

    closed.store(true, Ordering::Release);
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn sends_line_with_separator() {
        let (client, mut server) = duplex(1024);
        let (socket, _events) = BufferedSocket::spawn(Box::new(client), b'\n');

        socket.send_line("BINF AAAA").await.unwrap();

        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"BINF AAAA\n");
    }

    #[tokio::test]
    async fn surfaces_connected_then_line_events() {
        let (client, mut server) = duplex(1024);
        let (_socket, mut events) = BufferedSocket::spawn(Box::new(client), b'\n');

        server.write_all(b"ISID AAAB\n").await.unwrap();

        assert!(matches!(events.recv().await, Some(SocketEvent::Connected)));
        match events.recv().await {
            Some(SocketEvent::Line(line)) => assert_eq!(line, "ISID AAAB"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn shutdown_closes_worker() {
        let (client, _server) = duplex(1024);
        let (socket, mut events) = BufferedSocket::spawn(Box::new(client), b'\n');
        socket.shutdown().await;
        assert!(socket.is_closed());
        // Draining the channel should eventually end (worker exited).
        while events.recv().await.is_some() {}
    }
}

//! Buffered per-connection socket worker (§4.A framing owner, §5 concurrency
//! model: one worker per socket).

pub mod buffered_socket;
pub mod events;

pub use buffered_socket::{AsyncStream, BufferedSocket, SendError};
pub use events::SocketEvent;

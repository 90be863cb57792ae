//! Client registry (§4.F): the top-level owner of every hub session and
//! the CID-interned identity table they share.

pub mod registry;
pub mod types;

pub use registry::ClientRegistry;
pub use types::{ConnectKind, HintedUser};

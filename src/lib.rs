// Library modules
pub mod client;
pub mod codec;
pub mod config;
pub mod connectivity;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod hbri;
pub mod hub;
pub mod identity;
pub mod peer;
pub mod socket;

// Re-export commonly used types
pub use client::{ClientRegistry, ConnectKind, HintedUser};
pub use config::Config;
pub use connectivity::{AddressFamily, ConnectivityManager, ReachabilityState};
pub use error::{ConnectError, CryptoError, PortMapError, ProtocolError};
pub use hbri::{HbriCancel, HbriOutcome, HbriRequest};
pub use hub::{AdcHubSession, ConnectTarget, HubConnectOptions, HubEvent, HubHandle, LocalIdentity, NmdcHubSession};
pub use identity::{Cid, OnlineUser, Pid, Sid, User};
pub use peer::{PeerManager, PeerManagerAction, QueueProvider};

//! Identity model: CID/PID/SID identifiers, the globally-interned `User`,
//! and the per-hub `OnlineUser` binding (§3).

pub mod cid;
pub mod online_user;
pub mod user;

pub use cid::{keyprint_of_der, Cid, Pid, Sid};
pub use online_user::{ConnectMode, Identity, OnlineUser};
pub use user::{User, UserFlags};

//! Pluggable port-mapper backend trait (§4.H/I), plus the ordered list of
//! backends a [`super::ConnectivityManager`] tries in turn.

use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::error::PortMapError;

/// Transport a mapping request is made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// One port to map: local port plus a human-readable description used by
/// backends that surface it to the router's admin UI.
#[derive(Debug, Clone)]
pub struct MappingRequest {
    pub local_port: u16,
    pub protocol: Protocol,
    pub description: &'static str,
}

/// A backend capable of requesting port forwards from the local gateway.
/// Mirrors `Mapper`: `init`/`open`/`close`/`getExternalIP`/`renewal`.
#[async_trait]
pub trait PortMapperBackend: Send + Sync {
    /// Stable name, used for the user-facing "preferred mapper" setting.
    fn name(&self) -> &'static str;

    /// Discovers the gateway. Must succeed before `open`/`close` are called.
    async fn init(&mut self) -> Result<(), PortMapError>;

    /// Requests a forward for one port. Called once per port to map.
    async fn open(&mut self, req: &MappingRequest) -> Result<(), PortMapError>;

    /// Tears down every mapping this instance opened.
    async fn close(&mut self) -> Result<(), PortMapError>;

    /// The gateway's externally-visible IPv4 address, if it will report one.
    async fn external_ip(&mut self) -> Result<Option<Ipv4Addr>, PortMapError>;

    /// Minutes until a lease should be renewed; `0` means the backend's
    /// mappings don't expire and no renewal timer is needed.
    fn renewal_minutes(&self) -> u32;
}

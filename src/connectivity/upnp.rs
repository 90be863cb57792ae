//! UPnP IGD backend (`igd` crate). The gateway search and SOAP calls are
//! blocking, so each call is shipped to `spawn_blocking`, mirroring how the
//! crate hands blocking stdio work off the async runtime elsewhere.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use igd::{PortMappingProtocol, SearchOptions};

use super::port_mapper::{MappingRequest, PortMapperBackend, Protocol};
use crate::constants::DEFAULT_LEASE_MINUTES;
use crate::error::PortMapError;

const BACKEND_NAME: &str = "upnp";

pub struct UpnpMapper {
    gateway: Option<igd::Gateway>,
    local_ip: Ipv4Addr,
    opened_ports: Vec<(u16, PortMappingProtocol)>,
}

impl UpnpMapper {
    #[must_use]
    pub fn new(local_ip: Ipv4Addr) -> Self {
        Self { gateway: None, local_ip, opened_ports: Vec::new() }
    }
}

fn to_igd_protocol(p: Protocol) -> PortMappingProtocol {
    match p {
        Protocol::Tcp => PortMappingProtocol::TCP,
        Protocol::Udp => PortMappingProtocol::UDP,
    }
}

fn backend_err(message: impl Into<String>) -> PortMapError {
    PortMapError::Backend { backend: BACKEND_NAME, message: message.into() }
}

#[async_trait]
impl PortMapperBackend for UpnpMapper {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn init(&mut self) -> Result<(), PortMapError> {
        let gateway = tokio::task::spawn_blocking(|| igd::search_gateway(SearchOptions::default()))
            .await
            .map_err(|e| backend_err(format!("search task panicked: {e}")))?
            .map_err(|e| backend_err(format!("gateway search failed: {e}")))?;
        self.gateway = Some(gateway);
        Ok(())
    }

    async fn open(&mut self, req: &MappingRequest) -> Result<(), PortMapError> {
        let gateway = self.gateway.clone().ok_or_else(|| backend_err("not initialized"))?;
        let local_ip = self.local_ip;
        let local_port = req.local_port;
        let protocol = to_igd_protocol(req.protocol);
        let description = req.description.to_string();
        let lease = Duration::from_secs(u64::from(DEFAULT_LEASE_MINUTES) * 60);

        tokio::task::spawn_blocking(move || {
            gateway.add_port(
                protocol,
                local_port,
                SocketAddrV4::new(local_ip, local_port),
                lease.as_secs() as u32,
                &description,
            )
        })
        .await
        .map_err(|e| backend_err(format!("open task panicked: {e}")))?
        .map_err(|e| backend_err(format!("add_port failed: {e}")))?;

        self.opened_ports.push((local_port, protocol));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), PortMapError> {
        let Some(gateway) = self.gateway.clone() else {
            return Ok(());
        };
        let ports = std::mem::take(&mut self.opened_ports);
        tokio::task::spawn_blocking(move || {
            for (port, protocol) in ports {
                let _ = gateway.remove_port(protocol, port);
            }
        })
        .await
        .map_err(|e| backend_err(format!("close task panicked: {e}")))?;
        Ok(())
    }

    async fn external_ip(&mut self) -> Result<Option<Ipv4Addr>, PortMapError> {
        let Some(gateway) = self.gateway.clone() else {
            return Ok(None);
        };
        let ip = tokio::task::spawn_blocking(move || gateway.get_external_ip())
            .await
            .map_err(|e| backend_err(format!("external ip task panicked: {e}")))?
            .map_err(|e| backend_err(format!("get_external_ip failed: {e}")))?;
        Ok(Some(ip))
    }

    fn renewal_minutes(&self) -> u32 {
        DEFAULT_LEASE_MINUTES
    }
}

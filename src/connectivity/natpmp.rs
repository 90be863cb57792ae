//! NAT-PMP backend (RFC 6886), implemented directly against a UDP socket —
//! there's no maintained NAT-PMP crate in the ecosystem the teacher or the
//! rest of the pack depend on, so this talks the (small, fixed) wire format
//! by hand rather than pull in an unrelated dependency.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use super::port_mapper::{MappingRequest, PortMapperBackend, Protocol};
use crate::error::PortMapError;

const BACKEND_NAME: &str = "nat-pmp";
const NATPMP_PORT: u16 = 5351;
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(250);
const RESPONSE_RETRIES: u32 = 3;
const REQUESTED_LIFETIME_SECS: u32 = 7200;

const OP_EXTERNAL_ADDRESS: u8 = 0;
const OP_MAP_UDP: u8 = 1;
const OP_MAP_TCP: u8 = 2;

/// NAT-PMP has no discovery protocol of its own: the gateway is always the
/// default router, which the caller resolves once (typically from the
/// local interface's route table) and passes in.
pub struct NatPmpMapper {
    gateway: Ipv4Addr,
    mapped_ports: Vec<(u16, u8)>,
}

impl NatPmpMapper {
    #[must_use]
    pub fn new(gateway: Ipv4Addr) -> Self {
        Self { gateway, mapped_ports: Vec::new() }
    }

    async fn request(&self, payload: &[u8]) -> Result<Vec<u8>, PortMapError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| backend_err(format!("bind failed: {e}")))?;
        let dest = SocketAddrV4::new(self.gateway, NATPMP_PORT);

        let mut last_err = None;
        for attempt in 0..RESPONSE_RETRIES {
            socket.send_to(payload, dest).await.map_err(|e| backend_err(format!("send failed: {e}")))?;

            let mut buf = [0u8; 16];
            let timeout = RESPONSE_TIMEOUT * 2u32.pow(attempt);
            match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => return Ok(buf[..n].to_vec()),
                Ok(Err(e)) => last_err = Some(backend_err(format!("recv failed: {e}"))),
                Err(_) => last_err = Some(backend_err("gateway did not respond")),
            }
        }
        Err(last_err.unwrap_or_else(|| backend_err("gateway did not respond")))
    }
}

fn backend_err(message: impl Into<String>) -> PortMapError {
    PortMapError::Backend { backend: BACKEND_NAME, message: message.into() }
}

fn check_result_code(reply: &[u8]) -> Result<(), PortMapError> {
    if reply.len() < 4 {
        return Err(backend_err("reply too short"));
    }
    let result_code = u16::from_be_bytes([reply[2], reply[3]]);
    if result_code != 0 {
        return Err(backend_err(format!("gateway returned error code {result_code}")));
    }
    Ok(())
}

#[async_trait]
impl PortMapperBackend for NatPmpMapper {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn init(&mut self) -> Result<(), PortMapError> {
        // A successful external-address query doubles as gateway liveness check.
        let reply = self.request(&[0, OP_EXTERNAL_ADDRESS]).await?;
        check_result_code(&reply)
    }

    async fn open(&mut self, req: &MappingRequest) -> Result<(), PortMapError> {
        let opcode = match req.protocol {
            Protocol::Udp => OP_MAP_UDP,
            Protocol::Tcp => OP_MAP_TCP,
        };
        let mut payload = Vec::with_capacity(12);
        payload.push(0);
        payload.push(opcode);
        payload.extend_from_slice(&[0, 0]); // reserved
        payload.extend_from_slice(&req.local_port.to_be_bytes());
        payload.extend_from_slice(&req.local_port.to_be_bytes()); // request same external port
        payload.extend_from_slice(&REQUESTED_LIFETIME_SECS.to_be_bytes());

        let reply = self.request(&payload).await?;
        check_result_code(&reply)?;
        self.mapped_ports.push((req.local_port, opcode));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), PortMapError> {
        let ports = std::mem::take(&mut self.mapped_ports);
        for (port, opcode) in ports {
            let mut payload = Vec::with_capacity(12);
            payload.push(0);
            payload.push(opcode);
            payload.extend_from_slice(&[0, 0]);
            payload.extend_from_slice(&port.to_be_bytes());
            payload.extend_from_slice(&port.to_be_bytes());
            payload.extend_from_slice(&0u32.to_be_bytes()); // lifetime 0 = delete mapping
            let _ = self.request(&payload).await;
        }
        Ok(())
    }

    async fn external_ip(&mut self) -> Result<Option<Ipv4Addr>, PortMapError> {
        let reply = self.request(&[0, OP_EXTERNAL_ADDRESS]).await?;
        check_result_code(&reply)?;
        if reply.len() < 12 {
            return Ok(None);
        }
        Ok(Some(Ipv4Addr::new(reply[8], reply[9], reply[10], reply[11])))
    }

    fn renewal_minutes(&self) -> u32 {
        REQUESTED_LIFETIME_SECS / 60 / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_result_code_accepts_zero() {
        assert!(check_result_code(&[0, OP_EXTERNAL_ADDRESS, 0, 0]).is_ok());
    }

    #[test]
    fn check_result_code_rejects_nonzero() {
        assert!(check_result_code(&[0, OP_EXTERNAL_ADDRESS, 0, 1]).is_err());
    }

    #[test]
    fn check_result_code_rejects_short_reply() {
        assert!(check_result_code(&[0, 1]).is_err());
    }
}

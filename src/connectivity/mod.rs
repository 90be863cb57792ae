//! Connectivity manager (§4.H/I): per-family auto-detect of reachability,
//! backed by a pluggable port-mapper backend list. Pure state machine over
//! [`port_mapper::PortMapperBackend`] trait objects — the caller supplies
//! the backend list and the ports to map, this module only decides which
//! state each family ends up in and when a lease needs renewing.

pub mod natpmp;
pub mod port_mapper;
pub mod upnp;

use std::net::Ipv4Addr;
use std::time::Instant;

pub use port_mapper::{MappingRequest, PortMapperBackend, Protocol};

use crate::error::PortMapError;

/// Which IP family a given auto-detect run, or a port-mapper backend,
/// applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

/// What a family ended up at after auto-detect, mirroring the three
/// outcomes the original client reports per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityState {
    /// We have (or were configured with) a publicly dialable address.
    IncomingActive,
    /// Not directly dialable, but a port-mapper backend opened a forward.
    IncomingActiveUpnp,
    /// Neither of the above; advertise passive mode on this family.
    IncomingPassive,
}

/// Per-family auto-detect bookkeeping: the active mapper (if any) and when
/// its lease is next due for renewal.
struct FamilyState {
    state: Option<ReachabilityState>,
    mapper: Option<Box<dyn PortMapperBackend>>,
    external_ip: Option<Ipv4Addr>,
    next_renewal: Option<Instant>,
    renewal_failed: bool,
}

impl FamilyState {
    fn new() -> Self {
        Self { state: None, mapper: None, external_ip: None, next_renewal: None, renewal_failed: false }
    }
}

/// Owns the per-family reachability state plus whichever port-mapper
/// backend is currently holding a lease for that family.
pub struct ConnectivityManager {
    v4: FamilyState,
    v6: FamilyState,
}

impl Default for ConnectivityManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityManager {
    #[must_use]
    pub fn new() -> Self {
        Self { v4: FamilyState::new(), v6: FamilyState::new() }
    }

    #[must_use]
    pub fn state(&self, family: AddressFamily) -> Option<ReachabilityState> {
        self.family_state(family).state
    }

    #[must_use]
    pub fn external_ip(&self, family: AddressFamily) -> Option<Ipv4Addr> {
        self.family_state(family).external_ip
    }

    fn family_state(&self, family: AddressFamily) -> &FamilyState {
        match family {
            AddressFamily::V4 => &self.v4,
            AddressFamily::V6 => &self.v6,
        }
    }

    fn family_state_mut(&mut self, family: AddressFamily) -> &mut FamilyState {
        match family {
            AddressFamily::V4 => &mut self.v4,
            AddressFamily::V6 => &mut self.v6,
        }
    }

    /// Runs one auto-detect pass for `family`. `has_public_address` is the
    /// caller's own determination of whether the configured listener is
    /// already known to be externally dialable (manual/static config, or a
    /// prior successful STUN-style probe) — if so, no mapper is needed at
    /// all. Otherwise tries each backend in order until one opens every
    /// port in `requests`.
    pub async fn auto_detect(
        &mut self,
        family: AddressFamily,
        has_public_address: bool,
        mut backends: Vec<Box<dyn PortMapperBackend>>,
        requests: &[MappingRequest],
    ) -> ReachabilityState {
        {
            let fs = self.family_state_mut(family);
            if let Some(mapper) = fs.mapper.take() {
                let _ = close_mapper(mapper).await;
            }
            fs.state = None;
            fs.external_ip = None;
            fs.next_renewal = None;
            fs.renewal_failed = false;
        }

        if has_public_address {
            self.family_state_mut(family).state = Some(ReachabilityState::IncomingActive);
            return ReachabilityState::IncomingActive;
        }

        for mut backend in backends.drain(..) {
            match try_open_all(backend.as_mut(), requests).await {
                Ok(()) => {
                    let external_ip = backend.external_ip().await.ok().flatten();
                    let renewal_minutes = backend.renewal_minutes();
                    let fs = self.family_state_mut(family);
                    fs.external_ip = external_ip;
                    fs.next_renewal = (renewal_minutes > 0)
                        .then(|| Instant::now() + std::time::Duration::from_secs(u64::from(renewal_minutes.max(10)) * 60));
                    fs.mapper = Some(backend);
                    fs.state = Some(ReachabilityState::IncomingActiveUpnp);
                    return ReachabilityState::IncomingActiveUpnp;
                }
                Err(e) => {
                    log::warn!("port-mapper backend {} failed: {e}", backend.name());
                }
            }
        }

        self.family_state_mut(family).state = Some(ReachabilityState::IncomingPassive);
        ReachabilityState::IncomingPassive
    }

    /// Minute timer (§4.H/I): renews the active lease for each family whose
    /// `next_renewal` is due. A failed renewal flags the family so the next
    /// call to [`needs_reopen`](Self::needs_reopen) tells the caller to run
    /// `auto_detect` again from scratch.
    pub async fn tick(&mut self, now: Instant, requests: &[MappingRequest]) {
        self.renew_family(AddressFamily::V4, now, requests).await;
        self.renew_family(AddressFamily::V6, now, requests).await;
    }

    async fn renew_family(&mut self, family: AddressFamily, now: Instant, requests: &[MappingRequest]) {
        let due = matches!(self.family_state(family).next_renewal, Some(t) if now >= t);
        if !due {
            return;
        }

        let mut mapper = match self.family_state_mut(family).mapper.take() {
            Some(m) => m,
            None => return,
        };

        let renewed = async {
            mapper.init().await?;
            try_open_all(mapper.as_mut(), requests).await
        }
        .await;

        let fs = self.family_state_mut(family);
        match renewed {
            Ok(()) => {
                let minutes = mapper.renewal_minutes();
                fs.next_renewal =
                    (minutes > 0).then(|| now + std::time::Duration::from_secs(u64::from(minutes.max(10)) * 60));
                fs.mapper = Some(mapper);
                fs.renewal_failed = false;
            }
            Err(e) => {
                log::warn!("port-mapper lease renewal failed for {:?}: {e}", family);
                fs.next_renewal = None;
                fs.renewal_failed = true;
            }
        }
    }

    /// Whether `family`'s most recent renewal attempt failed and a full
    /// `auto_detect` re-run is needed on the next cycle.
    #[must_use]
    pub fn needs_reopen(&self, family: AddressFamily) -> bool {
        self.family_state(family).renewal_failed
    }

    /// Tears down every active mapping (called on shutdown).
    pub async fn close(&mut self) {
        if let Some(mapper) = self.v4.mapper.take() {
            let _ = close_mapper(mapper).await;
        }
        if let Some(mapper) = self.v6.mapper.take() {
            let _ = close_mapper(mapper).await;
        }
    }
}

async fn try_open_all(backend: &mut dyn PortMapperBackend, requests: &[MappingRequest]) -> Result<(), PortMapError> {
    backend.init().await?;
    for req in requests {
        if let Err(e) = backend.open(req).await {
            let _ = backend.close().await;
            return Err(e);
        }
    }
    Ok(())
}

async fn close_mapper(mut backend: Box<dyn PortMapperBackend>) -> Result<(), PortMapError> {
    backend.close().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FakeBackend {
        name: &'static str,
        fail_init: bool,
        opened: Arc<AtomicBool>,
    }

    #[async_trait]
    impl PortMapperBackend for FakeBackend {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn init(&mut self) -> Result<(), PortMapError> {
            if self.fail_init {
                Err(PortMapError::Backend { backend: self.name, message: "no gateway".into() })
            } else {
                Ok(())
            }
        }
        async fn open(&mut self, _req: &MappingRequest) -> Result<(), PortMapError> {
            self.opened.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn close(&mut self) -> Result<(), PortMapError> {
            self.opened.store(false, Ordering::SeqCst);
            Ok(())
        }
        async fn external_ip(&mut self) -> Result<Option<Ipv4Addr>, PortMapError> {
            Ok(Some(Ipv4Addr::new(203, 0, 113, 7)))
        }
        fn renewal_minutes(&self) -> u32 {
            60
        }
    }

    fn requests() -> Vec<MappingRequest> {
        vec![MappingRequest { local_port: 5000, protocol: Protocol::Tcp, description: "Transfer" }]
    }

    #[tokio::test]
    async fn public_address_skips_mappers_entirely() {
        let mut mgr = ConnectivityManager::new();
        let state = mgr.auto_detect(AddressFamily::V4, true, Vec::new(), &requests()).await;
        assert_eq!(state, ReachabilityState::IncomingActive);
    }

    #[tokio::test]
    async fn first_working_backend_wins() {
        let mut mgr = ConnectivityManager::new();
        let opened = Arc::new(AtomicBool::new(false));
        let backends: Vec<Box<dyn PortMapperBackend>> = vec![
            Box::new(FakeBackend { name: "nat-pmp", fail_init: true, opened: opened.clone() }),
            Box::new(FakeBackend { name: "upnp", fail_init: false, opened: opened.clone() }),
        ];
        let state = mgr.auto_detect(AddressFamily::V4, false, backends, &requests()).await;
        assert_eq!(state, ReachabilityState::IncomingActiveUpnp);
        assert!(opened.load(Ordering::SeqCst));
        assert_eq!(mgr.external_ip(AddressFamily::V4), Some(Ipv4Addr::new(203, 0, 113, 7)));
    }

    #[tokio::test]
    async fn all_backends_failing_falls_back_to_passive() {
        let mut mgr = ConnectivityManager::new();
        let opened = Arc::new(AtomicBool::new(false));
        let backends: Vec<Box<dyn PortMapperBackend>> =
            vec![Box::new(FakeBackend { name: "nat-pmp", fail_init: true, opened })];
        let state = mgr.auto_detect(AddressFamily::V4, false, backends, &requests()).await;
        assert_eq!(state, ReachabilityState::IncomingPassive);
    }

    #[tokio::test]
    async fn renewal_due_reopens_and_reschedules() {
        let mut mgr = ConnectivityManager::new();
        let opened = Arc::new(AtomicBool::new(false));
        let backends: Vec<Box<dyn PortMapperBackend>> =
            vec![Box::new(FakeBackend { name: "upnp", fail_init: false, opened: opened.clone() })];
        mgr.auto_detect(AddressFamily::V4, false, backends, &requests()).await;

        // Force the renewal deadline into the past and tick.
        mgr.v4.next_renewal = Some(Instant::now() - std::time::Duration::from_secs(1));
        mgr.tick(Instant::now(), &requests()).await;

        assert!(!mgr.needs_reopen(AddressFamily::V4));
        assert!(mgr.v4.next_renewal.is_some());
    }
}

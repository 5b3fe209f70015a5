//! Ephemeral port allocation for new backend instances

use crate::error::InstanceError;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use tracing::debug;

/// Hands out a port for a backend to bind to
pub trait PortAllocator: Send + Sync {
    fn allocate(&self) -> Result<u16, InstanceError>;
}

/// Asks the OS for an ephemeral port by binding port 0, then releases it.
///
/// The port is not reserved: another process may grab it before the backend
/// binds. That window is small and surfaces as a failed readiness probe.
#[derive(Debug, Clone)]
pub struct OsPortAllocator {
    ip: IpAddr,
}

impl OsPortAllocator {
    pub fn new(ip: IpAddr) -> Self {
        Self { ip }
    }
}

impl Default for OsPortAllocator {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

impl PortAllocator for OsPortAllocator {
    fn allocate(&self) -> Result<u16, InstanceError> {
        let listener = TcpListener::bind(SocketAddr::new(self.ip, 0))
            .map_err(InstanceError::AllocationFailed)?;
        let port = listener
            .local_addr()
            .map_err(InstanceError::AllocationFailed)?
            .port();
        drop(listener);

        debug!(port, "Allocated ephemeral port");
        Ok(port)
    }
}

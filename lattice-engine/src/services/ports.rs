// Port Allocation
// Collision-free host ports for ephemeral services

use crate::error::ServiceError;

use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;

const MAX_ATTEMPTS: usize = 64;

/// Hands out OS-assigned ephemeral ports that are not leased to anyone else
/// in this process
#[derive(Debug, Clone, Default)]
pub struct PortAllocator {
    leased: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self) -> Result<PortLease, ServiceError> {
        for _ in 0..MAX_ATTEMPTS {
            let port = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?
                .local_addr()?
                .port();

            if self.leased.lock().insert(port) {
                tracing::trace!(port, "port leased");
                return Ok(PortLease {
                    port,
                    leased: Arc::clone(&self.leased),
                });
            }
        }

        Err(ServiceError::PortAllocation(format!(
            "no unleased port after {} attempts",
            MAX_ATTEMPTS
        )))
    }

    /// Number of ports currently leased
    pub fn leased(&self) -> usize {
        self.leased.lock().len()
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.leased.lock().contains(&port)
    }
}

/// A leased port; returned to the allocator on drop
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    leased: Arc<Mutex<HashSet<u16>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.leased.lock().remove(&self.port);
        tracing::trace!(port = self.port, "port returned");
    }
}

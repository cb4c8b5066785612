//! Host port allocation for published container ports.
//!
//! A port is checked by binding a listener on the loopback interface and
//! immediately closing it, so there is an unavoidable window between
//! allocation and Docker binding the port in which another process can take
//! it. Within one process, live leases are tracked in a registry so two
//! fixtures never receive the same port.
//!
//! The check runs on this machine. With a remote daemon the port is
//! published on the daemon's host, which a local bind says nothing about,
//! so a taken port there only shows up as a failed container start.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError};

use crate::error::{FixtureError, Result};

static LEASED: LazyLock<Mutex<HashSet<u16>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

fn leased() -> MutexGuard<'static, HashSet<u16>> {
    LEASED.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A reserved host port. The reservation ends when the lease is dropped.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        leased().remove(&self.port);
    }
}

/// Picks free host ports.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    /// How many ephemeral ports to try after the preferred one.
    attempts: usize,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self { attempts: 16 }
    }
}

impl PortAllocator {
    pub fn new(attempts: usize) -> Self {
        Self { attempts }
    }

    /// Reserve `preferred` if it is free, otherwise an OS-assigned port.
    pub fn allocate(&self, preferred: Option<u16>) -> Result<PortLease> {
        let mut leased = leased();

        if let Some(port) = preferred.filter(|p| *p != 0) {
            if !leased.contains(&port) && can_bind(port) {
                leased.insert(port);
                return Ok(PortLease { port });
            }
        }

        let mut last_error = "no attempts made".to_string();
        for _ in 0..self.attempts {
            match ephemeral_port() {
                Ok(port) if !leased.contains(&port) => {
                    leased.insert(port);
                    return Ok(PortLease { port });
                }
                Ok(port) => last_error = format!("port {port} is already leased"),
                Err(e) => last_error = e.to_string(),
            }
        }

        Err(FixtureError::Allocation {
            preferred,
            reason: format!("gave up after {} attempts: {}", self.attempts, last_error),
        })
    }
}

fn can_bind(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

fn ephemeral_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_leases_never_share_a_port() {
        let allocator = PortAllocator::default();
        let leases: Vec<PortLease> = (0..8)
            .map(|_| allocator.allocate(None).unwrap())
            .collect();

        let unique: HashSet<u16> = leases.iter().map(PortLease::port).collect();
        assert_eq!(unique.len(), leases.len());
    }

    #[test]
    fn test_same_preferred_port_twice() {
        let allocator = PortAllocator::default();
        let preferred = ephemeral_port().unwrap();

        let first = allocator.allocate(Some(preferred)).unwrap();
        let second = allocator.allocate(Some(preferred)).unwrap();

        assert_eq!(first.port(), preferred);
        assert_ne!(second.port(), preferred);
    }

    #[test]
    fn test_occupied_preferred_port_falls_back() {
        let occupied = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = occupied.local_addr().unwrap().port();

        let lease = PortAllocator::default().allocate(Some(port)).unwrap();
        assert_ne!(lease.port(), port);
    }

    #[test]
    fn test_dropped_lease_is_released() {
        let allocator = PortAllocator::default();
        let lease = allocator.allocate(None).unwrap();
        let port = lease.port();
        assert!(leased().contains(&port));

        drop(lease);
        assert!(!leased().contains(&port));
    }

    #[test]
    fn test_zero_attempts_without_preferred_fails() {
        let err = PortAllocator::new(0).allocate(None).unwrap_err();
        assert!(matches!(err, FixtureError::Allocation { preferred: None, .. }));
    }
}

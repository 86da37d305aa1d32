//! In-memory DHCP lease table.
//!
//! Leases are not persisted: the inventory, not this table, is the source of
//! truth for addresses, so a restart merely forgets renewals. All mutation
//! happens under the service state lock.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// An outstanding DHCP address binding.
#[derive(Debug, Clone)]
pub struct Lease {
    /// Normalized MAC address of the machine the lease belongs to.
    pub mac_address: String,

    /// The leased IPv4 address.
    pub ipv4_address: Ipv4Addr,

    /// When the lease expires.
    pub expires_at: Instant,
}

impl Lease {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Debug, Default)]
pub struct LeaseTable {
    leases: HashMap<String, Lease>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a lease for a MAC, replacing any existing entry.
    pub fn create(&mut self, mac: &str, ip: Ipv4Addr, duration: Duration) -> Lease {
        let lease = Lease {
            mac_address: mac.to_string(),
            ipv4_address: ip,
            expires_at: Instant::now() + duration,
        };
        self.leases.insert(mac.to_string(), lease.clone());
        lease
    }

    /// Slide the expiry of an existing lease forward.
    pub fn renew(&mut self, mac: &str, duration: Duration) -> Option<Lease> {
        let lease = self.leases.get_mut(mac)?;
        lease.expires_at = Instant::now() + duration;
        Some(lease.clone())
    }

    /// Remove the lease for a MAC, returning it if one existed.
    pub fn expire(&mut self, mac: &str) -> Option<Lease> {
        self.leases.remove(mac)
    }

    pub fn find(&self, mac: &str) -> Option<&Lease> {
        self.leases.get(mac)
    }

    /// Drop expired entries. Safe to skip: use sites check `is_expired`.
    pub fn prune(&mut self) {
        self.leases.retain(|_, lease| !lease.is_expired());
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

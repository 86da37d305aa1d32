//! CloudControl API data model.
//!
//! Only the slice of the compute API the DHCP service consumes: server
//! inventory with network adapters, asset tags, VLANs and network domains.

use serde::Deserialize;

/// One page of a paginated listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page_number: u32,
    pub page_size: u32,
    pub total_count: u32,
}

impl<T> Page<T> {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Paging cursor for list calls.
#[derive(Debug, Clone)]
pub struct Paging {
    pub page_number: u32,
    pub page_size: u32,
}

impl Paging {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_number: 1,
            page_size,
        }
    }

    /// Advance to the next page.
    pub fn next(&mut self) {
        self.page_number += 1;
    }
}

impl Default for Paging {
    fn default() -> Self {
        Self::new(250)
    }
}

/// A virtual network adapter attached to a server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAdapter {
    pub id: Option<String>,
    pub mac_address: Option<String>,
    /// Absent while the adapter is being deployed or destroyed.
    pub private_ipv4: Option<String>,
    #[serde(default)]
    pub private_ipv6: Option<String>,
}

/// Server network configuration: one primary adapter, zero or more extras.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerNetwork {
    pub primary_adapter: NetworkAdapter,
    #[serde(default)]
    pub additional_adapters: Vec<NetworkAdapter>,
}

/// A server in the CloudControl inventory.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub id: String,
    pub name: String,
    pub network: ServerNetwork,
}

/// An asset tag attached to a server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub asset_id: String,
    #[serde(rename = "tagKeyName")]
    pub name: String,
    pub value: String,
}

/// An IPv4 range expressed as base address plus prefix size.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ipv4Range {
    pub address: String,
    pub prefix_size: u8,
}

/// Reference to another CloudControl entity.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// A VLAN within a network domain.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vlan {
    pub id: String,
    pub name: String,
    pub network_domain: EntityRef,
    pub private_ipv4_range: Ipv4Range,
    pub ipv4_gateway_address: String,
}

/// A network domain (routing domain) within a datacenter.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDomain {
    pub id: String,
    pub name: String,
    pub datacenter_id: String,
}

//! Server metadata cache built from the CloudControl inventory.
//!
//! The snapshot is rebuilt from scratch on every refresh and swapped in
//! atomically under the service state lock; readers only ever see a complete
//! map. A lookup by any MAC a server owns returns the whole server record.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use cloudcontrol::error::ComputeError;
use cloudcontrol::models::{NetworkAdapter, Paging, Server};
use cloudcontrol::{ComputeApi, ASSET_TYPE_SERVER};
use dhcp::normalize_mac;
use tracing::{debug, warn};

const PAGE_SIZE: u32 = 50;

/// Inventory record for one known machine.
#[derive(Debug, Clone)]
pub struct ServerMetadata {
    pub id: String,
    pub name: String,

    /// Normalized MAC → assigned IPv4, for the primary adapter and any
    /// additional adapters.
    pub ipv4_by_mac: HashMap<String, Ipv4Addr>,

    /// If set, overrides the service-wide PXE boot image.
    pub pxe_boot_image: Option<String>,

    /// If set, overrides the service-wide iPXE boot script URL. An
    /// `ipxe_profile` tag is folded into this field during refresh.
    pub ipxe_boot_script: Option<String>,
}

impl ServerMetadata {
    /// The address assigned to one of this server's adapters.
    pub fn ip_for_mac(&self, mac: &str) -> Option<Ipv4Addr> {
        self.ipv4_by_mac.get(&normalize_mac(mac)).copied()
    }
}

/// A locally configured MAC-to-address binding that shadows the cloud
/// inventory. Exists for test environments without a real inventory.
#[derive(Debug, Clone)]
pub struct StaticReservation {
    pub mac_address: String,
    pub host_name: String,
    pub ipv4_address: Ipv4Addr,
}

impl StaticReservation {
    /// Synthesize a metadata record answering purely from the reservation.
    pub fn to_metadata(&self) -> ServerMetadata {
        let mut ipv4_by_mac = HashMap::new();
        ipv4_by_mac.insert(self.mac_address.clone(), self.ipv4_address);

        ServerMetadata {
            id: self.host_name.clone(),
            name: self.host_name.clone(),
            ipv4_by_mac,
            pxe_boot_image: None,
            ipxe_boot_script: None,
        }
    }
}

/// The MAC → metadata map readers see between refreshes.
pub type MetadataSnapshot = HashMap<String, ServerMetadata>;

/// Per-server boot overrides accumulated from asset tags.
#[derive(Debug, Default)]
struct TagOverrides {
    pxe_boot_image: Option<String>,
    ipxe_profile: Option<String>,
    ipxe_boot_script: Option<String>,
}

/// Build a fresh snapshot from CloudControl.
///
/// Runs entirely against local data; the caller swaps the result into shared
/// state under the lock. Server listing and tag listing page independently
/// and run concurrently.
pub async fn read_server_metadata(
    api: &dyn ComputeApi,
    network_domain_id: &str,
    datacenter_id: &str,
    service_ip: Ipv4Addr,
    ipxe_port: u16,
) -> Result<MetadataSnapshot, ComputeError> {
    let (servers, overrides) = tokio::join!(
        fetch_all_servers(api, network_domain_id),
        fetch_all_tag_overrides(api, datacenter_id),
    );
    let servers = servers?;
    let mut overrides = overrides?;

    let mut snapshot = MetadataSnapshot::new();
    for server in servers {
        // Servers that are being deployed or destroyed have no private IPv4
        // on the primary adapter yet.
        let (primary_mac, primary_ip) = match adapter_binding(&server.network.primary_adapter) {
            Some(binding) => binding,
            None => continue,
        };

        let mut metadata = ServerMetadata {
            id: server.id.clone(),
            name: server.name.clone(),
            ipv4_by_mac: HashMap::new(),
            pxe_boot_image: None,
            ipxe_boot_script: None,
        };
        debug!("\tMAC {} -> {} ({})", primary_mac, primary_ip, server.name);
        metadata.ipv4_by_mac.insert(primary_mac, primary_ip);

        for adapter in &server.network.additional_adapters {
            if let Some((mac, ip)) = adapter_binding(adapter) {
                debug!("\tMAC {} -> {} ({})", mac, ip, server.name);
                metadata.ipv4_by_mac.insert(mac, ip);
            }
        }

        if let Some(tags) = overrides.remove(&server.id) {
            metadata.pxe_boot_image = tags.pxe_boot_image;
            metadata.ipxe_boot_script = tags.ipxe_boot_script;

            // An ipxe_profile tag only matters when no explicit boot script
            // URL was tagged; then the URL is derived from the profile name.
            if metadata.ipxe_boot_script.is_none() {
                if let Some(profile) = tags.ipxe_profile {
                    metadata.ipxe_boot_script =
                        Some(format!("http://{}:{}/?profile={}", service_ip, ipxe_port, profile));
                }
            }
        }

        // Register under every MAC the server owns so lookup by any adapter
        // returns the whole record.
        for mac in metadata.ipv4_by_mac.keys() {
            snapshot.insert(mac.clone(), metadata.clone());
        }
    }

    Ok(snapshot)
}

fn adapter_binding(adapter: &NetworkAdapter) -> Option<(String, Ipv4Addr)> {
    let mac = adapter.mac_address.as_deref()?;
    let raw_ip = adapter.private_ipv4.as_deref()?;

    match raw_ip.parse() {
        Ok(ip) => Some((normalize_mac(mac), ip)),
        Err(_) => {
            warn!("Ignoring adapter {}: '{}' is not a valid IPv4 address", mac, raw_ip);
            None
        }
    }
}

async fn fetch_all_servers(api: &dyn ComputeApi, network_domain_id: &str) -> Result<Vec<Server>, ComputeError> {
    let mut paging = Paging::new(PAGE_SIZE);
    let mut servers = Vec::new();

    loop {
        let page = api.list_servers_in_network_domain(network_domain_id, &paging).await?;
        if page.is_empty() {
            break;
        }
        servers.extend(page.items);
        paging.next();
    }

    Ok(servers)
}

async fn fetch_all_tag_overrides(
    api: &dyn ComputeApi,
    datacenter_id: &str,
) -> Result<HashMap<String, TagOverrides>, ComputeError> {
    let mut paging = Paging::new(PAGE_SIZE);
    let mut overrides: HashMap<String, TagOverrides> = HashMap::new();

    loop {
        let page = match api.get_asset_tags_by_type(ASSET_TYPE_SERVER, datacenter_id, &paging).await {
            Ok(page) => page,
            // The provider reports paging past the last page as an error.
            Err(err) if err.is_end_of_pages() => break,
            Err(err) => return Err(err),
        };
        if page.is_empty() {
            break;
        }

        for tag in page.items {
            let entry = overrides.entry(tag.asset_id).or_default();
            match tag.name.as_str() {
                "pxe_boot_image" => entry.pxe_boot_image = Some(tag.value),
                "ipxe_profile" => entry.ipxe_profile = Some(tag.value),
                "ipxe_boot_script" => entry.ipxe_boot_script = Some(tag.value),
                _ => {}
            }
        }

        paging.next();
    }

    Ok(overrides)
}

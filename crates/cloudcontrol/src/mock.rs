//! In-memory mock of the CloudControl API for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::{ComputeError, UNEXPECTED_ERROR};
use crate::models::*;
use crate::ComputeApi;

/// Mock compute API backed by plain vectors.
///
/// Listings are paged exactly like the real API. When
/// `end_tags_with_unexpected_error` is set, paging past the last tag page
/// returns the provider's spurious `UNEXPECTED_ERROR` instead of an empty
/// page, reproducing the quirk the refresh loop has to tolerate.
#[derive(Default)]
pub struct MockCompute {
    servers: Mutex<Vec<Server>>,
    tags: Mutex<Vec<Tag>>,
    vlans: Mutex<HashMap<String, Vlan>>,
    network_domains: Mutex<HashMap<String, NetworkDomain>>,
    end_tags_with_unexpected_error: AtomicBool,
    fail_server_listing: AtomicBool,
}

impl MockCompute {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_server(&self, server: Server) {
        self.servers.lock().unwrap().push(server);
    }

    pub fn clear_servers(&self) {
        self.servers.lock().unwrap().clear();
    }

    pub fn add_tag(&self, asset_id: &str, name: &str, value: &str) {
        self.tags.lock().unwrap().push(Tag {
            asset_id: asset_id.to_string(),
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    pub fn add_vlan(&self, vlan: Vlan) {
        self.vlans.lock().unwrap().insert(vlan.id.clone(), vlan);
    }

    pub fn add_network_domain(&self, domain: NetworkDomain) {
        self.network_domains.lock().unwrap().insert(domain.id.clone(), domain);
    }

    pub fn set_end_tags_with_unexpected_error(&self, enabled: bool) {
        self.end_tags_with_unexpected_error.store(enabled, Ordering::SeqCst);
    }

    pub fn set_fail_server_listing(&self, enabled: bool) {
        self.fail_server_listing.store(enabled, Ordering::SeqCst);
    }

    /// Convenience constructor for a server with one primary adapter.
    pub fn server(id: &str, name: &str, mac: &str, ipv4: Option<&str>) -> Server {
        Server {
            id: id.to_string(),
            name: name.to_string(),
            network: ServerNetwork {
                primary_adapter: NetworkAdapter {
                    id: None,
                    mac_address: Some(mac.to_string()),
                    private_ipv4: ipv4.map(str::to_string),
                    private_ipv6: None,
                },
                additional_adapters: Vec::new(),
            },
        }
    }

    fn page_of<T: Clone>(items: &[T], paging: &Paging) -> Page<T> {
        let start = (paging.page_number.saturating_sub(1) as usize) * paging.page_size as usize;
        let end = (start + paging.page_size as usize).min(items.len());
        let slice = if start < items.len() {
            items[start..end].to_vec()
        } else {
            Vec::new()
        };

        Page {
            items: slice,
            page_number: paging.page_number,
            page_size: paging.page_size,
            total_count: items.len() as u32,
        }
    }
}

#[async_trait::async_trait]
impl ComputeApi for MockCompute {
    async fn list_servers_in_network_domain(
        &self,
        _network_domain_id: &str,
        paging: &Paging,
    ) -> Result<Page<Server>, ComputeError> {
        if self.fail_server_listing.load(Ordering::SeqCst) {
            return Err(ComputeError::Api {
                code: "UNAUTHORIZED_ERROR".to_string(),
                message: "injected failure".to_string(),
            });
        }

        let servers = self.servers.lock().unwrap();
        Ok(Self::page_of(&servers, paging))
    }

    async fn get_asset_tags_by_type(
        &self,
        _asset_type: &str,
        _datacenter_id: &str,
        paging: &Paging,
    ) -> Result<Page<Tag>, ComputeError> {
        let tags = self.tags.lock().unwrap();
        let page = Self::page_of(&tags, paging);

        if page.is_empty() && paging.page_number > 1 && self.end_tags_with_unexpected_error.load(Ordering::SeqCst) {
            return Err(ComputeError::Api {
                code: UNEXPECTED_ERROR.to_string(),
                message: "Page number exceeds available pages".to_string(),
            });
        }

        Ok(page)
    }

    async fn get_vlan(&self, id: &str) -> Result<Vlan, ComputeError> {
        self.vlans
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ComputeError::NotFound(format!("VLAN '{}'", id)))
    }

    async fn get_network_domain(&self, id: &str) -> Result<NetworkDomain, ComputeError> {
        self.network_domains
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ComputeError::NotFound(format!("network domain '{}'", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn paging_walks_all_items() {
        let mock = MockCompute::new();
        for i in 0..7 {
            mock.add_server(MockCompute::server(
                &format!("srv-{}", i),
                &format!("server-{}", i),
                &format!("aa:bb:cc:dd:ee:{:02x}", i),
                Some("10.0.0.20"),
            ));
        }

        let mut paging = Paging::new(3);
        let mut seen = 0;
        loop {
            let page = mock.list_servers_in_network_domain("domain-1", &paging).await.unwrap();
            if page.is_empty() {
                break;
            }
            seen += page.items.len();
            paging.next();
        }
        assert_eq!(seen, 7);
    }

    #[tokio::test]
    async fn tag_paging_quirk_surfaces_unexpected_error() {
        let mock = MockCompute::new();
        mock.add_tag("srv-1", "pxe_boot_image", "custom.kpxe");
        mock.set_end_tags_with_unexpected_error(true);

        let mut paging = Paging::new(50);
        let first = mock.get_asset_tags_by_type("SERVER", "DC1", &paging).await.unwrap();
        assert_eq!(first.items.len(), 1);

        paging.next();
        let err = mock.get_asset_tags_by_type("SERVER", "DC1", &paging).await.unwrap_err();
        assert!(err.is_end_of_pages());
    }
}

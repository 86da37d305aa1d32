//! CloudControl compute API client.
//!
//! The DHCP service treats the cloud provider as the source of truth for
//! MAC-to-address assignments. This crate carries the typed models, a
//! mockable [`ComputeApi`] trait, the HTTP client implementation, and an
//! in-memory mock for tests.

pub mod client;
pub mod error;
pub mod mock;
pub mod models;

pub use client::CloudControlClient;
pub use error::ComputeError;
pub use models::{NetworkAdapter, NetworkDomain, Page, Paging, Server, ServerNetwork, Tag, Vlan};

/// Asset type identifier for server tags.
pub const ASSET_TYPE_SERVER: &str = "SERVER";

/// Trait over the CloudControl operations the DHCP service uses.
///
/// Enables mocking of the compute API in unit tests. All methods must be
/// `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ComputeApi: Send + Sync {
    /// List servers deployed in a network domain, one page at a time.
    async fn list_servers_in_network_domain(
        &self,
        network_domain_id: &str,
        paging: &Paging,
    ) -> Result<Page<Server>, ComputeError>;

    /// List asset tags of the given type across a datacenter.
    ///
    /// Paging past the last page may surface as an `UNEXPECTED_ERROR` API
    /// response; callers should treat that as end-of-stream
    /// (see [`ComputeError::is_end_of_pages`]).
    async fn get_asset_tags_by_type(
        &self,
        asset_type: &str,
        datacenter_id: &str,
        paging: &Paging,
    ) -> Result<Page<Tag>, ComputeError>;

    /// Look up a VLAN by id.
    async fn get_vlan(&self, id: &str) -> Result<Vlan, ComputeError>;

    /// Look up a network domain by id.
    async fn get_network_domain(&self, id: &str) -> Result<NetworkDomain, ComputeError>;
}

//! HTTP implementation of the CloudControl API client.

use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::error::ComputeError;
use crate::models::*;
use crate::ComputeApi;

const API_VERSION: &str = "2.4";

/// CloudControl API client.
///
/// Authenticates with HTTP basic auth against the regional API endpoint.
pub struct CloudControlClient {
    client: Client,
    base_url: String,
    username: String,
    password: String,
}

/// API-level error envelope returned with non-2xx statuses.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiFailure {
    response_code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListEnvelope<T> {
    #[serde(default = "default_page_number")]
    page_number: u32,
    #[serde(default)]
    page_size: u32,
    #[serde(default)]
    total_count: u32,
    #[serde(flatten)]
    body: T,
}

fn default_page_number() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct ServerList {
    #[serde(default)]
    server: Vec<Server>,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tag: Vec<Tag>,
}

impl CloudControlClient {
    /// Create a client for the given MCP region (e.g. `AU`, `NA`, `EU`).
    pub fn new(region: &str, username: &str, password: &str) -> Result<Self, ComputeError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            base_url: format!("https://api-{}.dimensiondata.com", region.to_lowercase()),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, ComputeError> {
        let url = format!("{}/caas/{}/{}", self.base_url, API_VERSION, path);
        debug!("GET {} {:?}", url, query);

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .query(query)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            // CloudControl wraps failures in a responseCode/message envelope;
            // surface it typed so callers can match on the code.
            if let Ok(failure) = serde_json::from_str::<ApiFailure>(&body) {
                return Err(ComputeError::Api {
                    code: failure.response_code,
                    message: failure.message,
                });
            }
            return Err(ComputeError::Api {
                code: status.as_u16().to_string(),
                message: body.chars().take(500).collect(),
            });
        }

        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait::async_trait]
impl ComputeApi for CloudControlClient {
    async fn list_servers_in_network_domain(
        &self,
        network_domain_id: &str,
        paging: &Paging,
    ) -> Result<Page<Server>, ComputeError> {
        let envelope: ListEnvelope<ServerList> = self
            .get_json(
                "server/server",
                &[
                    ("networkDomainId", network_domain_id.to_string()),
                    ("pageNumber", paging.page_number.to_string()),
                    ("pageSize", paging.page_size.to_string()),
                ],
            )
            .await?;

        Ok(Page {
            items: envelope.body.server,
            page_number: envelope.page_number,
            page_size: envelope.page_size,
            total_count: envelope.total_count,
        })
    }

    async fn get_asset_tags_by_type(
        &self,
        asset_type: &str,
        datacenter_id: &str,
        paging: &Paging,
    ) -> Result<Page<Tag>, ComputeError> {
        let envelope: ListEnvelope<TagList> = self
            .get_json(
                "tag/tag",
                &[
                    ("assetType", asset_type.to_string()),
                    ("datacenterId", datacenter_id.to_string()),
                    ("pageNumber", paging.page_number.to_string()),
                    ("pageSize", paging.page_size.to_string()),
                ],
            )
            .await?;

        Ok(Page {
            items: envelope.body.tag,
            page_number: envelope.page_number,
            page_size: envelope.page_size,
            total_count: envelope.total_count,
        })
    }

    async fn get_vlan(&self, id: &str) -> Result<Vlan, ComputeError> {
        match self.get_json(&format!("network/vlan/{}", id), &[]).await {
            Err(ComputeError::Api { code, .. }) if code == "RESOURCE_NOT_FOUND" => {
                Err(ComputeError::NotFound(format!("VLAN '{}'", id)))
            }
            other => other,
        }
    }

    async fn get_network_domain(&self, id: &str) -> Result<NetworkDomain, ComputeError> {
        match self.get_json(&format!("network/networkDomain/{}", id), &[]).await {
            Err(ComputeError::Api { code, .. }) if code == "RESOURCE_NOT_FOUND" => {
                Err(ComputeError::NotFound(format!("network domain '{}'", id)))
            }
            other => other,
        }
    }
}

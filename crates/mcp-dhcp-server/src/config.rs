//! Service configuration.
//!
//! Settings come from a TOML file (`mcp-dhcp-server.toml` in the working
//! directory or `/etc`), with `MCP_*` environment variables taking
//! precedence over the file. Validation that needs the cloud API (VLAN,
//! network domain) happens later, in `Service::initialize`.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

const CONFIG_FILE_NAME: &str = "mcp-dhcp-server.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub debug: bool,
    pub mcp: McpSection,
    pub network: NetworkSection,
    pub ipxe: IpxeSection,
    pub dns: DnsSection,
}

/// CloudControl API credentials.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct McpSection {
    pub user: String,
    pub password: String,
    pub region: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// Local network interface the service is scoped to.
    pub interface: String,
    /// VLAN whose servers this service answers for.
    pub vlan_id: String,
    /// Address the service replies from (DHCP server identifier).
    pub service_ip: String,
    /// Local MAC-to-address bindings that shadow the cloud inventory.
    pub static_reservations: Vec<StaticReservationEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticReservationEntry {
    pub mac: String,
    pub name: String,
    pub ipv4: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IpxeSection {
    pub enable: bool,
    pub port: u16,
    pub boot_image: String,
    pub boot_script: String,
}

impl Default for IpxeSection {
    fn default() -> Self {
        Self {
            enable: false,
            port: 4777,
            boot_image: "undionly.kpxe".to_string(),
            boot_script: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DnsSection {
    pub enable: bool,
    pub port: u16,
    pub suffix: String,
    pub forward_to: ForwardSection,
}

impl Default for DnsSection {
    fn default() -> Self {
        Self {
            enable: false,
            port: 53,
            suffix: "mcp.".to_string(),
            forward_to: ForwardSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForwardSection {
    pub address: String,
    pub port: u16,
}

impl Default for ForwardSection {
    fn default() -> Self {
        Self {
            address: "8.8.8.8".to_string(),
            port: 53,
        }
    }
}

impl Config {
    /// Load configuration from the given file, or from the default search
    /// path, then apply environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::find_config_file()?,
        };

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read configuration file '{}'", path.display()))?;
        let mut config: Config = toml::from_str(&raw)
            .with_context(|| format!("cannot parse configuration file '{}'", path.display()))?;

        config.apply_env_overrides();

        Ok(config)
    }

    fn find_config_file() -> Result<PathBuf> {
        let candidates = [
            PathBuf::from(CONFIG_FILE_NAME),
            PathBuf::from("/etc").join(CONFIG_FILE_NAME),
        ];
        for candidate in &candidates {
            if candidate.is_file() {
                return Ok(candidate.clone());
            }
        }
        bail!(
            "no configuration file found (looked for ./{} and /etc/{})",
            CONFIG_FILE_NAME,
            CONFIG_FILE_NAME
        );
    }

    /// Environment variables win over file settings.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = env::var("MCP_USER") {
            self.mcp.user = value;
        }
        if let Ok(value) = env::var("MCP_PASSWORD") {
            self.mcp.password = value;
        }
        if let Ok(value) = env::var("MCP_REGION") {
            self.mcp.region = value;
        }
        if let Ok(value) = env::var("MCP_DHCP_DEBUG") {
            self.debug = parse_bool(&value);
        }
        if let Ok(value) = env::var("MCP_DHCP_INTERFACE") {
            self.network.interface = value;
        }
        if let Ok(value) = env::var("MCP_DHCP_VLAN_ID") {
            self.network.vlan_id = value;
        }
        if let Ok(value) = env::var("MCP_DHCP_SERVICE_IP") {
            self.network.service_ip = value;
        }
        if let Ok(value) = env::var("MCP_DNS_ENABLE") {
            self.dns.enable = parse_bool(&value);
        }
        if let Ok(value) = env::var("MCP_DNS_PORT") {
            if let Ok(port) = value.parse() {
                self.dns.port = port;
            }
        }
        if let Ok(value) = env::var("MCP_DNS_SUFFIX") {
            self.dns.suffix = value;
        }
        if let Ok(value) = env::var("MCP_DNS_FORWARD_TO") {
            self.dns.forward_to.address = value;
        }
        if let Ok(value) = env::var("MCP_DNS_FORWARD_TO_PORT") {
            if let Ok(port) = value.parse() {
                self.dns.forward_to.port = port;
            }
        }
        if let Ok(value) = env::var("MCP_IPXE_ENABLE") {
            self.ipxe.enable = parse_bool(&value);
        }
        if let Ok(value) = env::var("MCP_IPXE_PORT") {
            if let Ok(port) = value.parse() {
                self.ipxe.port = port;
            }
        }
        if let Ok(value) = env::var("MCP_IPXE_BOOT_IMAGE") {
            self.ipxe.boot_image = value;
        }
        if let Ok(value) = env::var("MCP_IPXE_BOOT_SCRIPT") {
            self.ipxe.boot_script = value;
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(!config.debug);
        assert!(!config.ipxe.enable);
        assert_eq!(config.ipxe.port, 4777);
        assert_eq!(config.ipxe.boot_image, "undionly.kpxe");
        assert!(!config.dns.enable);
        assert_eq!(config.dns.port, 53);
        assert_eq!(config.dns.suffix, "mcp.");
        assert_eq!(config.dns.forward_to.address, "8.8.8.8");
        assert_eq!(config.dns.forward_to.port, 53);
    }

    #[test]
    fn test_parse_toml() {
        let raw = r#"
            debug = true

            [mcp]
            user = "api-user"
            password = "secret"
            region = "AU"

            [network]
            interface = "eth1"
            vlan_id = "vlan-1"
            service_ip = "10.0.0.10"

            [[network.static_reservations]]
            mac = "AA:BB:CC:DD:EE:99"
            name = "bench-1"
            ipv4 = "192.168.70.10"

            [ipxe]
            enable = true
            boot_script = "http://x/boot.ipxe"
        "#;

        let config: Config = toml::from_str(raw).unwrap();
        assert!(config.debug);
        assert_eq!(config.mcp.region, "AU");
        assert_eq!(config.network.interface, "eth1");
        assert_eq!(config.network.static_reservations.len(), 1);
        assert_eq!(config.network.static_reservations[0].name, "bench-1");
        assert!(config.ipxe.enable);
        assert_eq!(config.ipxe.boot_image, "undionly.kpxe");
        assert_eq!(config.ipxe.boot_script, "http://x/boot.ipxe");
        assert_eq!(config.dns.port, 53);
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("1"));
        assert!(parse_bool("true"));
        assert!(parse_bool("Yes"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool(""));
    }

    #[test]
    fn test_env_overrides() {
        env::set_var("MCP_DHCP_INTERFACE", "eth9");
        env::set_var("MCP_IPXE_ENABLE", "true");
        env::set_var("MCP_IPXE_PORT", "4888");

        let mut config = Config::default();
        config.apply_env_overrides();

        env::remove_var("MCP_DHCP_INTERFACE");
        env::remove_var("MCP_IPXE_ENABLE");
        env::remove_var("MCP_IPXE_PORT");

        assert_eq!(config.network.interface, "eth9");
        assert!(config.ipxe.enable);
        assert_eq!(config.ipxe.port, 4888);
    }
}

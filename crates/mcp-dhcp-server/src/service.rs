//! Service state and lifecycle.
//!
//! One service instance owns the metadata snapshot, the lease table and the
//! DNS record set, all behind a single state lock, plus the long-lived
//! activities: the DHCP listener, the optional DNS listener and the
//! metadata refresh ticker.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cloudcontrol::error::ComputeError;
use cloudcontrol::models::{NetworkDomain, Vlan};
use cloudcontrol::ComputeApi;
use dhcp::{normalize_mac, DhcpOption};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::boot::BootDefaults;
use crate::config::Config;
use crate::dns::{ensure_fqdn, DnsData, DnsServer};
use crate::lease::{Lease, LeaseTable};
use crate::listener::{interface_ipv4, DhcpListener};
use crate::metadata::{self, MetadataSnapshot, ServerMetadata, StaticReservation};

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(24 * 60 * 60);
const DNS_RECORD_TTL: u32 = 60;

/// Shared mutable state, guarded by the service-wide lock.
pub struct ServiceState {
    pub metadata: MetadataSnapshot,
    pub leases: LeaseTable,
    pub dns: DnsData,
}

/// DNS listener settings resolved at initialization.
#[derive(Debug, Clone)]
pub struct DnsSettings {
    pub port: u16,
    pub forward_to: String,
}

/// Handles of the running activities; present iff the service is started.
struct ServiceRuntime {
    cancel_refresh: mpsc::Sender<()>,
    refresh_task: JoinHandle<()>,
    dhcp_listener: Arc<DhcpListener>,
    dhcp_task: JoinHandle<()>,
    dns_server: Option<Arc<DnsServer>>,
    dns_task: Option<JoinHandle<()>>,
    error_logger: JoinHandle<()>,
}

pub struct Service {
    compute: Arc<dyn ComputeApi>,

    pub(crate) network_domain: NetworkDomain,
    pub(crate) vlan: Vlan,

    pub(crate) service_ip: Ipv4Addr,
    /// Service-wide reply options (subnet mask, router, DNS), in emit order.
    pub(crate) dhcp_options: Vec<(u8, Vec<u8>)>,
    pub(crate) lease_duration: Duration,

    pub(crate) boot: BootDefaults,
    ipxe_port: u16,

    pub(crate) interface_name: String,
    pub(crate) interface_index: u32,
    pub(crate) listen_ip: Ipv4Addr,

    dns_suffix: String,
    dns_settings: Option<DnsSettings>,

    static_reservations: HashMap<String, StaticReservation>,

    pub(crate) state: Mutex<ServiceState>,
    runtime: Mutex<Option<ServiceRuntime>>,
}

impl Service {
    /// Validate the configuration and resolve everything the handlers need:
    /// the listener interface, the VLAN and its network domain, the subnet
    /// mask and gateway options. Fails fast with a message naming the
    /// offending field; nothing is listening yet.
    pub async fn initialize(config: Config, compute: Arc<dyn ComputeApi>) -> Result<Arc<Service>> {
        let interface_name = config.network.interface.clone();
        if interface_name.is_empty() {
            bail!("network.interface / MCP_DHCP_INTERFACE is required");
        }
        let interface_index = nix::net::if_::if_nametoindex(interface_name.as_str())
            .with_context(|| format!("cannot find local network interface named '{}'", interface_name))?;
        let listen_ip = interface_ipv4(&interface_name).with_context(|| {
            format!(
                "cannot find an IPv4 address bound to local network interface '{}'",
                interface_name
            )
        })?;

        let vlan = compute
            .get_vlan(&config.network.vlan_id)
            .await
            .with_context(|| format!("cannot find VLAN with id '{}'", config.network.vlan_id))?;
        let network_domain = compute
            .get_network_domain(&vlan.network_domain.id)
            .await
            .with_context(|| format!("cannot find network domain with id '{}'", vlan.network_domain.id))?;

        let vlan_base: Ipv4Addr = vlan.private_ipv4_range.address.parse().with_context(|| {
            format!(
                "VLAN '{}' has an invalid IPv4 range base address '{}'",
                vlan.name, vlan.private_ipv4_range.address
            )
        })?;
        let vlan_prefix = vlan.private_ipv4_range.prefix_size;
        if vlan_prefix > 32 {
            bail!("VLAN '{}' has an invalid IPv4 prefix size {}", vlan.name, vlan_prefix);
        }
        let gateway: Ipv4Addr = vlan.ipv4_gateway_address.parse().with_context(|| {
            format!(
                "VLAN '{}' has an invalid gateway address '{}'",
                vlan.name, vlan.ipv4_gateway_address
            )
        })?;

        let service_ip: Ipv4Addr = config.network.service_ip.parse().with_context(|| {
            format!(
                "network.service_ip / MCP_DHCP_SERVICE_IP ('{}') is not a valid IPv4 address",
                config.network.service_ip
            )
        })?;

        let mut static_reservations = HashMap::new();
        for entry in &config.network.static_reservations {
            let reservation = StaticReservation {
                mac_address: normalize_mac(&entry.mac),
                host_name: entry.name.clone(),
                ipv4_address: entry.ipv4.parse().with_context(|| {
                    format!(
                        "static reservation for '{}' has an invalid IPv4 address '{}'",
                        entry.mac, entry.ipv4
                    )
                })?,
            };
            info!(
                "Adding static IP reservation for {} ({}): {}",
                reservation.mac_address, reservation.host_name, reservation.ipv4_address
            );
            static_reservations.insert(reservation.mac_address.clone(), reservation);
        }
        if static_reservations.is_empty() {
            // Without static reservations the service must actually live on
            // the VLAN it serves.
            if !cidr_contains(vlan_base, vlan_prefix, service_ip) {
                bail!(
                    "service IP address {} does not lie within the IP network ({}/{}) of the target VLAN ('{}')",
                    service_ip,
                    vlan_base,
                    vlan_prefix,
                    vlan.name
                );
            }
        } else {
            info!("Static reservations configured; skipping VLAN range check.");
        }

        if config.ipxe.enable {
            if config.ipxe.boot_image.is_empty() {
                bail!("ipxe.boot_image / MCP_IPXE_BOOT_IMAGE must be set if ipxe.enable / MCP_IPXE_ENABLE is true");
            }
            if config.ipxe.boot_script.is_empty() {
                bail!("ipxe.boot_script / MCP_IPXE_BOOT_SCRIPT must be set if ipxe.enable / MCP_IPXE_ENABLE is true");
            }
        }

        let dns_settings = if config.dns.enable {
            if config.dns.port < 53 {
                bail!("dns.port ({}) is invalid", config.dns.port);
            }
            if config.dns.suffix.is_empty() {
                bail!("dns.suffix / MCP_DNS_SUFFIX is optional, but cannot be empty");
            }
            if config.dns.forward_to.address.is_empty() {
                bail!("dns.forward_to.address / MCP_DNS_FORWARD_TO is optional, but cannot be empty");
            }
            if config.dns.forward_to.port == 0 {
                bail!("dns.forward_to.port / MCP_DNS_FORWARD_TO_PORT is optional, but cannot be empty");
            }
            Some(DnsSettings {
                port: config.dns.port,
                forward_to: format!("{}:{}", config.dns.forward_to.address, config.dns.forward_to.port),
            })
        } else {
            None
        };
        let dns_suffix = ensure_fqdn(&config.dns.suffix);

        let dhcp_options: Vec<(u8, Vec<u8>)> = vec![
            (DhcpOption::SubnetMask as u8, subnet_mask(vlan_prefix).octets().to_vec()),
            (DhcpOption::Router as u8, gateway.octets().to_vec()),
            (DhcpOption::DomainNameServer as u8, vec![8, 8, 8, 8]),
        ];

        let boot = BootDefaults {
            enable_ipxe: config.ipxe.enable,
            pxe_boot_image: config.ipxe.boot_image.clone(),
            ipxe_boot_script: config.ipxe.boot_script.clone(),
            tftp_server_name: service_ip.to_string(),
        };

        Ok(Arc::new(Service {
            compute,
            network_domain,
            vlan,
            service_ip,
            dhcp_options,
            lease_duration: DEFAULT_LEASE_DURATION,
            boot,
            ipxe_port: config.ipxe.port,
            interface_name,
            interface_index,
            listen_ip,
            dns_suffix,
            dns_settings,
            static_reservations,
            state: Mutex::new(ServiceState {
                metadata: MetadataSnapshot::new(),
                leases: LeaseTable::new(),
                dns: DnsData::new(DNS_RECORD_TTL),
            }),
            runtime: Mutex::new(None),
        }))
    }

    /// Start the service: prime the metadata cache, launch the refresh
    /// ticker and the listeners.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut runtime_slot = self.runtime.lock().await;
        if runtime_slot.is_some() {
            bail!("listeners are already running");
        }

        info!("Initialising CloudControl metadata cache...");
        {
            // The initial refresh runs with the state lock held so that
            // Start serializes against a concurrent Stop.
            let mut state = self.state.lock().await;
            if let Err(err) = self.refresh_internal(Some(&mut *state)).await {
                error!("Error refreshing servers: {}", err);
            }
        }
        info!("All caches initialised.");

        let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);
        let refresh_service = Arc::clone(self);
        let refresh_task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + REFRESH_INTERVAL;
            let mut ticker = tokio::time::interval_at(start, REFRESH_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel_rx.recv() => return,
                    _ = ticker.tick() => {
                        debug!("Refreshing server metadata...");
                        if let Err(err) = refresh_service.refresh_server_metadata().await {
                            error!("Error refreshing servers: {}", err);
                        }
                        debug!("Refreshed server metadata.");
                    }
                }
            }
        });

        let (error_tx, mut error_rx) = mpsc::unbounded_channel::<anyhow::Error>();
        let error_logger = tokio::spawn(async move {
            while let Some(err) = error_rx.recv().await {
                error!("Listener error: {:#}", err);
            }
        });

        info!(
            "Starting service listeners for VLAN '{}' in network domain '{}' (bound to local network interface '{}' / {})...",
            self.vlan.name, self.network_domain.name, self.interface_name, self.listen_ip
        );

        let dhcp_listener =
            Arc::new(DhcpListener::bind(self.interface_index).context("failed to start service listeners")?);
        let dhcp_task = {
            let service = Arc::clone(self);
            let listener = Arc::clone(&dhcp_listener);
            let errors = error_tx.clone();
            tokio::spawn(async move { listener.run(service, errors).await })
        };

        let (dns_server, dns_task) = match &self.dns_settings {
            Some(settings) => {
                let server = Arc::new(
                    DnsServer::bind(self.listen_ip, settings.port, self.dns_suffix.clone(), settings.forward_to.clone())
                        .await
                        .context("failed to start DNS listener")?,
                );
                let task = {
                    let service = Arc::clone(self);
                    let server = Arc::clone(&server);
                    let errors = error_tx.clone();
                    tokio::spawn(async move { server.run(service, errors).await })
                };
                (Some(server), Some(task))
            }
            None => (None, None),
        };

        *runtime_slot = Some(ServiceRuntime {
            cancel_refresh: cancel_tx,
            refresh_task,
            dhcp_listener,
            dhcp_task,
            dns_server,
            dns_task,
            error_logger,
        });

        Ok(())
    }

    /// Stop the service. Succeeds iff the listeners are running.
    pub async fn stop(&self) -> Result<()> {
        let mut runtime_slot = self.runtime.lock().await;
        let runtime = match runtime_slot.take() {
            Some(runtime) => runtime,
            None => bail!("listeners are not running"),
        };

        info!(
            "Stopping service listeners (bound to local network interface '{}' / {})...",
            self.interface_name, self.listen_ip
        );

        let _ = runtime.cancel_refresh.send(()).await;
        runtime.dhcp_listener.shutdown();
        if let Some(dns_server) = &runtime.dns_server {
            dns_server.shutdown();
        }

        let _ = runtime.refresh_task.await;
        let _ = runtime.dhcp_task.await;
        if let Some(task) = runtime.dns_task {
            let _ = task.await;
        }
        runtime.error_logger.abort();

        Ok(())
    }

    /// Whether the listeners are currently running.
    pub async fn is_running(&self) -> bool {
        self.runtime.lock().await.is_some()
    }

    /// Rebuild the metadata snapshot from CloudControl and swap it in.
    /// On failure the previous snapshot stays in place.
    pub async fn refresh_server_metadata(&self) -> Result<(), ComputeError> {
        self.refresh_internal(None).await
    }

    /// `already_locked` carries the state guard when the caller holds the
    /// lock (Start's inline refresh); otherwise the lock is taken only for
    /// the snapshot swap.
    async fn refresh_internal(&self, already_locked: Option<&mut ServiceState>) -> Result<(), ComputeError> {
        let snapshot = metadata::read_server_metadata(
            self.compute.as_ref(),
            &self.network_domain.id,
            &self.network_domain.datacenter_id,
            self.service_ip,
            self.ipxe_port,
        )
        .await?;
        let dns = DnsData::from_snapshot(&snapshot, &self.dns_suffix, DNS_RECORD_TTL);

        match already_locked {
            Some(state) => {
                state.metadata = snapshot;
                state.dns = dns;
            }
            None => {
                let mut state = self.state.lock().await;
                state.metadata = snapshot;
                state.dns = dns;
            }
        }

        Ok(())
    }

    /// Find the metadata for the server (if any) owning an adapter with the
    /// given MAC address. Static reservations shadow the cloud snapshot.
    pub async fn find_server_by_mac(&self, mac: &str) -> Option<ServerMetadata> {
        let mac = normalize_mac(mac);

        let state = self.state.lock().await;
        if let Some(reservation) = self.static_reservations.get(&mac) {
            return Some(reservation.to_metadata());
        }
        state.metadata.get(&mac).cloned()
    }

    pub fn service_ip(&self) -> Ipv4Addr {
        self.service_ip
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    pub async fn find_lease(&self, mac: &str) -> Option<Lease> {
        let state = self.state.lock().await;
        state.leases.find(&normalize_mac(mac)).cloned()
    }

    pub async fn lease_count(&self) -> usize {
        let state = self.state.lock().await;
        state.leases.len()
    }

    /// Authoritative A lookup against the current DNS record set.
    pub async fn dns_lookup_a(&self, name: &str) -> Option<Ipv4Addr> {
        let state = self.state.lock().await;
        state.dns.find_a(name)
    }
}

/// Netmask for a prefix length.
fn subnet_mask(prefix: u8) -> Ipv4Addr {
    if prefix == 0 {
        Ipv4Addr::UNSPECIFIED
    } else {
        Ipv4Addr::from(u32::MAX << (32 - u32::from(prefix)))
    }
}

fn cidr_contains(base: Ipv4Addr, prefix: u8, ip: Ipv4Addr) -> bool {
    let mask = u32::from(subnet_mask(prefix));
    (u32::from(base) & mask) == (u32::from(ip) & mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnet_mask() {
        assert_eq!(subnet_mask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(subnet_mask(16), Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(subnet_mask(32), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(subnet_mask(0), Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_cidr_contains() {
        let base = Ipv4Addr::new(10, 0, 0, 0);
        assert!(cidr_contains(base, 24, Ipv4Addr::new(10, 0, 0, 10)));
        assert!(!cidr_contains(base, 24, Ipv4Addr::new(10, 0, 1, 10)));
        assert!(cidr_contains(base, 16, Ipv4Addr::new(10, 0, 1, 10)));
        assert!(cidr_contains(base, 0, Ipv4Addr::new(192, 168, 1, 1)));
    }
}

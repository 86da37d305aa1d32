//! DNS responder for known hosts, with fallback forwarding.
//!
//! Answers A and PTR queries authoritatively for servers in the metadata
//! snapshot (`<server-name>.<suffix>`), rebuilt on every refresh. Names
//! outside the suffix, other query types and multi-question messages are
//! relayed verbatim to the configured upstream resolver.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, PTR};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::metadata::MetadataSnapshot;
use crate::service::Service;

const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

/// Append a trailing dot when missing.
pub fn ensure_fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

/// The `in-addr.arpa` name for an IPv4 address.
pub fn reverse_name(ip: Ipv4Addr) -> String {
    let octets = ip.octets();
    format!("{}.{}.{}.{}.in-addr.arpa.", octets[3], octets[2], octets[1], octets[0])
}

/// Authoritative records for known hosts.
#[derive(Debug, Clone, Default)]
pub struct DnsData {
    v4_addresses: HashMap<String, Ipv4Addr>,
    reverse_lookups: HashMap<String, String>,
    default_ttl: u32,
}

impl DnsData {
    pub fn new(default_ttl: u32) -> Self {
        Self {
            default_ttl,
            ..Default::default()
        }
    }

    /// Build the record set for a metadata snapshot: an A record per host
    /// name under the suffix, and a PTR record per address.
    pub fn from_snapshot(snapshot: &MetadataSnapshot, suffix: &str, default_ttl: u32) -> Self {
        let mut data = Self::new(default_ttl);
        for (mac, server) in snapshot {
            if let Some(ip) = server.ipv4_by_mac.get(mac) {
                data.add(&format!("{}.{}", server.name, suffix), *ip);
            }
        }
        data
    }

    pub fn add(&mut self, name: &str, ip: Ipv4Addr) {
        let fqdn = ensure_fqdn(&name.to_ascii_lowercase());
        self.reverse_lookups.insert(reverse_name(ip), fqdn.clone());
        self.v4_addresses.insert(fqdn, ip);
    }

    pub fn find_a(&self, name: &str) -> Option<Ipv4Addr> {
        self.v4_addresses.get(&ensure_fqdn(&name.to_ascii_lowercase())).copied()
    }

    pub fn find_ptr(&self, arpa: &str) -> Option<&str> {
        self.reverse_lookups
            .get(&ensure_fqdn(&arpa.to_ascii_lowercase()))
            .map(String::as_str)
    }

    pub fn ttl(&self) -> u32 {
        self.default_ttl
    }

    pub fn is_empty(&self) -> bool {
        self.v4_addresses.is_empty()
    }
}

pub struct DnsServer {
    socket: UdpSocket,
    suffix: String,
    forward_to: String,
    shutdown: Notify,
}

impl DnsServer {
    pub async fn bind(listen_ip: Ipv4Addr, port: u16, suffix: String, forward_to: String) -> Result<Self> {
        let socket = UdpSocket::bind((listen_ip, port))
            .await
            .with_context(|| format!("failed to bind DNS listener to {}:{}", listen_ip, port))?;

        Ok(Self {
            socket,
            suffix: ensure_fqdn(&suffix.to_ascii_lowercase()),
            forward_to,
            shutdown: Notify::new(),
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Serve queries until `shutdown`.
    pub async fn run(&self, service: Arc<Service>, errors: UnboundedSender<anyhow::Error>) {
        let mut buf = vec![0u8; 4096];

        loop {
            let received = tokio::select! {
                _ = self.shutdown.notified() => return,
                result = self.socket.recv_from(&mut buf) => result,
            };

            let (len, source) = match received {
                Ok(read) => read,
                Err(err) => {
                    let _ = errors.send(anyhow::Error::new(err).context("DNS socket read failed"));
                    continue;
                }
            };

            let response = match self.handle_query(&service, &buf[..len]).await {
                Some(response) => response,
                None => continue,
            };

            if let Err(err) = self.socket.send_to(&response, source).await {
                let _ = errors
                    .send(anyhow::Error::new(err).context(format!("failed to send DNS response to {}", source)));
            }
        }
    }

    async fn handle_query(&self, service: &Service, raw: &[u8]) -> Option<Vec<u8>> {
        let request = match Message::from_vec(raw) {
            Ok(message) => message,
            Err(err) => {
                debug!("Ignoring malformed DNS query: {}", err);
                return None;
            }
        };

        if request.queries().len() != 1 {
            // Anything we don't know how to handle goes to the fallback.
            return self.forward(raw, request.id()).await;
        }

        let query = request.queries()[0].clone();
        let name = query.name().to_ascii().to_ascii_lowercase();

        match query.query_type() {
            RecordType::A => {
                let found = {
                    let state = service.state.lock().await;
                    state.dns.find_a(&name).map(|ip| (ip, state.dns.ttl()))
                };
                match found {
                    Some((ip, ttl)) => {
                        let record = Record::from_rdata(query.name().clone(), ttl, RData::A(A(ip)));
                        build_answer(&request, vec![record])
                    }
                    None if self.name_under_suffix(&name) => build_nxdomain(&request),
                    None => self.forward(raw, request.id()).await,
                }
            }
            RecordType::AAAA => {
                // No IPv6 records are tracked: a known name answers empty,
                // an unknown name under the suffix does not exist.
                let known = {
                    let state = service.state.lock().await;
                    state.dns.find_a(&name).is_some()
                };
                if known {
                    build_answer(&request, Vec::new())
                } else if self.name_under_suffix(&name) {
                    build_nxdomain(&request)
                } else {
                    self.forward(raw, request.id()).await
                }
            }
            RecordType::PTR => {
                let found = {
                    let state = service.state.lock().await;
                    state
                        .dns
                        .find_ptr(&name)
                        .map(|target| (target.to_string(), state.dns.ttl()))
                };
                match found {
                    Some((target, ttl)) => {
                        let target = Name::from_ascii(&target).ok()?;
                        let record = Record::from_rdata(query.name().clone(), ttl, RData::PTR(PTR(target)));
                        build_answer(&request, vec![record])
                    }
                    None => self.forward(raw, request.id()).await,
                }
            }
            _ => self.forward(raw, request.id()).await,
        }
    }

    fn name_under_suffix(&self, name: &str) -> bool {
        name == self.suffix || name.ends_with(&format!(".{}", self.suffix))
    }

    /// Relay the raw query to the upstream resolver and hand back its
    /// response unchanged.
    async fn forward(&self, raw: &[u8], id: u16) -> Option<Vec<u8>> {
        debug!("Forwarding DNS request {} to '{}'.", id, self.forward_to);

        let upstream = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(socket) => socket,
            Err(err) => {
                warn!("Unable to forward DNS request {}: {}", id, err);
                return None;
            }
        };
        if let Err(err) = upstream.send_to(raw, self.forward_to.as_str()).await {
            warn!("Unable to forward DNS request {} to '{}': {}", id, self.forward_to, err);
            return None;
        }

        let mut buf = vec![0u8; 4096];
        match tokio::time::timeout(FORWARD_TIMEOUT, upstream.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => {
                buf.truncate(len);
                Some(buf)
            }
            Ok(Err(err)) => {
                warn!("Unable to read DNS response {} from '{}': {}", id, self.forward_to, err);
                None
            }
            Err(_) => {
                warn!("Timed out forwarding DNS request {} to '{}'.", id, self.forward_to);
                None
            }
        }
    }
}

fn build_answer(request: &Message, records: Vec<Record>) -> Option<Vec<u8>> {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_authoritative(true);
    for query in request.queries() {
        response.add_query(query.clone());
    }
    for record in records {
        response.add_answer(record);
    }

    match response.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            warn!("Failed to encode DNS response {}: {}", request.id(), err);
            None
        }
    }
}

fn build_nxdomain(request: &Message) -> Option<Vec<u8>> {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_authoritative(true);
    response.set_response_code(ResponseCode::NXDomain);
    for query in request.queries() {
        response.add_query(query.clone());
    }

    match response.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            warn!("Failed to encode DNS response {}: {}", request.id(), err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use std::collections::HashMap;

    use cloudcontrol::mock::MockCompute;
    use cloudcontrol::models::{EntityRef, Ipv4Range, NetworkDomain, Vlan};

    use crate::config::Config;
    use crate::metadata::ServerMetadata;

    #[test]
    fn test_ensure_fqdn() {
        assert_eq!(ensure_fqdn("mcp"), "mcp.");
        assert_eq!(ensure_fqdn("mcp."), "mcp.");
        assert_eq!(ensure_fqdn("web-1.mcp."), "web-1.mcp.");
    }

    #[test]
    fn test_reverse_name() {
        assert_eq!(reverse_name(Ipv4Addr::new(10, 0, 0, 20)), "20.0.0.10.in-addr.arpa.");
    }

    #[test]
    fn test_dns_data_lookup() {
        let mut data = DnsData::new(60);
        data.add("web-1.mcp.", Ipv4Addr::new(10, 0, 0, 20));

        assert_eq!(data.find_a("web-1.mcp."), Some(Ipv4Addr::new(10, 0, 0, 20)));
        assert_eq!(data.find_a("WEB-1.MCP."), Some(Ipv4Addr::new(10, 0, 0, 20)));
        assert_eq!(data.find_a("web-1.mcp"), Some(Ipv4Addr::new(10, 0, 0, 20)));
        assert_eq!(data.find_a("web-2.mcp."), None);

        assert_eq!(data.find_ptr("20.0.0.10.in-addr.arpa."), Some("web-1.mcp."));
        assert_eq!(data.find_ptr("21.0.0.10.in-addr.arpa."), None);
    }

    #[test]
    fn test_dns_data_from_snapshot() {
        let mut snapshot = MetadataSnapshot::new();
        let mut ipv4_by_mac = HashMap::new();
        ipv4_by_mac.insert("aa:bb:cc:dd:ee:02".to_string(), Ipv4Addr::new(10, 0, 0, 20));
        snapshot.insert(
            "aa:bb:cc:dd:ee:02".to_string(),
            ServerMetadata {
                id: "srv-1".to_string(),
                name: "web-1".to_string(),
                ipv4_by_mac,
                pxe_boot_image: None,
                ipxe_boot_script: None,
            },
        );

        let data = DnsData::from_snapshot(&snapshot, "mcp.", 60);
        assert_eq!(data.find_a("web-1.mcp."), Some(Ipv4Addr::new(10, 0, 0, 20)));
        assert_eq!(data.find_ptr("20.0.0.10.in-addr.arpa."), Some("web-1.mcp."));
    }

    fn dns_query(name: &str, query_type: RecordType) -> Message {
        let mut request = Message::new();
        request.set_id(0x4242);
        request.set_recursion_desired(true);
        request.add_query(Query::query(Name::from_ascii(name).unwrap(), query_type));
        request
    }

    fn a_query(name: &str) -> Message {
        dns_query(name, RecordType::A)
    }

    #[test]
    fn test_build_answer_roundtrip() {
        let request = a_query("web-1.mcp.");
        let record = Record::from_rdata(
            Name::from_ascii("web-1.mcp.").unwrap(),
            60,
            RData::A(A(Ipv4Addr::new(10, 0, 0, 20))),
        );

        let bytes = build_answer(&request, vec![record]).unwrap();
        let response = Message::from_vec(&bytes).unwrap();

        assert_eq!(response.id(), 0x4242);
        assert!(response.authoritative());
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.answers().len(), 1);
        match response.answers()[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0, Ipv4Addr::new(10, 0, 0, 20)),
            other => panic!("unexpected answer: {:?}", other),
        }
    }

    #[test]
    fn test_build_nxdomain_roundtrip() {
        let request = a_query("missing.mcp.");
        let bytes = build_nxdomain(&request).unwrap();
        let response = Message::from_vec(&bytes).unwrap();

        assert_eq!(response.id(), 0x4242);
        assert!(response.authoritative());
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert!(response.answers().is_empty());
    }

    /// A service answering for "web-1" at 10.0.0.20, backed by the mock
    /// compute API and scoped to the loopback interface.
    async fn test_service() -> Arc<Service> {
        let mock = Arc::new(MockCompute::new());
        mock.add_vlan(Vlan {
            id: "vlan-1".to_string(),
            name: "test-vlan".to_string(),
            network_domain: EntityRef {
                id: "domain-1".to_string(),
                name: None,
            },
            private_ipv4_range: Ipv4Range {
                address: "10.0.0.0".to_string(),
                prefix_size: 24,
            },
            ipv4_gateway_address: "10.0.0.1".to_string(),
        });
        mock.add_network_domain(NetworkDomain {
            id: "domain-1".to_string(),
            name: "test-domain".to_string(),
            datacenter_id: "DC1".to_string(),
        });
        mock.add_server(MockCompute::server("srv-1", "web-1", "aa:bb:cc:dd:ee:02", Some("10.0.0.20")));

        let config: Config = toml::from_str(
            r#"
            [mcp]
            user = "api-user"
            password = "secret"
            region = "AU"

            [network]
            interface = "lo"
            vlan_id = "vlan-1"
            service_ip = "10.0.0.10"
        "#,
        )
        .unwrap();

        let service = Service::initialize(config, mock).await.unwrap();
        service.refresh_server_metadata().await.unwrap();
        service
    }

    async fn test_server() -> DnsServer {
        DnsServer::bind(Ipv4Addr::LOCALHOST, 0, "mcp.".to_string(), "127.0.0.1:9".to_string())
            .await
            .unwrap()
    }

    async fn dispatch(server: &DnsServer, service: &Service, request: &Message) -> Message {
        let raw = request.to_vec().unwrap();
        let bytes = server.handle_query(service, &raw).await.unwrap();
        Message::from_vec(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_handle_query_answers_known_name() {
        let service = test_service().await;
        let server = test_server().await;

        let response = dispatch(&server, &service, &a_query("web-1.mcp.")).await;

        assert_eq!(response.id(), 0x4242);
        assert!(response.authoritative());
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.answers().len(), 1);
        match response.answers()[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0, Ipv4Addr::new(10, 0, 0, 20)),
            other => panic!("unexpected answer: {:?}", other),
        }
    }

    /// An unknown name under the suffix does not exist; the reply is
    /// NXDOMAIN, not ServerFailure.
    #[tokio::test]
    async fn test_handle_query_nxdomain_for_unknown_suffixed_name() {
        let service = test_service().await;
        let server = test_server().await;

        let response = dispatch(&server, &service, &a_query("web-2.mcp.")).await;

        assert_eq!(response.id(), 0x4242);
        assert!(response.authoritative());
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert!(response.answers().is_empty());
    }

    /// An AAAA query for a known name answers empty instead of NXDOMAIN;
    /// an unknown suffixed name is NXDOMAIN like its A counterpart.
    #[tokio::test]
    async fn test_handle_query_aaaa_dispatch() {
        let service = test_service().await;
        let server = test_server().await;

        let response = dispatch(&server, &service, &dns_query("web-1.mcp.", RecordType::AAAA)).await;
        assert!(response.authoritative());
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());

        let response = dispatch(&server, &service, &dns_query("web-2.mcp.", RecordType::AAAA)).await;
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
    }

    #[tokio::test]
    async fn test_handle_query_answers_reverse_lookup() {
        let service = test_service().await;
        let server = test_server().await;

        let response = dispatch(
            &server,
            &service,
            &dns_query("20.0.0.10.in-addr.arpa.", RecordType::PTR),
        )
        .await;

        assert!(response.authoritative());
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.answers().len(), 1);
        match response.answers()[0].data() {
            Some(RData::PTR(ptr)) => assert_eq!(ptr.0.to_ascii(), "web-1.mcp."),
            other => panic!("unexpected answer: {:?}", other),
        }
    }
}

//! DHCP request handling.
//!
//! Dispatches decoded requests against the metadata cache and the lease
//! table, and shapes the Offer/ACK/NAK replies. Returning `None` means no
//! reply is sent; DHCP is best-effort and the client will retry.

use std::net::Ipv4Addr;

use dhcp::{DhcpOption, DhcpPacket, MessageType};
use tracing::info;

use crate::boot::{self, BootDirective};
use crate::metadata::ServerMetadata;
use crate::service::Service;

/// The DHCP transaction id in its logging form.
fn txn_id(request: &DhcpPacket) -> String {
    format!("0x{:08X}", request.xid)
}

impl Service {
    /// Handle one DHCP request.
    pub async fn serve_dhcp(&self, request: &DhcpPacket, msg_type: MessageType) -> Option<DhcpPacket> {
        match msg_type {
            MessageType::Discover => self.handle_discover(request).await,
            MessageType::Request => self.handle_request(request).await,
            MessageType::Release => self.handle_release(request).await,
            other => {
                info!(
                    "[TXN: {}] Ignoring unhandled DHCP message type ({}).",
                    txn_id(request),
                    other
                );
                Some(self.reply_nak(request))
            }
        }
    }

    async fn handle_discover(&self, request: &DhcpPacket) -> Option<DhcpPacket> {
        let transaction_id = txn_id(request);
        let client_mac = request.mac_string();

        info!(
            "[TXN: {}] Discover message from client with MAC address {} (IP '{}').",
            transaction_id, client_mac, request.ciaddr
        );

        let server = match self.find_server_by_mac(&client_mac).await {
            Some(server) => server,
            None => {
                info!(
                    "[TXN: {}] MAC address {} does not correspond to a server in CloudControl (no reply will be sent).",
                    transaction_id, client_mac
                );
                return None;
            }
        };

        let target_ip = match server.ip_for_mac(&client_mac) {
            Some(ip) => ip,
            None => {
                info!(
                    "[TXN: {}] MAC address {} does not correspond to a network adapter in CloudControl (no reply will be sent).",
                    transaction_id, client_mac
                );
                return None;
            }
        };

        info!(
            "[TXN: {}] Offer IPv4 address {} to server {} and send Offer reply.",
            transaction_id, target_ip, server.name
        );

        Some(self.build_reply(request, MessageType::Offer, target_ip, &server))
    }

    async fn handle_request(&self, request: &DhcpPacket) -> Option<DhcpPacket> {
        let transaction_id = txn_id(request);
        let client_mac = request.mac_string();

        info!(
            "[TXN: {}] Request message from client with MAC address {} (IP '{}').",
            transaction_id, client_mac, request.ciaddr
        );

        let server = match self.find_server_by_mac(&client_mac).await {
            Some(server) => server,
            None => {
                info!(
                    "[TXN: {}] MAC address {} does not correspond to a server in CloudControl; send NAK reply.",
                    transaction_id, client_mac
                );
                return Some(self.reply_nak(request));
            }
        };

        // Renewal: an unexpired lease slides forward and keeps its address.
        let renewed = {
            let mut state = self.state.lock().await;
            let active = state
                .leases
                .find(&client_mac)
                .map(|lease| !lease.is_expired())
                .unwrap_or(false);
            if active {
                state.leases.renew(&client_mac, self.lease_duration)
            } else {
                None
            }
        };
        if let Some(lease) = renewed {
            info!(
                "[TXN: {}] Renew lease on IPv4 address {} for server {} and send ACK reply.",
                transaction_id, lease.ipv4_address, server.name
            );
            return Some(self.build_reply(request, MessageType::Ack, lease.ipv4_address, &server));
        }

        // New lease.
        let target_ip = match server.ip_for_mac(&client_mac) {
            Some(ip) => ip,
            None => {
                info!(
                    "[TXN: {}] Cannot resolve network adapter in server {} ({}) with MAC address {}; send NAK reply.",
                    transaction_id, server.name, server.id, client_mac
                );
                return Some(self.reply_nak(request));
            }
        };

        let lease = {
            let mut state = self.state.lock().await;
            state.leases.create(&client_mac, target_ip, self.lease_duration)
        };

        info!(
            "[TXN: {}] Create lease on IPv4 address {} for server {} (MAC address {}) and send ACK reply.",
            transaction_id, lease.ipv4_address, server.name, client_mac
        );

        Some(self.build_reply(request, MessageType::Ack, lease.ipv4_address, &server))
    }

    async fn handle_release(&self, request: &DhcpPacket) -> Option<DhcpPacket> {
        let transaction_id = txn_id(request);
        let client_mac = request.mac_string();

        info!(
            "[TXN: {}] Release message from client with MAC address {} (IP '{}').",
            transaction_id, client_mac, request.ciaddr
        );

        let server = match self.find_server_by_mac(&client_mac).await {
            Some(server) => server,
            None => {
                info!(
                    "[TXN: {}] MAC address {} does not correspond to a server in CloudControl (no reply will be sent).",
                    transaction_id, client_mac
                );
                return None;
            }
        };

        let removed = {
            let mut state = self.state.lock().await;
            let active = state
                .leases
                .find(&client_mac)
                .map(|lease| !lease.is_expired())
                .unwrap_or(false);
            if active {
                state.leases.expire(&client_mac)
            } else {
                None
            }
        };

        match removed {
            Some(lease) => info!(
                "[TXN: {}] Server '{}' ({}) requested termination of lease on IPv4 address {}.",
                transaction_id, server.name, server.id, lease.ipv4_address
            ),
            None => info!(
                "[TXN: {}] Server '{}' ({}) requested termination of expired or non-existent lease; request ignored.",
                transaction_id, server.name, server.id
            ),
        }

        // Release is unicast and unacknowledged (RFC 2131); never reply.
        None
    }

    /// Build an Offer or ACK: server identifier, lease time, the service
    /// options the client asked for (in its order) followed by the rest,
    /// the host name, and boot options for PXE clients.
    fn build_reply(
        &self,
        request: &DhcpPacket,
        message_type: MessageType,
        target_ip: Ipv4Addr,
        server: &ServerMetadata,
    ) -> DhcpPacket {
        let mut reply = request.create_reply(message_type);
        reply.yiaddr = target_ip;

        reply.add_ip_option(DhcpOption::ServerIdentifier as u8, self.service_ip);
        reply.add_u32_option(DhcpOption::IpAddressLeaseTime as u8, self.lease_duration.as_secs() as u32);

        let mut service_options = self.dhcp_options.clone();
        service_options.push((DhcpOption::HostName as u8, server.name.as_bytes().to_vec()));
        for (code, data) in select_order_or_all(&service_options, request.parameter_request_list()) {
            reply.add_option(code, &data);
        }

        if self.boot.enable_ipxe && boot::is_pxe_client(request.vendor_class_identifier().as_deref()) {
            self.add_boot_options(request, &mut reply, server);
        }

        reply.siaddr = self.service_ip;
        reply
    }

    fn reply_nak(&self, request: &DhcpPacket) -> DhcpPacket {
        let mut reply = request.create_reply(MessageType::Nak);
        // No lease time on NAK.
        reply.add_ip_option(DhcpOption::ServerIdentifier as u8, self.service_ip);
        reply.siaddr = self.service_ip;
        reply
    }

    fn add_boot_options(&self, request: &DhcpPacket, reply: &mut DhcpPacket, server: &ServerMetadata) {
        let transaction_id = txn_id(request);
        let directive = boot::resolve(
            &self.boot,
            request.vendor_class_identifier().as_deref(),
            request.user_class().as_deref(),
            server.pxe_boot_image.as_deref(),
            server.ipxe_boot_script.as_deref(),
        );

        match directive {
            Some(BootDirective::IpxeScript { script_url }) => {
                info!(
                    "[TXN: {}] Client with MAC address {} is an iPXE client; directing them to boot script '{}'.",
                    transaction_id,
                    request.mac_string(),
                    script_url
                );
                reply.set_boot_file(&script_url);
                reply.add_string_option(DhcpOption::BootfileName as u8, &script_url);
            }
            Some(BootDirective::PxeImage { boot_file, tftp_server }) => {
                info!(
                    "[TXN: {}] Client with MAC address {} is a regular PXE client; directing them to boot image 'tftp://{}/{}'.",
                    transaction_id,
                    request.mac_string(),
                    tftp_server,
                    boot_file
                );
                reply.set_boot_file(&boot_file);
                reply.add_string_option(DhcpOption::TftpServerName as u8, &tftp_server);
                reply.add_string_option(DhcpOption::BootfileName as u8, &boot_file);
            }
            None => {}
        }

        // Mark the reply as coming from a PXE-capable DHCP server.
        reply.add_string_option(DhcpOption::VendorClassIdentifier as u8, "PXEServer");
    }
}

/// Pick the options the client listed in its parameter request list, in the
/// client's order, then append the remaining service options.
fn select_order_or_all(options: &[(u8, Vec<u8>)], requested: Option<&[u8]>) -> Vec<(u8, Vec<u8>)> {
    match requested {
        Some(codes) => {
            let mut selected = Vec::with_capacity(options.len());
            for code in codes {
                if let Some(entry) = options.iter().find(|(c, _)| c == code) {
                    selected.push(entry.clone());
                }
            }
            for entry in options {
                if !codes.contains(&entry.0) {
                    selected.push(entry.clone());
                }
            }
            selected
        }
        None => options.to_vec(),
    }
}

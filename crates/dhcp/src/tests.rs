use std::net::Ipv4Addr;

use crate::packet::DhcpPacket;
use crate::{format_mac, normalize_mac, DhcpOption, MessageType, OpCode};

#[test]
fn test_mac_formatting() {
    assert_eq!(format_mac(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]), "aa:bb:cc:dd:ee:01");
    assert_eq!(normalize_mac("AA:BB:CC:DD:EE:01"), "aa:bb:cc:dd:ee:01");
    assert_eq!(normalize_mac("  aa:bb:cc:dd:ee:01 "), "aa:bb:cc:dd:ee:01");
}

#[test]
fn test_packet_mac_string() {
    let mut packet = DhcpPacket::new();
    packet.set_mac_address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x02]);
    assert_eq!(packet.mac_string(), "aa:bb:cc:dd:ee:02");
}

#[test]
fn test_message_type_conversion() {
    assert_eq!(MessageType::try_from(1).unwrap(), MessageType::Discover);
    assert_eq!(MessageType::try_from(3).unwrap(), MessageType::Request);
    assert_eq!(MessageType::try_from(6).unwrap(), MessageType::Nak);
    assert_eq!(MessageType::try_from(7).unwrap(), MessageType::Release);
    assert!(MessageType::try_from(99).is_err());
}

#[test]
fn test_option_accessors() {
    let mut packet = DhcpPacket::new();
    packet.add_option(DhcpOption::MessageType as u8, &[MessageType::Request as u8]);
    packet.add_ip_option(DhcpOption::RequestedIpAddress as u8, Ipv4Addr::new(10, 0, 0, 20));
    packet.add_ip_option(DhcpOption::ServerIdentifier as u8, Ipv4Addr::new(10, 0, 0, 10));
    packet.add_option(DhcpOption::ParameterRequestList as u8, &[1, 3, 6, 51, 54]);
    packet.add_string_option(DhcpOption::VendorClassIdentifier as u8, "PXEClient:Arch:00000:UNDI:002001");
    packet.add_string_option(DhcpOption::UserClass as u8, "iPXE");

    assert_eq!(packet.get_message_type().unwrap(), MessageType::Request);
    assert_eq!(packet.get_requested_ip().unwrap(), Ipv4Addr::new(10, 0, 0, 20));
    assert_eq!(packet.get_server_identifier().unwrap(), Ipv4Addr::new(10, 0, 0, 10));
    assert_eq!(packet.parameter_request_list().unwrap(), &[1, 3, 6, 51, 54]);
    assert!(packet.vendor_class_identifier().unwrap().starts_with("PXEClient:"));
    assert_eq!(packet.user_class().unwrap(), "iPXE");
}

#[test]
fn test_reply_skeleton() {
    let mut request = DhcpPacket::new();
    request.xid = 0x12345678;
    request.flags = 0x8000;
    request.giaddr = Ipv4Addr::new(10, 0, 0, 254);
    request.set_mac_address([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    request.add_option(DhcpOption::MessageType as u8, &[MessageType::Discover as u8]);

    let reply = request.create_reply(MessageType::Offer);
    assert_eq!(reply.op, OpCode::BootReply);
    assert_eq!(reply.xid, request.xid);
    assert_eq!(reply.flags, request.flags);
    assert_eq!(reply.giaddr, request.giaddr);
    assert_eq!(reply.mac_string(), request.mac_string());
    assert_eq!(reply.get_message_type().unwrap(), MessageType::Offer);
}

#[test]
fn test_serialization_roundtrip_preserves_option_order() {
    let mut packet = DhcpPacket::new();
    packet.op = OpCode::BootReply;
    packet.xid = 0xDEADBEEF;
    packet.yiaddr = Ipv4Addr::new(10, 0, 0, 20);
    packet.siaddr = Ipv4Addr::new(10, 0, 0, 10);
    packet.set_mac_address([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02]);

    packet.add_option(DhcpOption::MessageType as u8, &[MessageType::Ack as u8]);
    packet.add_ip_option(DhcpOption::ServerIdentifier as u8, Ipv4Addr::new(10, 0, 0, 10));
    packet.add_u32_option(DhcpOption::IpAddressLeaseTime as u8, 86400);
    packet.add_ip_option(DhcpOption::SubnetMask as u8, Ipv4Addr::new(255, 255, 255, 0));
    packet.add_ip_option(DhcpOption::Router as u8, Ipv4Addr::new(10, 0, 0, 1));
    packet.add_string_option(DhcpOption::HostName as u8, "web-1");

    let bytes = packet.to_bytes();
    assert!(bytes.len() >= crate::packet::MIN_PACKET_SIZE);

    let parsed = DhcpPacket::from_bytes(&bytes).unwrap();
    assert_eq!(parsed.xid, packet.xid);
    assert_eq!(parsed.yiaddr, packet.yiaddr);
    assert_eq!(parsed.siaddr, packet.siaddr);
    assert_eq!(parsed.mac_string(), packet.mac_string());

    // Every option must be recovered, in the order it was emitted.
    let codes: Vec<u8> = parsed.options.iter().map(|(code, _)| *code).collect();
    assert_eq!(codes, vec![53, 54, 51, 1, 3, 12]);
    assert_eq!(
        u32::from_be_bytes(
            parsed
                .get_option(DhcpOption::IpAddressLeaseTime as u8)
                .unwrap()
                .try_into()
                .unwrap()
        ),
        86400
    );
    assert_eq!(
        String::from_utf8_lossy(parsed.get_option(DhcpOption::HostName as u8).unwrap()),
        "web-1"
    );
}

#[test]
fn test_boot_file_field() {
    let mut packet = DhcpPacket::new();
    packet.set_boot_file("undionly.kpxe");
    assert_eq!(packet.boot_file(), "undionly.kpxe");

    packet.set_boot_file("http://x/boot.ipxe");
    assert_eq!(packet.boot_file(), "http://x/boot.ipxe");

    let bytes = packet.to_bytes();
    let parsed = DhcpPacket::from_bytes(&bytes).unwrap();
    assert_eq!(parsed.boot_file(), "http://x/boot.ipxe");
}

#[test]
fn test_packet_validation() {
    let short_packet = vec![0u8; 100];
    assert!(DhcpPacket::from_bytes(&short_packet).is_err());

    let mut invalid_packet = vec![0u8; 300];
    invalid_packet[0] = 99; // Invalid op code
    assert!(DhcpPacket::from_bytes(&invalid_packet).is_err());

    let mut invalid_packet = vec![0u8; 300];
    invalid_packet[0] = 1;
    invalid_packet[1] = 99; // Unsupported hardware type
    assert!(DhcpPacket::from_bytes(&invalid_packet).is_err());
}

#[test]
fn test_options_without_magic_cookie_are_ignored() {
    let mut raw = vec![0u8; 236];
    raw[0] = 1; // BOOTREQUEST
    raw[1] = 1; // Ethernet
    raw[2] = 6;
    let parsed = DhcpPacket::from_bytes(&raw).unwrap();
    assert!(parsed.options.is_empty());
    assert!(parsed.get_message_type().is_none());
}

#[test]
fn test_truncated_option_is_dropped() {
    let mut raw = vec![0u8; 236];
    raw[0] = 1; // BOOTREQUEST
    raw[1] = 1; // Ethernet
    raw[2] = 6;
    raw.extend_from_slice(&[0x63, 0x82, 0x53, 0x63]);

    // Option claims a 50-byte payload the frame does not carry.
    raw.extend_from_slice(&[200, 50]);
    let parsed = DhcpPacket::from_bytes(&raw).unwrap();
    assert!(parsed.options.is_empty());
}

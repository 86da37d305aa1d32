//! DHCP packet parsing and construction.
//!
//! The options section is kept as a decoded, ordered list rather than a raw
//! byte blob: replies must emit options in a caller-controlled order (the
//! client's parameter request list decides part of it), and the end marker
//! plus minimum-size padding belong to serialization, not to packet state.

use std::net::Ipv4Addr;

use crate::{format_mac, DhcpOption, HardwareType, MessageType, OpCode};

const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

/// Minimum on-the-wire size of a BOOTP frame, padded to at serialization.
pub const MIN_PACKET_SIZE: usize = 300;

/// DHCP packet structure as defined in RFC 2131
#[derive(Debug, Clone)]
pub struct DhcpPacket {
    pub op: OpCode,
    pub htype: HardwareType,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr, // client IP address from client
    pub yiaddr: Ipv4Addr, // client IP address from server
    pub siaddr: Ipv4Addr, // server IP address
    pub giaddr: Ipv4Addr, // gateway IP address
    pub chaddr: [u8; 16], // client hardware address
    pub sname: [u8; 64],  // server host name
    pub file: [u8; 128],  // boot file name
    /// Decoded options in wire order, without pad or end markers.
    pub options: Vec<(u8, Vec<u8>)>,
}

impl DhcpPacket {
    pub fn new() -> Self {
        Self {
            op: OpCode::BootRequest,
            htype: HardwareType::Ethernet,
            hlen: 6,
            hops: 0,
            xid: 0,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: [0; 16],
            sname: [0; 64],
            file: [0; 128],
            options: Vec::new(),
        }
    }

    /// Parse a DHCP packet from raw bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, anyhow::Error> {
        if data.len() < 236 {
            return Err(anyhow::anyhow!("DHCP packet too short ({} bytes)", data.len()));
        }

        let op = match data[0] {
            1 => OpCode::BootRequest,
            2 => OpCode::BootReply,
            _ => return Err(anyhow::anyhow!("Invalid op code: {}", data[0])),
        };

        let htype = match data[1] {
            1 => HardwareType::Ethernet,
            _ => return Err(anyhow::anyhow!("Unsupported hardware type: {}", data[1])),
        };

        let hlen = data[2];
        let hops = data[3];
        let xid = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let secs = u16::from_be_bytes([data[8], data[9]]);
        let flags = u16::from_be_bytes([data[10], data[11]]);

        let ciaddr = Ipv4Addr::from([data[12], data[13], data[14], data[15]]);
        let yiaddr = Ipv4Addr::from([data[16], data[17], data[18], data[19]]);
        let siaddr = Ipv4Addr::from([data[20], data[21], data[22], data[23]]);
        let giaddr = Ipv4Addr::from([data[24], data[25], data[26], data[27]]);

        let mut chaddr = [0; 16];
        chaddr.copy_from_slice(&data[28..44]);

        let mut sname = [0; 64];
        sname.copy_from_slice(&data[44..108]);

        let mut file = [0; 128];
        file.copy_from_slice(&data[108..236]);

        let mut options = Vec::new();
        if data.len() >= 240 && data[236..240] == MAGIC_COOKIE {
            options = Self::parse_options(&data[240..]);
        }

        Ok(DhcpPacket {
            op,
            htype,
            hlen,
            hops,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            file,
            options,
        })
    }

    fn parse_options(data: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut options = Vec::new();
        let mut i = 0;
        while i < data.len() {
            let code = data[i];
            if code == DhcpOption::End as u8 {
                break;
            }
            if code == 0 {
                // Pad
                i += 1;
                continue;
            }
            if i + 1 >= data.len() {
                break;
            }
            let length = data[i + 1] as usize;
            if i + 2 + length > data.len() {
                break;
            }
            options.push((code, data[i + 2..i + 2 + length].to_vec()));
            i += 2 + length;
        }
        options
    }

    /// Serialize the packet, appending the end marker and padding to the
    /// minimum frame size. Options must be complete before calling this.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(MIN_PACKET_SIZE);

        packet.push(self.op as u8);
        packet.push(self.htype as u8);
        packet.push(self.hlen);
        packet.push(self.hops);
        packet.extend_from_slice(&self.xid.to_be_bytes());
        packet.extend_from_slice(&self.secs.to_be_bytes());
        packet.extend_from_slice(&self.flags.to_be_bytes());
        packet.extend_from_slice(&self.ciaddr.octets());
        packet.extend_from_slice(&self.yiaddr.octets());
        packet.extend_from_slice(&self.siaddr.octets());
        packet.extend_from_slice(&self.giaddr.octets());
        packet.extend_from_slice(&self.chaddr);
        packet.extend_from_slice(&self.sname);
        packet.extend_from_slice(&self.file);
        packet.extend_from_slice(&MAGIC_COOKIE);

        for (code, data) in &self.options {
            packet.push(*code);
            packet.push(data.len() as u8);
            packet.extend_from_slice(data);
        }
        packet.push(DhcpOption::End as u8);

        while packet.len() < MIN_PACKET_SIZE {
            packet.push(0);
        }

        packet
    }

    /// The client hardware address as a normalized MAC string.
    pub fn mac_string(&self) -> String {
        let len = (self.hlen as usize).clamp(1, 16).min(6);
        format_mac(&self.chaddr[..len])
    }

    pub fn set_mac_address(&mut self, mac: [u8; 6]) {
        self.chaddr = [0; 16];
        self.chaddr[..6].copy_from_slice(&mac);
        self.hlen = 6;
    }

    /// Get the first occurrence of an option.
    pub fn get_option(&self, option_code: u8) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|(code, _)| *code == option_code)
            .map(|(_, data)| data.as_slice())
    }

    pub fn get_message_type(&self) -> Option<MessageType> {
        self.get_option(DhcpOption::MessageType as u8)
            .and_then(|data| data.first().copied())
            .and_then(|value| MessageType::try_from(value).ok())
    }

    pub fn get_requested_ip(&self) -> Option<Ipv4Addr> {
        self.get_ip_option(DhcpOption::RequestedIpAddress as u8)
    }

    pub fn get_server_identifier(&self) -> Option<Ipv4Addr> {
        self.get_ip_option(DhcpOption::ServerIdentifier as u8)
    }

    fn get_ip_option(&self, code: u8) -> Option<Ipv4Addr> {
        self.get_option(code).and_then(|data| {
            let octets: [u8; 4] = data.try_into().ok()?;
            Some(Ipv4Addr::from(octets))
        })
    }

    /// The client's parameter request list (option 55), in client order.
    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        self.get_option(DhcpOption::ParameterRequestList as u8)
    }

    /// The vendor class identifier (option 60) as text.
    pub fn vendor_class_identifier(&self) -> Option<String> {
        self.get_option(DhcpOption::VendorClassIdentifier as u8)
            .map(|data| String::from_utf8_lossy(data).into_owned())
    }

    /// The user class (option 77) as text.
    pub fn user_class(&self) -> Option<String> {
        self.get_option(DhcpOption::UserClass as u8)
            .map(|data| String::from_utf8_lossy(data).into_owned())
    }

    pub fn add_option(&mut self, code: u8, data: &[u8]) {
        self.options.push((code, data.to_vec()));
    }

    pub fn add_u32_option(&mut self, code: u8, value: u32) {
        self.add_option(code, &value.to_be_bytes());
    }

    pub fn add_ip_option(&mut self, code: u8, ip: Ipv4Addr) {
        self.add_option(code, &ip.octets());
    }

    pub fn add_string_option(&mut self, code: u8, value: &str) {
        self.add_option(code, value.as_bytes());
    }

    /// Set the legacy BOOTP boot file field (truncated to 128 bytes).
    pub fn set_boot_file(&mut self, path: &str) {
        self.file = [0; 128];
        let bytes = path.as_bytes();
        let len = bytes.len().min(128);
        self.file[..len].copy_from_slice(&bytes[..len]);
    }

    /// The BOOTP boot file field as text, up to the first NUL.
    pub fn boot_file(&self) -> String {
        let end = self.file.iter().position(|&b| b == 0).unwrap_or(self.file.len());
        String::from_utf8_lossy(&self.file[..end]).into_owned()
    }

    /// Create a BOOTREPLY skeleton for this request: transaction id, flags,
    /// gateway and client hardware address copied over, message type set.
    pub fn create_reply(&self, message_type: MessageType) -> DhcpPacket {
        let mut reply = DhcpPacket::new();
        reply.op = OpCode::BootReply;
        reply.htype = self.htype;
        reply.hlen = self.hlen;
        reply.xid = self.xid;
        reply.flags = self.flags;
        reply.giaddr = self.giaddr;
        reply.chaddr = self.chaddr;

        reply.add_option(DhcpOption::MessageType as u8, &[message_type as u8]);

        reply
    }
}

impl Default for DhcpPacket {
    fn default() -> Self {
        Self::new()
    }
}

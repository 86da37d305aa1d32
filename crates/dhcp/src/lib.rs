//! DHCPv4 wire protocol support.
//!
//! Implements the BOOTP/DHCP frame layout and option encoding from RFC 2131
//! and RFC 2132, plus the small set of accessors the server needs (message
//! type, parameter request list, vendor/user class).

pub mod packet;

#[cfg(test)]
mod tests;

pub use packet::DhcpPacket;

/// DHCP message types as defined in RFC 2131
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Discover),
            2 => Ok(MessageType::Offer),
            3 => Ok(MessageType::Request),
            4 => Ok(MessageType::Decline),
            5 => Ok(MessageType::Ack),
            6 => Ok(MessageType::Nak),
            7 => Ok(MessageType::Release),
            8 => Ok(MessageType::Inform),
            _ => Err(anyhow::anyhow!("Unknown DHCP message type: {}", value)),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::Discover => "Discover",
            MessageType::Offer => "Offer",
            MessageType::Request => "Request",
            MessageType::Decline => "Decline",
            MessageType::Ack => "ACK",
            MessageType::Nak => "NAK",
            MessageType::Release => "Release",
            MessageType::Inform => "Inform",
        };
        f.write_str(name)
    }
}

/// DHCP options as defined in RFC 2132
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask = 1,
    Router = 3,
    DomainNameServer = 6,
    HostName = 12,
    DomainName = 15,
    BroadcastAddress = 28,
    RequestedIpAddress = 50,
    IpAddressLeaseTime = 51,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    VendorClassIdentifier = 60,
    ClientIdentifier = 61,
    TftpServerName = 66,
    BootfileName = 67,
    UserClass = 77,

    End = 255,
}

/// Hardware address types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareType {
    Ethernet = 1,
}

/// DHCP packet operation codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    BootRequest = 1,
    BootReply = 2,
}

/// Normalize a MAC address to the canonical lowercase, colon-separated form
/// used as the lookup key everywhere in the server.
pub fn normalize_mac(mac: &str) -> String {
    mac.trim().to_ascii_lowercase()
}

/// Format raw hardware address bytes as a normalized MAC string.
pub fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

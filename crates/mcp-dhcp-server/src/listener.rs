//! Interface-scoped DHCP packet listener.
//!
//! DHCP replies to clients without an address must go out as broadcast on
//! the right L2 segment, so the socket binds `0.0.0.0:67` and interface
//! scoping happens in userspace: `IP_PKTINFO` attributes each read to its
//! ingress interface, and reads from any other interface are reported as
//! empty. Writes hand the same interface index back to the kernel so the
//! reply leaves on the correct interface.

use std::io::{self, IoSlice, IoSliceMut};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use dhcp::{DhcpPacket, OpCode};
use nix::sys::socket::{
    recvmsg, sendmsg, setsockopt, sockopt, ControlMessage, ControlMessageOwned, MsgFlags, SockaddrIn,
};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::service::Service;

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;

/// Frames shorter than the BOOTP header cannot be DHCP.
const MIN_DHCP_FRAME: usize = 240;

/// Decides whether a datagram is accepted based on its ingress interface.
#[derive(Debug, Clone, Copy)]
pub struct InterfaceFilter {
    target_index: u32,
}

impl InterfaceFilter {
    pub fn new(target_index: u32) -> Self {
        Self { target_index }
    }

    /// The effective read size: a read from another interface is reported
    /// as empty, exactly as if nothing had arrived. A read without
    /// interface attribution passes (the control message is always present
    /// once `IP_PKTINFO` is enabled).
    pub fn filter(&self, bytes_read: usize, ingress_index: Option<u32>) -> usize {
        match ingress_index {
            Some(index) if index != self.target_index => 0,
            _ => bytes_read,
        }
    }
}

pub struct DhcpListener {
    fd: AsyncFd<Socket>,
    filter: InterfaceFilter,
    interface_index: u32,
    running: AtomicBool,
    shutdown: Notify,
}

impl DhcpListener {
    /// Bind the DHCP server socket on `0.0.0.0:67`, scoped to the given
    /// interface index.
    pub fn bind(interface_index: u32) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("failed to create DHCP socket")?;
        socket
            .set_broadcast(true)
            .context("failed to enable broadcast on DHCP socket")?;
        socket
            .set_reuse_address(true)
            .context("failed to set SO_REUSEADDR on DHCP socket")?;
        #[cfg(any(target_os = "macos", target_os = "linux"))]
        if let Err(err) = socket.set_reuse_port(true) {
            warn!("Failed to set SO_REUSEPORT on DHCP socket: {}", err);
        }
        socket
            .set_nonblocking(true)
            .context("failed to set DHCP socket to non-blocking mode")?;

        // Ingress interface attribution needs IP_PKTINFO.
        setsockopt(&socket, sockopt::Ipv4PacketInfo, &true)
            .context("failed to enable IP_PKTINFO on DHCP socket")?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT);
        socket
            .bind(&std::net::SocketAddr::V4(bind_addr).into())
            .with_context(|| format!("failed to bind DHCP server to {}", bind_addr))?;

        let fd = AsyncFd::new(socket).context("failed to register DHCP socket with the runtime")?;

        Ok(Self {
            fd,
            filter: InterfaceFilter::new(interface_index),
            interface_index,
            running: AtomicBool::new(true),
            shutdown: Notify::new(),
        })
    }

    /// Stop the read loop. Socket errors observed afterwards are swallowed.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Drain the socket, dispatching each accepted request to the service
    /// and writing the reply back out. Runs until `shutdown`.
    pub async fn run(&self, service: Arc<Service>, errors: UnboundedSender<anyhow::Error>) {
        let mut buf = vec![0u8; 1500];

        loop {
            let received = tokio::select! {
                _ = self.shutdown.notified() => return,
                result = self.recv(&mut buf) => result,
            };

            let (len, source) = match received {
                Ok(read) => read,
                Err(err) => {
                    if !self.is_running() {
                        return;
                    }
                    let _ = errors.send(anyhow::Error::new(err).context("DHCP socket read failed"));
                    continue;
                }
            };

            // Zero-length reads are frames the interface filter discarded.
            if len < MIN_DHCP_FRAME {
                continue;
            }

            let request = match DhcpPacket::from_bytes(&buf[..len]) {
                Ok(packet) => packet,
                Err(err) => {
                    debug!("Ignoring malformed DHCP packet: {}", err);
                    continue;
                }
            };
            if request.op != OpCode::BootRequest {
                continue;
            }
            let msg_type = match request.get_message_type() {
                Some(msg_type) => msg_type,
                None => {
                    debug!("Ignoring DHCP packet without a message type option");
                    continue;
                }
            };

            let reply = match service.serve_dhcp(&request, msg_type).await {
                Some(reply) => reply,
                None => continue,
            };

            let destination = reply_destination(&request, source);
            if let Err(err) = self.send(&reply.to_bytes(), destination).await {
                if self.is_running() {
                    let _ = errors.send(
                        anyhow::Error::new(err).context(format!("failed to send DHCP reply to {}", destination)),
                    );
                }
            }
        }
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddrV4>)> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| recv_with_pktinfo(inner.get_ref(), buf, &self.filter)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn send(&self, data: &[u8], destination: SocketAddrV4) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| send_with_pktinfo(inner.get_ref(), data, destination, self.interface_index)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

fn recv_with_pktinfo(
    socket: &Socket,
    buf: &mut [u8],
    filter: &InterfaceFilter,
) -> io::Result<(usize, Option<SocketAddrV4>)> {
    let mut cmsg_buf = nix::cmsg_space!(libc::in_pktinfo);
    let mut iov = [IoSliceMut::new(buf)];

    let msg = recvmsg::<SockaddrIn>(socket.as_raw_fd(), &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())?;

    let mut ingress_index = None;
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::Ipv4PacketInfo(info) = cmsg {
            ingress_index = Some(info.ipi_ifindex as u32);
        }
    }

    let source = msg.address.map(std::net::SocketAddrV4::from);
    let accepted = filter.filter(msg.bytes, ingress_index);

    Ok((accepted, source))
}

fn send_with_pktinfo(socket: &Socket, data: &[u8], destination: SocketAddrV4, interface_index: u32) -> io::Result<usize> {
    let iov = [IoSlice::new(data)];

    // Hand the ingress interface back to the kernel for egress. The source
    // address stays unset: some platforms populate it on read, and echoing
    // it back makes the write fail with EINVAL.
    let pktinfo = libc::in_pktinfo {
        ipi_ifindex: interface_index as i32,
        ipi_spec_dst: libc::in_addr { s_addr: 0 },
        ipi_addr: libc::in_addr { s_addr: 0 },
    };
    let cmsgs = [ControlMessage::Ipv4PacketInfo(&pktinfo)];
    let addr = SockaddrIn::from(destination);

    let sent = sendmsg(socket.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), Some(&addr))?;
    Ok(sent)
}

/// Where a reply goes (RFC 2131 §4.1, without relay support): unicast to the
/// source when it has an address and did not ask for broadcast, otherwise
/// broadcast to the client port.
pub fn reply_destination(request: &DhcpPacket, source: Option<SocketAddrV4>) -> SocketAddrV4 {
    let wants_broadcast = request.flags & 0x8000 != 0;
    match source {
        Some(addr) if !addr.ip().is_unspecified() && !wants_broadcast => {
            SocketAddrV4::new(*addr.ip(), DHCP_CLIENT_PORT)
        }
        _ => SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT),
    }
}

/// First IPv4 address assigned to the named interface.
pub fn interface_ipv4(name: &str) -> io::Result<Ipv4Addr> {
    nix::ifaddrs::getifaddrs()?
        .find_map(|ifa| {
            if ifa.interface_name != name {
                return None;
            }
            ifa.address.and_then(|addr| addr.as_sockaddr_in().map(|sin| sin.ip()))
        })
        .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
}

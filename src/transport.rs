// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Packet I/O for the daemon loop.
//!
//! `PacketTransport` is the seam between the state machine and the
//! network: the daemon drives whatever implements it, so tests swap in
//! an in-memory channel pair while production uses `RawIgmpTransport`.
//!
//! The raw transport needs CAP_NET_RAW. Receive side is a raw
//! IPPROTO_IGMP socket bound to the interface; the kernel hands us the
//! full IP packet, we strip the header. Send side is IPPROTO_RAW with
//! IP_HDRINCL, crafting the IPv4 header ourselves so the TTL and TOS of
//! emitted queries are exactly what the config asks for.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::AsRawFd;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::packet::internet_checksum;

const IPV4_HEADER_LEN: usize = 20;
/// TOS CS6, conventional for routing control traffic
const TOS_INTERNETWORK_CONTROL: u8 = 0xC0;

/// How the daemon loop talks to the network.
pub trait PacketTransport: Send {
    /// Send one IGMP payload to `dst` on this transport's interface.
    fn send(&mut self, dst: Ipv4Addr, payload: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Receive one IGMP payload; yields the IP source and the bytes
    /// after the IP header.
    fn recv(&mut self) -> impl Future<Output = Result<(Ipv4Addr, Vec<u8>)>> + Send;
}

/// Raw-socket transport bound to one interface.
pub struct RawIgmpTransport {
    recv_socket: AsyncFd<Socket>,
    send_socket: AsyncFd<Socket>,
    our_addr: Ipv4Addr,
    ttl: u8,
}

impl RawIgmpTransport {
    pub fn open(interface: &str, our_addr: Ipv4Addr, ttl: u8) -> Result<Self> {
        let recv_socket = Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(Protocol::from(libc::IPPROTO_IGMP)),
        )
        .context("failed to create raw IGMP receive socket")?;
        recv_socket
            .bind_device(Some(interface.as_bytes()))
            .with_context(|| format!("failed to bind receive socket to {interface}"))?;
        recv_socket.set_nonblocking(true)?;

        let send_socket = Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(Protocol::from(libc::IPPROTO_RAW)),
        )
        .context("failed to create raw send socket")?;
        set_ip_hdrincl(&send_socket)?;
        send_socket
            .bind_device(Some(interface.as_bytes()))
            .with_context(|| format!("failed to bind send socket to {interface}"))?;
        // Our own queries come back via the receive socket on the wire;
        // no need to hear the looped-back copy as well
        send_socket.set_multicast_loop_v4(false)?;
        send_socket.set_nonblocking(true)?;

        Ok(Self {
            recv_socket: AsyncFd::with_interest(recv_socket, Interest::READABLE)
                .context("failed to register receive socket")?,
            send_socket: AsyncFd::with_interest(send_socket, Interest::WRITABLE)
                .context("failed to register send socket")?,
            our_addr,
            ttl,
        })
    }

    fn build_packet(&self, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
        let total_len = IPV4_HEADER_LEN + payload.len();
        let mut packet = Vec::with_capacity(total_len);
        packet.push(0x45); // version 4, IHL 5
        packet.push(TOS_INTERNETWORK_CONTROL);
        packet.extend_from_slice(&(total_len as u16).to_be_bytes());
        packet.extend_from_slice(&[0, 0]); // identification
        packet.extend_from_slice(&[0, 0]); // flags, fragment offset
        packet.push(self.ttl);
        packet.push(libc::IPPROTO_IGMP as u8);
        packet.extend_from_slice(&[0, 0]); // checksum, filled below
        packet.extend_from_slice(&self.our_addr.octets());
        packet.extend_from_slice(&dst.octets());
        let checksum = internet_checksum(&packet);
        packet[10..12].copy_from_slice(&checksum.to_be_bytes());
        packet.extend_from_slice(payload);
        packet
    }
}

impl PacketTransport for RawIgmpTransport {
    async fn send(&mut self, dst: Ipv4Addr, payload: &[u8]) -> Result<()> {
        let packet = self.build_packet(dst, payload);
        let addr = SockAddr::from(SocketAddrV4::new(dst, 0));
        loop {
            let mut guard = self.send_socket.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send_to(&packet, &addr)) {
                Ok(result) => {
                    result.with_context(|| format!("failed to send IGMP packet to {dst}"))?;
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv(&mut self) -> Result<(Ipv4Addr, Vec<u8>)> {
        let mut buf = [std::mem::MaybeUninit::<u8>::uninit(); 2048];
        loop {
            let mut guard = self.recv_socket.readable().await?;
            let received = match guard.try_io(|inner| inner.get_ref().recv(&mut buf)) {
                Ok(result) => result.context("failed to receive on raw IGMP socket")?,
                Err(_would_block) => continue,
            };
            // Safety: the kernel initialized the first `received` bytes
            let data: &[u8] = unsafe {
                std::slice::from_raw_parts(buf.as_ptr() as *const u8, received)
            };
            if let Some(parsed) = strip_ipv4_header(data) {
                return Ok(parsed);
            }
            // Runt or non-IGMP packet; keep waiting
        }
    }
}

/// Split a raw IPv4 datagram into (source address, payload after the
/// header). Returns `None` for runts or non-IGMP protocols.
fn strip_ipv4_header(data: &[u8]) -> Option<(Ipv4Addr, Vec<u8>)> {
    if data.len() < IPV4_HEADER_LEN {
        return None;
    }
    if data[0] >> 4 != 4 {
        return None;
    }
    let header_len = ((data[0] & 0x0F) as usize) * 4;
    if header_len < IPV4_HEADER_LEN || data.len() < header_len {
        return None;
    }
    if data[9] != libc::IPPROTO_IGMP as u8 {
        return None;
    }
    let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    Some((src, data[header_len..].to_vec()))
}

/// Set IP_HDRINCL so the kernel sends our IPv4 header verbatim
fn set_ip_hdrincl(socket: &Socket) -> Result<()> {
    let enabled: libc::c_int = 1;
    let result = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_HDRINCL,
            &enabled as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if result < 0 {
        return Err(anyhow::anyhow!(
            "failed to set IP_HDRINCL: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

/// First IPv4 address configured on the named interface.
pub fn interface_ipv4_address(interface: &str) -> Result<Ipv4Addr> {
    let addrs = nix::ifaddrs::getifaddrs().context("failed to enumerate interface addresses")?;
    for ifaddr in addrs {
        if ifaddr.interface_name != interface {
            continue;
        }
        if let Some(addr) = ifaddr.address {
            if let Some(sin) = addr.as_sockaddr_in() {
                return Ok(sin.ip());
            }
        }
    }
    Err(anyhow::anyhow!(
        "interface {} has no IPv4 address",
        interface
    ))
}

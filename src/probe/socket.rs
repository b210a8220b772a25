use anyhow::{Result, anyhow};
use socket2::{Domain, Protocol as SockProtocol, SockAddr, Socket, Type};
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Read timeout on the receive socket; the receiver polls at this cadence so
/// it can observe cancellation and run the pending-table sweep
pub const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Socket with metadata about type (for DGRAM-aware parsing)
#[derive(Debug)]
pub struct SocketInfo {
    pub socket: Socket,
    /// True if SOCK_DGRAM (no IP header in received IPv4 packets)
    pub is_dgram: bool,
}

fn create_raw_icmp_socket(ipv6: bool) -> Result<Socket> {
    let (domain, proto) = if ipv6 {
        (Domain::IPV6, SockProtocol::ICMPV6)
    } else {
        (Domain::IPV4, SockProtocol::ICMPV4)
    };
    let socket = Socket::new(domain, Type::RAW, Some(proto))?;
    socket.set_nonblocking(false)?;
    Ok(socket)
}

fn create_dgram_icmp_socket(ipv6: bool) -> Result<Socket> {
    let (domain, proto) = if ipv6 {
        (Domain::IPV6, SockProtocol::ICMPV6)
    } else {
        (Domain::IPV4, SockProtocol::ICMPV4)
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(proto))?;
    socket.set_nonblocking(false)?;
    Ok(socket)
}

/// Create a socket for sending ICMP probes with per-probe TTL.
/// Prefers RAW, falls back to DGRAM for unprivileged use (ping_group_range).
pub fn create_icmp_send_socket(ipv6: bool) -> Result<SocketInfo> {
    if let Ok(socket) = create_raw_icmp_socket(ipv6) {
        return Ok(SocketInfo {
            socket,
            is_dgram: false,
        });
    }
    let socket = create_dgram_icmp_socket(ipv6)?;
    Ok(SocketInfo {
        socket,
        is_dgram: true,
    })
}

/// Create a socket for receiving ICMP responses.
/// Prefers RAW (sees Time Exceeded for all probe protocols), falls back to
/// DGRAM which on Linux still delivers errors related to its own echoes.
pub fn create_icmp_recv_socket(ipv6: bool) -> Result<SocketInfo> {
    let info = match create_raw_icmp_socket(ipv6) {
        Ok(socket) => SocketInfo {
            socket,
            is_dgram: false,
        },
        Err(_) => SocketInfo {
            socket: create_dgram_icmp_socket(ipv6)?,
            is_dgram: true,
        },
    };
    let _ = info.socket.set_recv_buffer_size(1024 * 1024);
    info.socket.set_read_timeout(Some(RECV_POLL_TIMEOUT))?;
    Ok(info)
}

/// Create a DGRAM UDP socket for sending probes
pub fn create_udp_send_socket(ipv6: bool) -> Result<Socket> {
    let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(SockProtocol::UDP))?;
    socket.set_nonblocking(false)?;
    Ok(socket)
}

/// Create a raw TCP socket for sending SYN probes (requires CAP_NET_RAW)
pub fn create_tcp_send_socket(ipv6: bool) -> Result<Socket> {
    let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::RAW, Some(SockProtocol::TCP))?;
    socket.set_nonblocking(false)?;
    Ok(socket)
}

/// Set the hop limit for outbound probes (IP_TTL / IPV6_UNICAST_HOPS)
pub fn set_hops(socket: &Socket, ttl: u8, ipv6: bool) -> Result<()> {
    if ipv6 {
        socket.set_unicast_hops_v6(ttl as u32)?;
    } else {
        socket.set_ttl(ttl as u32)?;
    }
    Ok(())
}

/// Send a probe packet to target. Port 0 for ICMP.
pub fn send_probe(socket: &Socket, packet: &[u8], target: IpAddr, port: u16) -> Result<usize> {
    let addr = SocketAddr::new(target, port);
    let sent = socket.send_to(packet, &SockAddr::from(addr))?;
    Ok(sent)
}

/// Receive one packet, returning its length and source address.
/// Errors with WouldBlock/TimedOut when the poll timeout elapses.
pub fn recv_reply(socket: &Socket, buffer: &mut [MaybeUninit<u8>]) -> Result<(usize, IpAddr)> {
    let (len, addr) = socket.recv_from(buffer)?;
    let source = addr
        .as_socket()
        .map(|s| s.ip())
        .ok_or_else(|| anyhow!("received packet with non-IP source address"))?;
    Ok((len, source))
}

/// View the initialized prefix of a receive buffer after recv_reply
pub fn filled(buffer: &[MaybeUninit<u8>], len: usize) -> &[u8] {
    // recv_from initialized the first `len` bytes
    unsafe { std::slice::from_raw_parts(buffer.as_ptr().cast::<u8>(), len) }
}

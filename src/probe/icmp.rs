use pnet::packet::MutablePacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpType, IcmpTypes, checksum};

/// ICMP header size (fixed)
pub const ICMP_HEADER_SIZE: usize = 8;
/// Echo request payload size (standard ping)
pub const ECHO_PAYLOAD_SIZE: usize = 56;

/// ICMPv6 Echo Request type
const ICMPV6_ECHO_REQUEST: u8 = 128;

/// Build an ICMP Echo Request packet.
///
/// The identifier carries the per-run id and the sequence field carries the
/// packed ProbeId; both come back verbatim in the Echo Reply and inside the
/// quoted datagram of Time Exceeded errors, which is how replies are
/// correlated. Set ipv6=true to build an ICMPv6 Echo Request; its checksum
/// is left to the kernel (it covers the IPv6 pseudo-header).
pub fn build_echo_request(identifier: u16, sequence: u16, ipv6: bool) -> Vec<u8> {
    let mut buffer = vec![0u8; ICMP_HEADER_SIZE + ECHO_PAYLOAD_SIZE];

    let mut packet = MutableEchoRequestPacket::new(&mut buffer).unwrap();

    if ipv6 {
        packet.set_icmp_type(IcmpType::new(ICMPV6_ECHO_REQUEST));
    } else {
        packet.set_icmp_type(IcmpTypes::EchoRequest);
    }
    packet.set_icmp_code(IcmpCode::new(0));
    packet.set_identifier(identifier);
    packet.set_sequence_number(sequence);

    // Pattern-fill the payload
    for (i, byte) in packet.payload_mut().iter_mut().enumerate() {
        *byte = (i & 0xFF) as u8;
    }

    if !ipv6 {
        let cksum = checksum(&pnet::packet::icmp::IcmpPacket::new(&buffer).unwrap());
        let mut packet = MutableEchoRequestPacket::new(&mut buffer).unwrap();
        packet.set_checksum(cksum);
    }

    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_echo_request() {
        let packet = build_echo_request(1234, 5678, false);
        assert_eq!(packet.len(), ICMP_HEADER_SIZE + ECHO_PAYLOAD_SIZE);
        assert_eq!(packet[0], 8); // Echo Request type
        assert_eq!(packet[1], 0); // Code
        assert_eq!(u16::from_be_bytes([packet[4], packet[5]]), 1234);
        assert_eq!(u16::from_be_bytes([packet[6], packet[7]]), 5678);
    }

    #[test]
    fn test_build_echo_request_ipv6() {
        let packet = build_echo_request(1234, 5678, true);
        assert_eq!(packet[0], 128); // ICMPv6 Echo Request type
        assert_eq!(packet[1], 0); // Code
        // Checksum left zero for the kernel
        assert_eq!(u16::from_be_bytes([packet[2], packet[3]]), 0);
    }

    #[test]
    fn test_echo_request_checksum_set_for_ipv4() {
        let packet = build_echo_request(1, 1, false);
        let cksum = u16::from_be_bytes([packet[2], packet[3]]);
        assert_ne!(cksum, 0);
    }
}

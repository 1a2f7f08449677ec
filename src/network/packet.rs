//! Reads just enough of an IP packet's header to route it. Grounded in the
//! original's `pkg/network/tools.go`.

use std::net::IpAddr;

use ipnet::IpNet;

const IPV4_OFFSET_SRC: usize = 12;
const IPV4_OFFSET_DST: usize = IPV4_OFFSET_SRC + 4;
const IPV6_OFFSET_SRC: usize = 8;
const IPV6_OFFSET_DST: usize = IPV6_OFFSET_SRC + 16;
const IPV6_FIXED_HEADER_LEN: usize = 40;

/// Returns the IP version (4 or 6, 0 if neither) and the source/destination
/// addresses, if the packet is long enough to contain them.
pub fn parse_packet(data: &[u8]) -> (u8, Option<IpAddr>, Option<IpAddr>) {
    if data.is_empty() {
        return (0, None, None);
    }
    let version = data[0] >> 4;
    match version {
        4 if data.len() >= IPV4_OFFSET_DST + 4 => {
            let src = [data[IPV4_OFFSET_SRC], data[IPV4_OFFSET_SRC + 1], data[IPV4_OFFSET_SRC + 2], data[IPV4_OFFSET_SRC + 3]];
            let dst = [data[IPV4_OFFSET_DST], data[IPV4_OFFSET_DST + 1], data[IPV4_OFFSET_DST + 2], data[IPV4_OFFSET_DST + 3]];
            (4, Some(IpAddr::from(src)), Some(IpAddr::from(dst)))
        }
        6 if data.len() >= IPV6_OFFSET_DST + 16 => {
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&data[IPV6_OFFSET_SRC..IPV6_OFFSET_SRC + 16]);
            dst.copy_from_slice(&data[IPV6_OFFSET_DST..IPV6_OFFSET_DST + 16]);
            (6, Some(IpAddr::from(src)), Some(IpAddr::from(dst)))
        }
        _ => (0, None, None),
    }
}

/// Returns the transport protocol number and the payload slice, skipping
/// any IPv6 extension headers.
pub fn packet_get_payload(data: &[u8]) -> (u8, &[u8]) {
    if data.is_empty() {
        return (0, &[]);
    }
    let version = data[0] >> 4;
    if version == 4 {
        let header_len = ((data[0] & 0xF) << 2) as usize;
        let protocol = data.get(9).copied().unwrap_or(0);
        (protocol, data.get(header_len..).unwrap_or(&[]))
    } else if version == 6 && data.len() >= IPV6_FIXED_HEADER_LEN {
        let next_header = data[6];
        let (offset, next_header) = skip_ipv6_extension_headers(&data[IPV6_FIXED_HEADER_LEN..], next_header);
        (next_header, data.get(IPV6_FIXED_HEADER_LEN + offset..).unwrap_or(&[]))
    } else {
        (0, &[])
    }
}

/// Extension header types: Hop-by-Hop (0), Routing (43), Fragment (44),
/// AH (51), ESP (50), Destination (60), Encapsulated IPv6 (41).
fn skip_ipv6_extension_headers(mix_payload: &[u8], mut next_header: u8) -> (usize, u8) {
    let mut offset = 0usize;
    loop {
        match next_header {
            0 | 41 | 43 | 44 | 50 | 51 | 60 => {
                if offset + 1 >= mix_payload.len() {
                    return (offset, next_header);
                }
                next_header = mix_payload[offset];
                let header_len = (mix_payload[offset + 1] as usize + 1) * 8;
                offset += header_len;
            }
            _ => return (offset, next_header),
        }
    }
}

pub fn is_broadcast(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => ip.is_multicast() || v4 == std::net::Ipv4Addr::BROADCAST || v4.octets()[3] == 255,
        IpAddr::V6(_) => ip.is_multicast(),
    }
}

/// Parses a list of CIDR strings into `(host address, network)` pairs.
pub fn parse_ip_nets(cidrs: &[String]) -> crate::error::Result<Vec<IpNet>> {
    cidrs
        .iter()
        .map(|c| c.parse().map_err(|e| crate::error::PtunError::InvalidAddress(format!("{c}: {e}"))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_src_and_dst() {
        let mut pkt = vec![0x45u8, 0, 0, 28, 0, 0, 0, 0, 64, 17, 0, 0];
        pkt.extend_from_slice(&[10, 0, 0, 1]);
        pkt.extend_from_slice(&[10, 0, 0, 2]);
        let (version, src, dst) = parse_packet(&pkt);
        assert_eq!(version, 4);
        assert_eq!(src, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(dst, Some("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn broadcast_detection_matches_last_octet_255() {
        assert!(is_broadcast("10.0.0.255".parse().unwrap()));
        assert!(!is_broadcast("10.0.0.2".parse().unwrap()));
        assert!(is_broadcast("224.0.0.1".parse().unwrap()));
    }

    #[test]
    fn skips_a_hop_by_hop_extension_header() {
        let mut pkt = vec![0u8; IPV6_FIXED_HEADER_LEN];
        pkt[0] = 0x60;
        pkt[6] = 0; // Hop-by-Hop
        pkt.extend_from_slice(&[17, 0, 0, 0, 0, 0, 0, 0]); // next=UDP, len=1*8
        pkt.extend_from_slice(b"udp-payload");
        let (protocol, payload) = packet_get_payload(&pkt);
        assert_eq!(protocol, 17);
        assert_eq!(payload, b"udp-payload");
    }
}

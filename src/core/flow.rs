//! Flow classification and lane routing
//!
//! Every packet is reduced to a `FlowKey`: a hash over a normalized endpoint
//! pair, so both directions of a conversation land on the same key. Which
//! pair is used depends on the configured `SplitBy` criterion. Packets that
//! lack the required layer get no key and are dropped before routing.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::str::FromStr;

use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use pcap_file::DataLink;
use serde::{Deserialize, Serialize};

use crate::error::{FlowSplitError, Result};

/// Which endpoint pair the flow key is derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitBy {
    /// Network-layer addresses
    #[default]
    Ip,
    /// Transport-layer ports (TCP/UDP)
    Port,
}

impl SplitBy {
    pub fn name(&self) -> &'static str {
        match self {
            SplitBy::Ip => "ip",
            SplitBy::Port => "port",
        }
    }
}

impl fmt::Display for SplitBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SplitBy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ip" => Ok(SplitBy::Ip),
            "port" => Ok(SplitBy::Port),
            other => Err(format!("unknown split criterion {:?} (expected ip or port)", other)),
        }
    }
}

/// Hash of a normalized two-endpoint tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey(pub u64);

impl FlowKey {
    /// Build a key from two endpoints; order does not matter
    pub fn from_endpoints<T: Hash + Ord>(a: T, b: T) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let mut hasher = DefaultHasher::new();
        lo.hash(&mut hasher);
        hi.hash(&mut hasher);
        FlowKey(hasher.finish())
    }
}

/// Slice a frame according to its link type; `None` for link types we do not
/// decode and for frames etherparse rejects
pub(crate) fn slice_frame(datalink: DataLink, data: &[u8]) -> Option<SlicedPacket<'_>> {
    match datalink {
        DataLink::ETHERNET => SlicedPacket::from_ethernet(data).ok(),
        DataLink::RAW | DataLink::IPV4 | DataLink::IPV6 => SlicedPacket::from_ip(data).ok(),
        _ => None,
    }
}

/// Derive the flow key for a raw frame, or `None` if the frame has no layer
/// matching `split` (or cannot be sliced at all).
pub fn classify(datalink: DataLink, data: &[u8], split: SplitBy) -> Option<FlowKey> {
    let sliced = slice_frame(datalink, data)?;

    match split {
        SplitBy::Ip => {
            let (src, dst) = match &sliced.net {
                Some(NetSlice::Ipv4(ipv4)) => {
                    let header = ipv4.header();
                    (
                        IpAddr::V4(header.source_addr()),
                        IpAddr::V4(header.destination_addr()),
                    )
                }
                Some(NetSlice::Ipv6(ipv6)) => {
                    let header = ipv6.header();
                    (
                        IpAddr::V6(header.source_addr()),
                        IpAddr::V6(header.destination_addr()),
                    )
                }
                // ARP and other non-IP payloads
                _ => return None,
            };
            Some(FlowKey::from_endpoints(src, dst))
        }
        SplitBy::Port => {
            let (src, dst) = match &sliced.transport {
                Some(TransportSlice::Tcp(tcp)) => (tcp.source_port(), tcp.destination_port()),
                Some(TransportSlice::Udp(udp)) => (udp.source_port(), udp.destination_port()),
                _ => return None,
            };
            Some(FlowKey::from_endpoints(src, dst))
        }
    }
}

/// Maps flow keys onto a fixed number of lanes
#[derive(Debug, Clone, Copy)]
pub struct FlowRouter {
    lanes: usize,
}

impl FlowRouter {
    pub fn new(lanes: usize) -> Result<Self> {
        if lanes == 0 {
            return Err(FlowSplitError::ZeroLanes);
        }
        Ok(Self { lanes })
    }

    pub fn lanes(&self) -> usize {
        self.lanes
    }

    /// Lane index for a key; stable for the lifetime of the process
    pub fn route(&self, key: FlowKey) -> usize {
        (key.0 % self.lanes as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    fn tcp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1])
            .ipv4(src, dst, 64)
            .tcp(sport, dport, 1, 1024);
        let payload = b"hello";
        let mut out = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut out, payload).unwrap();
        out
    }

    fn arp_frame() -> Vec<u8> {
        let mut out = vec![0xff; 6];
        out.extend_from_slice(&[0x02, 0, 0, 0, 0, 1]);
        out.extend_from_slice(&[0x08, 0x06]);
        // htype, ptype, hlen, plen, oper
        out.extend_from_slice(&[0, 1, 0x08, 0, 6, 4, 0, 1]);
        out.extend_from_slice(&[0x02, 0, 0, 0, 0, 1, 10, 0, 0, 1]);
        out.extend_from_slice(&[0, 0, 0, 0, 0, 0, 10, 0, 0, 2]);
        out
    }

    #[test]
    fn test_split_by_parse() {
        assert_eq!("ip".parse::<SplitBy>().unwrap(), SplitBy::Ip);
        assert_eq!("PORT".parse::<SplitBy>().unwrap(), SplitBy::Port);
        assert!("mac".parse::<SplitBy>().is_err());
        assert_eq!(SplitBy::Port.to_string(), "port");
    }

    #[test]
    fn test_flow_key_is_direction_agnostic() {
        let fwd = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 40000, 443);
        let rev = tcp_frame([10, 0, 0, 2], [10, 0, 0, 1], 443, 40000);

        for split in [SplitBy::Ip, SplitBy::Port] {
            let a = classify(DataLink::ETHERNET, &fwd, split).unwrap();
            let b = classify(DataLink::ETHERNET, &rev, split).unwrap();
            assert_eq!(a, b, "split={}", split);
        }
    }

    #[test]
    fn test_arp_is_dropped_for_both_criteria() {
        let arp = arp_frame();
        assert!(classify(DataLink::ETHERNET, &arp, SplitBy::Ip).is_none());
        assert!(classify(DataLink::ETHERNET, &arp, SplitBy::Port).is_none());
    }

    #[test]
    fn test_icmp_has_no_transport_key() {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .icmpv4_echo_request(1, 1);
        let mut frame = Vec::new();
        builder.write(&mut frame, &[0u8; 8]).unwrap();

        assert!(classify(DataLink::ETHERNET, &frame, SplitBy::Ip).is_some());
        assert!(classify(DataLink::ETHERNET, &frame, SplitBy::Port).is_none());
    }

    #[test]
    fn test_raw_ip_link_type() {
        let builder = PacketBuilder::ipv4([192, 168, 1, 1], [192, 168, 1, 2], 32).udp(53, 5353);
        let mut frame = Vec::new();
        builder.write(&mut frame, b"q").unwrap();

        assert!(classify(DataLink::RAW, &frame, SplitBy::Port).is_some());
        assert!(classify(DataLink::ETHERNET, &[0u8; 3], SplitBy::Ip).is_none());
    }

    #[test]
    fn test_router_rejects_zero_lanes() {
        assert!(matches!(FlowRouter::new(0), Err(FlowSplitError::ZeroLanes)));
    }

    #[test]
    fn test_router_is_deterministic() {
        for lanes in 1..=16 {
            let router = FlowRouter::new(lanes).unwrap();
            for port in 0..512u16 {
                let key = FlowKey::from_endpoints(port, 80);
                let first = router.route(key);
                assert!(first < lanes);
                assert_eq!(first, router.route(key));
                assert_eq!(first, router.route(FlowKey::from_endpoints(80, port)));
            }
        }
    }

    #[test]
    fn test_single_lane_takes_everything() {
        let router = FlowRouter::new(1).unwrap();
        for n in 0..100u64 {
            assert_eq!(router.route(FlowKey(n.wrapping_mul(0x9e37_79b9_7f4a_7c15))), 0);
        }
    }
}

//! Packet filter expressions
//!
//! Capture files are filtered in-process with a subset of the tcpdump filter
//! language, matched against frames sliced by etherparse:
//!
//! - protocols: `tcp`, `udp`, `icmp`, `icmp6`, `arp`, `ip`, `ip6`
//! - `[src|dst] host <addr>` and `[src|dst] net <addr>[/<len>]`
//! - `[src|dst] [tcp|udp] port <n>` and `... portrange <lo>-<hi>`
//! - `[ip|ip6] proto <n>`
//! - `not`/`!`, `and`/`&&`, `or`/`||` and parentheses
//!
//! Precedence is `not` > `and` > `or`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use etherparse::{EtherType, LinkSlice, NetSlice, TransportSlice};
use nom::branch::alt;
use nom::bytes::complete::{tag, tag_no_case, take_while1};
use nom::character::complete::{char, digit1, multispace0, multispace1};
use nom::combinator::{all_consuming, map, map_res, opt, peek, recognize, value, verify};
use nom::multi::many0;
use nom::sequence::{delimited, pair, preceded, separated_pair, terminated, tuple};
use nom::IResult;
use pcap_file::DataLink;

use super::flow::slice_frame;
use crate::error::{FlowSplitError, Result};

const IPPROTO_ICMP: u8 = 1;
const IPPROTO_ICMPV6: u8 = 58;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Src,
    Dst,
    Either,
}

impl Direction {
    fn test<T: Copy>(self, src: Option<T>, dst: Option<T>, pred: impl Fn(T) -> bool) -> bool {
        let check = |v: Option<T>| v.map_or(false, &pred);
        match self {
            Direction::Src => check(src),
            Direction::Dst => check(dst),
            Direction::Either => check(src) || check(dst),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Icmp6,
    Arp,
    Ip,
    Ip6,
}

/// Address prefix for `net` primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl Network {
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.addr, addr) {
            (IpAddr::V4(net), IpAddr::V4(a)) => prefix_eq(&net.octets(), &a.octets(), self.prefix),
            (IpAddr::V6(net), IpAddr::V6(a)) => prefix_eq(&net.octets(), &a.octets(), self.prefix),
            _ => false,
        }
    }
}

fn prefix_eq(net: &[u8], addr: &[u8], prefix: u8) -> bool {
    let whole = (prefix / 8) as usize;
    let rest = prefix % 8;
    if net[..whole] != addr[..whole] {
        return false;
    }
    if rest == 0 {
        return true;
    }
    let mask = 0xffu8 << (8 - rest);
    net[whole] & mask == addr[whole] & mask
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Primitive {
    Protocol(Protocol),
    Host {
        direction: Direction,
        addr: IpAddr,
    },
    Net {
        direction: Direction,
        net: Network,
    },
    /// A single port is stored as `low == high`
    Port {
        direction: Direction,
        protocol: Option<Protocol>,
        low: u16,
        high: u16,
    },
    Proto {
        family: Option<Protocol>,
        number: u8,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterExpr {
    Primitive(Primitive),
    Not(Box<FilterExpr>),
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
}

impl FilterExpr {
    fn negate(expr: FilterExpr) -> Self {
        FilterExpr::Not(Box::new(expr))
    }

    fn and(left: FilterExpr, right: FilterExpr) -> Self {
        FilterExpr::And(Box::new(left), Box::new(right))
    }

    fn or(left: FilterExpr, right: FilterExpr) -> Self {
        FilterExpr::Or(Box::new(left), Box::new(right))
    }

    fn eval(&self, frame: &FrameFacts) -> bool {
        match self {
            FilterExpr::Primitive(p) => p.matches(frame),
            FilterExpr::Not(inner) => !inner.eval(frame),
            FilterExpr::And(l, r) => l.eval(frame) && r.eval(frame),
            FilterExpr::Or(l, r) => l.eval(frame) || r.eval(frame),
        }
    }
}

/// The parts of a frame the primitives look at
#[derive(Debug, Default)]
struct FrameFacts {
    ether_type: Option<EtherType>,
    src: Option<IpAddr>,
    dst: Option<IpAddr>,
    ip_number: Option<u8>,
    transport: Option<(Protocol, u16, u16)>,
}

impl FrameFacts {
    fn extract(datalink: DataLink, data: &[u8]) -> Self {
        let mut facts = FrameFacts::default();
        let Some(sliced) = slice_frame(datalink, data) else {
            return facts;
        };

        if let Some(LinkSlice::Ethernet2(eth)) = &sliced.link {
            facts.ether_type = Some(eth.ether_type());
        }

        match &sliced.net {
            Some(NetSlice::Ipv4(ipv4)) => {
                let header = ipv4.header();
                facts.src = Some(IpAddr::V4(header.source_addr()));
                facts.dst = Some(IpAddr::V4(header.destination_addr()));
                facts.ip_number = Some(ipv4.payload().ip_number.0);
            }
            Some(NetSlice::Ipv6(ipv6)) => {
                let header = ipv6.header();
                facts.src = Some(IpAddr::V6(header.source_addr()));
                facts.dst = Some(IpAddr::V6(header.destination_addr()));
                facts.ip_number = Some(ipv6.payload().ip_number.0);
            }
            None => {}
        }

        facts.transport = match &sliced.transport {
            Some(TransportSlice::Tcp(tcp)) => {
                Some((Protocol::Tcp, tcp.source_port(), tcp.destination_port()))
            }
            Some(TransportSlice::Udp(udp)) => {
                Some((Protocol::Udp, udp.source_port(), udp.destination_port()))
            }
            _ => None,
        };

        facts
    }

    fn is_v4(&self) -> bool {
        matches!(self.src, Some(IpAddr::V4(_)))
    }

    fn is_v6(&self) -> bool {
        matches!(self.src, Some(IpAddr::V6(_)))
    }
}

impl Primitive {
    fn matches(&self, frame: &FrameFacts) -> bool {
        match self {
            Primitive::Protocol(proto) => match proto {
                Protocol::Tcp => matches!(frame.transport, Some((Protocol::Tcp, _, _))),
                Protocol::Udp => matches!(frame.transport, Some((Protocol::Udp, _, _))),
                Protocol::Icmp => frame.is_v4() && frame.ip_number == Some(IPPROTO_ICMP),
                Protocol::Icmp6 => frame.is_v6() && frame.ip_number == Some(IPPROTO_ICMPV6),
                Protocol::Arp => frame.ether_type == Some(EtherType::ARP),
                Protocol::Ip => frame.is_v4(),
                Protocol::Ip6 => frame.is_v6(),
            },
            Primitive::Host { direction, addr } => {
                direction.test(frame.src, frame.dst, |a| a == *addr)
            }
            Primitive::Net { direction, net } => {
                direction.test(frame.src, frame.dst, |a| net.contains(a))
            }
            Primitive::Port {
                direction,
                protocol,
                low,
                high,
            } => match frame.transport {
                Some((proto, sport, dport)) if protocol.map_or(true, |p| p == proto) => {
                    direction.test(Some(sport), Some(dport), |p| (*low..=*high).contains(&p))
                }
                _ => false,
            },
            Primitive::Proto { family, number } => {
                let family_ok = match family {
                    Some(Protocol::Ip6) => frame.is_v6(),
                    Some(_) => frame.is_v4(),
                    None => true,
                };
                family_ok && frame.ip_number == Some(*number)
            }
        }
    }
}

/// A compiled filter expression
#[derive(Debug, Clone)]
pub struct PacketFilter {
    text: String,
    expr: FilterExpr,
}

impl PacketFilter {
    /// Parse `filter`; anything outside the supported grammar is an
    /// `InvalidFilter` error.
    pub fn parse(filter: &str) -> Result<Self> {
        let invalid = |reason: String| FlowSplitError::InvalidFilter {
            filter: filter.to_string(),
            reason,
        };

        let text = filter.trim();
        if text.is_empty() {
            return Err(invalid("empty expression".into()));
        }

        match all_consuming(terminated(expr, multispace0))(text) {
            Ok((_, expr)) => Ok(Self {
                text: text.to_string(),
                expr,
            }),
            Err(e) => Err(invalid(e.to_string())),
        }
    }

    pub fn expr(&self) -> &FilterExpr {
        &self.expr
    }

    /// Whether a frame passes the filter
    pub fn matches(&self, datalink: DataLink, data: &[u8]) -> bool {
        self.expr.eval(&FrameFacts::extract(datalink, data))
    }
}

impl fmt::Display for PacketFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn expr(input: &str) -> IResult<&str, FilterExpr> {
    let (input, first) = term(input)?;
    let (input, rest) = many0(preceded(operator("or", "||"), term))(input)?;
    Ok((input, rest.into_iter().fold(first, FilterExpr::or)))
}

fn term(input: &str) -> IResult<&str, FilterExpr> {
    let (input, first) = factor(input)?;
    let (input, rest) = many0(preceded(operator("and", "&&"), factor))(input)?;
    Ok((input, rest.into_iter().fold(first, FilterExpr::and)))
}

fn factor(input: &str) -> IResult<&str, FilterExpr> {
    alt((
        map(preceded(alt((keyword("not"), terminated(tag("!"), multispace0))), factor), FilterExpr::negate),
        delimited(pair(char('('), multispace0), expr, pair(multispace0, char(')'))),
        map(primitive, FilterExpr::Primitive),
    ))(input)
}

/// A word operator followed by whitespace or an opening parenthesis
fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(tag_no_case(word), alt((multispace1, peek(tag("(")))))
}

fn operator<'a>(
    word: &'static str,
    symbol: &'static str,
) -> impl FnMut(&'a str) -> IResult<&'a str, ()> {
    value(
        (),
        pair(multispace0, alt((keyword(word), terminated(tag(symbol), multispace0)))),
    )
}

fn primitive(input: &str) -> IResult<&str, Primitive> {
    alt((
        proto_filter,
        net_filter,
        port_filter,
        host_filter,
        map(protocol, Primitive::Protocol),
    ))(input)
}

fn protocol(input: &str) -> IResult<&str, Protocol> {
    alt((
        value(Protocol::Tcp, tag_no_case("tcp")),
        value(Protocol::Udp, tag_no_case("udp")),
        value(Protocol::Icmp6, tag_no_case("icmp6")),
        value(Protocol::Icmp, tag_no_case("icmp")),
        value(Protocol::Arp, tag_no_case("arp")),
        value(Protocol::Ip6, tag_no_case("ip6")),
        value(Protocol::Ip, tag_no_case("ip")),
    ))(input)
}

fn direction(input: &str) -> IResult<&str, Direction> {
    map(
        opt(terminated(
            alt((
                value(Direction::Src, tag_no_case("src")),
                value(Direction::Dst, tag_no_case("dst")),
            )),
            multispace1,
        )),
        |dir| dir.unwrap_or(Direction::Either),
    )(input)
}

fn host_filter(input: &str) -> IResult<&str, Primitive> {
    let (input, direction) = direction(input)?;
    let (input, addr) = preceded(pair(tag_no_case("host"), multispace1), ip_addr)(input)?;
    Ok((input, Primitive::Host { direction, addr }))
}

fn net_filter(input: &str) -> IResult<&str, Primitive> {
    let (input, direction) = direction(input)?;
    let (input, addr) = preceded(pair(tag_no_case("net"), multispace1), ip_addr)(input)?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    let (input, prefix) = opt(preceded(
        char('/'),
        verify(map_res(digit1, |s: &str| s.parse::<u8>()), |len: &u8| *len <= max),
    ))(input)?;

    Ok((
        input,
        Primitive::Net {
            direction,
            net: Network {
                addr,
                prefix: prefix.unwrap_or(max),
            },
        },
    ))
}

fn port_filter(input: &str) -> IResult<&str, Primitive> {
    let (input, direction) = direction(input)?;
    let (input, protocol) = opt(terminated(
        alt((
            value(Protocol::Tcp, tag_no_case("tcp")),
            value(Protocol::Udp, tag_no_case("udp")),
        )),
        multispace1,
    ))(input)?;
    let (input, (a, b)) = alt((
        preceded(
            pair(tag_no_case("portrange"), multispace1),
            separated_pair(port_number, char('-'), port_number),
        ),
        map(preceded(pair(tag_no_case("port"), multispace1), port_number), |p| (p, p)),
    ))(input)?;

    Ok((
        input,
        Primitive::Port {
            direction,
            protocol,
            low: a.min(b),
            high: a.max(b),
        },
    ))
}

fn proto_filter(input: &str) -> IResult<&str, Primitive> {
    let (input, family) = opt(terminated(
        alt((
            value(Protocol::Ip6, tag_no_case("ip6")),
            value(Protocol::Ip, tag_no_case("ip")),
        )),
        multispace1,
    ))(input)?;
    let (input, number) = preceded(
        pair(tag_no_case("proto"), multispace1),
        map_res(digit1, |s: &str| s.parse::<u8>()),
    )(input)?;
    Ok((input, Primitive::Proto { family, number }))
}

fn port_number(input: &str) -> IResult<&str, u16> {
    map_res(digit1, |s: &str| s.parse::<u16>())(input)
}

fn ip_addr(input: &str) -> IResult<&str, IpAddr> {
    alt((
        map_res(
            verify(
                take_while1(|c: char| c.is_ascii_hexdigit() || c == ':' || c == '.'),
                |s: &str| s.contains(':'),
            ),
            |s: &str| s.parse::<Ipv6Addr>().map(IpAddr::V6),
        ),
        map_res(
            recognize(tuple((digit1, char('.'), digit1, char('.'), digit1, char('.'), digit1))),
            |s: &str| s.parse::<Ipv4Addr>().map(IpAddr::V4),
        ),
    ))(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    fn tcp(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4(src, dst, 64)
            .tcp(sport, dport, 1, 1024);
        let mut out = Vec::new();
        builder.write(&mut out, b"x").unwrap();
        out
    }

    fn udp(sport: u16, dport: u16) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1; 6], [2; 6])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(sport, dport);
        let mut out = Vec::new();
        builder.write(&mut out, b"x").unwrap();
        out
    }

    fn arp() -> Vec<u8> {
        let mut out = vec![0xff; 6];
        out.extend_from_slice(&[2, 0, 0, 0, 0, 1, 0x08, 0x06]);
        out.extend_from_slice(&[0, 1, 0x08, 0, 6, 4, 0, 1]);
        out.extend_from_slice(&[2, 0, 0, 0, 0, 1, 10, 0, 0, 1]);
        out.extend_from_slice(&[0, 0, 0, 0, 0, 0, 10, 0, 0, 2]);
        out
    }

    fn accepts(filter: &str, frame: &[u8]) -> bool {
        PacketFilter::parse(filter).unwrap().matches(DataLink::ETHERNET, frame)
    }

    #[test]
    fn test_default_filter_excludes_ssh() {
        assert!(!accepts("not port 22", &tcp([10, 0, 0, 1], [10, 0, 0, 2], 50000, 22)));
        assert!(!accepts("not port 22", &tcp([10, 0, 0, 2], [10, 0, 0, 1], 22, 50000)));
        assert!(accepts("not port 22", &tcp([10, 0, 0, 1], [10, 0, 0, 2], 50000, 443)));
        assert!(accepts("not port 22", &arp()));
    }

    #[test]
    fn test_parse_precedence() {
        let filter = PacketFilter::parse("tcp or udp and not port 53").unwrap();
        assert!(matches!(filter.expr(), FilterExpr::Or(_, _)));

        let grouped = PacketFilter::parse("(tcp or udp) and not port 53").unwrap();
        assert!(matches!(grouped.expr(), FilterExpr::And(_, _)));
        assert_eq!(grouped.to_string(), "(tcp or udp) and not port 53");
    }

    #[test]
    fn test_protocol_primitives() {
        let t = tcp([10, 0, 0, 1], [10, 0, 0, 2], 1000, 80);
        assert!(accepts("tcp", &t));
        assert!(accepts("ip", &t));
        assert!(!accepts("udp", &t));
        assert!(!accepts("ip6", &t));
        assert!(accepts("arp", &arp()));
        assert!(!accepts("ip", &arp()));
        assert!(accepts("proto 6", &t));
        assert!(accepts("ip proto 17", &udp(1, 2)));
    }

    #[test]
    fn test_port_qualifiers() {
        let u = udp(5353, 53);
        assert!(accepts("port 53", &u));
        assert!(accepts("udp port 53", &u));
        assert!(!accepts("tcp port 53", &u));
        assert!(accepts("dst port 53", &u));
        assert!(!accepts("src port 53", &u));
        assert!(accepts("portrange 5000-6000", &u));
        assert!(accepts("src portrange 6000-5000", &u));
        assert!(!accepts("dst portrange 5000-6000", &u));
    }

    #[test]
    fn test_host_and_net() {
        let t = tcp([192, 168, 1, 10], [8, 8, 8, 8], 1000, 53);
        assert!(accepts("host 8.8.8.8", &t));
        assert!(accepts("src host 192.168.1.10", &t));
        assert!(!accepts("dst host 192.168.1.10", &t));
        assert!(accepts("net 192.168.0.0/16", &t));
        assert!(accepts("src net 192.168.1.8/29", &t));
        assert!(!accepts("src net 192.168.1.0/29", &t));
        assert!(!accepts("net ::/0", &t));
    }

    #[test]
    fn test_symbolic_operators() {
        let t = tcp([10, 0, 0, 1], [10, 0, 0, 2], 22, 4000);
        assert!(accepts("tcp && !port 80", &t));
        assert!(accepts("udp || port 22", &t));
        assert!(accepts("not(port 80)", &t));
    }

    #[test]
    fn test_rejects_unsupported_expressions() {
        for bad in ["", "   ", "vlan 100", "port", "port 70000", "net 10.0.0.0/33", "tcp and", "(tcp"] {
            assert!(
                matches!(PacketFilter::parse(bad), Err(FlowSplitError::InvalidFilter { .. })),
                "{:?}",
                bad
            );
        }
    }

    #[test]
    fn test_unparseable_frame_only_matches_negations() {
        let junk = [0u8; 5];
        assert!(!accepts("port 22", &junk));
        assert!(accepts("not port 22", &junk));
    }

    #[test]
    fn test_prefix_eq() {
        assert!(prefix_eq(&[10, 1, 2, 3], &[10, 200, 0, 0], 8));
        assert!(!prefix_eq(&[10, 1, 2, 3], &[11, 1, 2, 3], 8));
        assert!(prefix_eq(&[192, 168, 1, 128], &[192, 168, 1, 200], 25));
        assert!(!prefix_eq(&[192, 168, 1, 0], &[192, 168, 1, 200], 25));
        assert!(prefix_eq(&[1, 2, 3, 4], &[5, 6, 7, 8], 0));
    }
}

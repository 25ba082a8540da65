//! DNS answer-section decoding.
//!
//! Grounded in `original_source/processor/protoparsers.go`'s `DNSParser`
//! (filters on UDP source port 53, decodes via a packet-parsing library,
//! emits one event per A/AAAA/CNAME answer). Decoding uses the same
//! `dns_parser` crate (a `stanford-esrg` fork) that
//! `core/src/protocols/stream/dns/parser.rs` uses for the same step,
//! rather than hand-rolling a second DNS message parser.

use std::net::IpAddr;
use std::time::Duration;

use serde::Serialize;

use crate::event::{self, Event, EventManager, Processor, Topic};
use crate::packet::{FiveTuple, Packet};

const DNS_PORT: u16 = 53;

/// One DNS answer record. `client_ip`/`dns_server_ip` come straight from the
/// packet's 5-tuple rather than from `header`: a DNS *response* packet has
/// `src` = the resolving server and `dst` = the querying client, which is
/// already the orientation these fields need.
#[derive(Debug, Clone, Serialize)]
pub struct DnsAnswer {
    pub timestamp: Duration,
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    /// The CNAME target, present only for CNAME answers.
    pub cname: Option<String>,
    /// The resolved address, present only for A/AAAA answers.
    pub server_ip: Option<IpAddr>,
    pub client_ip: IpAddr,
    pub dns_server_ip: IpAddr,
}

/// Subscribes to `"packet"`, decodes UDP-sourced-from-port-53 payloads as
/// DNS responses, and publishes one `"protocol.dns"` event per A, AAAA, or
/// CNAME answer record.
pub struct DnsParser {
    subs: Vec<Topic>,
    pubs: Vec<Topic>,
}

impl DnsParser {
    pub fn new() -> Self {
        DnsParser {
            subs: vec![event::PACKET],
            pubs: vec![event::PROTOCOL_DNS],
        }
    }
}

impl Default for DnsParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for DnsParser {
    fn name(&self) -> &str {
        "dns_parser"
    }

    fn subs(&self) -> &[Topic] {
        &self.subs
    }

    fn pubs(&self) -> &[Topic] {
        &self.pubs
    }

    fn handle_event(&self, topic: Topic, event: &Event, bus: &EventManager) {
        let Event::Packet(p) = event else { return };
        if topic != event::PACKET {
            return;
        }
        // UDP protocol number 17; DNS responses come from port 53. NetBIOS
        // name service also lives on a neighboring port range but never on
        // exactly 53, so no extra filtering is needed here (contrast
        // `dns::parser::DnsParser::probe`, which must additionally exclude
        // NetBIOS port 137 false positives because its probe runs on
        // *both* of the connection's ports).
        if p.header.protocol != 17 || p.header.src_port != DNS_PORT {
            return;
        }

        let Ok(dns) = dns_parser::Packet::parse(&p.payload) else {
            return;
        };

        for answer in &dns.answers {
            let Some((record_type, cname, server_ip)) = describe_answer(&answer.data) else {
                continue;
            };
            bus.publish(
                event::PROTOCOL_DNS,
                Event::Dns(DnsAnswer {
                    timestamp: p.timestamp,
                    name: answer.name.to_string(),
                    record_type: record_type.to_string(),
                    cname,
                    server_ip,
                    client_ip: p.header.dst_ip,
                    dns_server_ip: p.header.src_ip,
                }),
            );
        }
    }
}

fn describe_answer(data: &dns_parser::RData) -> Option<(&'static str, Option<String>, Option<IpAddr>)> {
    match data {
        dns_parser::RData::A(a) => Some(("A", None, a.0.to_string().parse().ok())),
        dns_parser::RData::AAAA(a) => Some(("AAAA", None, a.0.to_string().parse().ok())),
        dns_parser::RData::CNAME(name) => Some(("CNAME", Some(name.0.to_string()), None)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_udp_packets_are_ignored() {
        let bus = EventManager::new();
        let parser = DnsParser::new();
        let p = Packet {
            timestamp: std::time::Duration::ZERO,
            header: FiveTuple {
                src_ip: "8.8.8.8".parse().unwrap(),
                dst_ip: "10.0.0.1".parse().unwrap(),
                src_port: 53,
                dst_port: 51000,
                protocol: 6, // TCP, not UDP: must be ignored
            },
            total_len: 0,
            payload: vec![],
            is_outbound: false,
            tcp: None,
        };
        parser.handle_event(event::PACKET, &Event::Packet(p), &bus);
    }

    #[test]
    fn non_port_53_udp_is_ignored() {
        let bus = EventManager::new();
        let parser = DnsParser::new();
        let p = Packet {
            timestamp: std::time::Duration::ZERO,
            header: FiveTuple {
                src_ip: "8.8.8.8".parse().unwrap(),
                dst_ip: "10.0.0.1".parse().unwrap(),
                src_port: 12345,
                dst_port: 51000,
                protocol: 17,
            },
            total_len: 0,
            payload: vec![],
            is_outbound: false,
            tcp: None,
        };
        parser.handle_event(event::PACKET, &Event::Packet(p), &bus);
    }
}

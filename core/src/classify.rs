//! Flow classification: static subnet/port/protocol rules plus an optional
//! TLS-SNI regex rule, matched against a flow's header the instant it is
//! created.
//!
//! Grounded in `original_source/processor/classifiers.go` (`Rule`,
//! `BuildRule`'s `*`/`n`/`n-m` port-spec grammar, `Match`, `HeaderClassifier`
//! subscribing to `flow.created`). The error style (one `#[error(...)]`
//! variant per failure mode) follows `filter/mod.rs`'s `FilterError`.

use std::net::IpAddr;

use ipnet::IpNet;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::event::{self, Event, EventManager, Processor, Topic};
use crate::packet::FiveTuple;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid CIDR {0:?}: {1}")]
    InvalidSubnet(String, ipnet::AddrParseError),
    #[error("invalid port spec {0:?}: expected '*', a number, or 'n-m'")]
    InvalidPortSpec(String),
    #[error("invalid SNI pattern {0:?}: {1}")]
    InvalidSniPattern(String, regex::Error),
}

/// An inclusive port range. `(0, 65535)` is the wildcard produced by `"*"`.
pub type PortRange = (u16, u16);

/// Parses a port spec in the `original_source` grammar: `*` (wildcard), a
/// bare number, or `n-m` (inclusive range), with surrounding whitespace
/// stripped.
pub fn parse_port_range(spec: &str) -> Result<PortRange, RuleError> {
    let spec = spec.trim();
    if spec == "*" {
        return Ok((0, 65535));
    }
    if let Some((lo, hi)) = spec.split_once('-') {
        let lo: u16 = lo
            .trim()
            .parse()
            .map_err(|_| RuleError::InvalidPortSpec(spec.to_string()))?;
        let hi: u16 = hi
            .trim()
            .parse()
            .map_err(|_| RuleError::InvalidPortSpec(spec.to_string()))?;
        return Ok((lo, hi));
    }
    let port: u16 = spec
        .parse()
        .map_err(|_| RuleError::InvalidPortSpec(spec.to_string()))?;
    Ok((port, port))
}

fn in_range((lo, hi): PortRange, port: u16) -> bool {
    port >= lo && port <= hi
}

/// A header-matching classification rule.
///
/// Field names follow the "client" / "server" framing of
/// `original_source/processor/classifiers.go`'s `Rule`: the server is
/// whichever side matches `server_subnet`/`server_ports`, regardless of
/// which side of the 5-tuple (src/dst) happens to be inbound.
#[derive(Debug, Clone)]
pub struct Rule {
    pub class: String,
    pub client_subnet: IpNet,
    pub server_subnet: IpNet,
    pub client_ports: PortRange,
    pub server_ports: PortRange,
    pub protocol: Option<u8>,
}

impl Rule {
    /// The rule that matches every flow, used as a catch-all default class.
    pub fn star(class: impl Into<String>) -> Self {
        Rule {
            class: class.into(),
            client_subnet: "0.0.0.0/0".parse().unwrap(),
            server_subnet: "0.0.0.0/0".parse().unwrap(),
            client_ports: (0, 65535),
            server_ports: (0, 65535),
            protocol: None,
        }
    }

    /// A flow header is always in canonical orientation (`src` = server,
    /// `dst` = client — see [`Packet::canonical_key`](crate::packet::Packet::canonical_key)),
    /// so only that single orientation is checked, matching `Match` in
    /// `original_source/processor/classifiers.go`.
    pub fn matches(&self, header: &FiveTuple) -> bool {
        if let Some(proto) = self.protocol {
            if proto != header.protocol {
                return false;
            }
        }
        self.matches_oriented(header.src_ip, header.src_port, header.dst_ip, header.dst_port)
    }

    fn matches_oriented(
        &self,
        server_ip: IpAddr,
        server_port: u16,
        client_ip: IpAddr,
        client_port: u16,
    ) -> bool {
        in_range(self.server_ports, server_port)
            && in_range(self.client_ports, client_port)
            && self.server_subnet.contains(&server_ip)
            && self.client_subnet.contains(&client_ip)
    }
}

/// A flow's header matched one or more classification rules.
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub header: FiveTuple,
    pub class: String,
}

/// Matches every newly created flow's header against a static rule set and
/// publishes one `"classification"` event per matching rule.
///
/// Grounded in `HeaderClassifier` in `original_source/processor/classifiers.go`.
pub struct HeaderClassifier {
    rules: Vec<Rule>,
    subs: Vec<Topic>,
    pubs: Vec<Topic>,
}

impl HeaderClassifier {
    pub fn new(rules: Vec<Rule>) -> Self {
        HeaderClassifier {
            rules,
            subs: vec![event::FLOW_CREATED],
            pubs: vec![event::CLASSIFICATION],
        }
    }
}

impl Processor for HeaderClassifier {
    fn name(&self) -> &str {
        "header_classifier"
    }

    fn subs(&self) -> &[Topic] {
        &self.subs
    }

    fn pubs(&self) -> &[Topic] {
        &self.pubs
    }

    fn handle_event(&self, topic: Topic, event: &Event, bus: &EventManager) {
        let Event::FlowCreated(created) = event else {
            return;
        };
        if topic != event::FLOW_CREATED {
            return;
        }
        for rule in &self.rules {
            if rule.matches(&created.header) {
                bus.publish(
                    event::CLASSIFICATION,
                    Event::Classification(Classification {
                        header: created.header,
                        class: rule.class.clone(),
                    }),
                );
            }
        }
    }
}

/// An SNI-hostname-matching classification rule.
pub struct SniRule {
    pub class: String,
    pattern: Regex,
}

impl SniRule {
    pub fn new(class: impl Into<String>, pattern: &str) -> Result<Self, RuleError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| RuleError::InvalidSniPattern(pattern.to_string(), e))?;
        Ok(SniRule {
            class: class.into(),
            pattern,
        })
    }
}

/// Matches every observed TLS/QUIC SNI hostname against a static set of
/// regex rules and publishes one `"classification"` event per match.
///
/// Grounded in `original_source/processor/classifiers.go`'s
/// `HeaderClassifier` sibling for SNI-based rules (the original keeps both
/// rule kinds in one `Classifier`; this engine splits them into two
/// processors since they subscribe to different topics —
/// `"flow.created"` versus `"protocol.sni"`).
pub struct SniClassifier {
    rules: Vec<SniRule>,
    subs: Vec<Topic>,
    pubs: Vec<Topic>,
}

impl SniClassifier {
    pub fn new(rules: Vec<SniRule>) -> Self {
        SniClassifier {
            rules,
            subs: vec![event::PROTOCOL_SNI],
            pubs: vec![event::CLASSIFICATION],
        }
    }
}

impl Processor for SniClassifier {
    fn name(&self) -> &str {
        "sni_classifier"
    }

    fn subs(&self) -> &[Topic] {
        &self.subs
    }

    fn pubs(&self) -> &[Topic] {
        &self.pubs
    }

    fn handle_event(&self, topic: Topic, event: &Event, bus: &EventManager) {
        let Event::Sni(record) = event else { return };
        if topic != event::PROTOCOL_SNI {
            return;
        }
        for rule in &self.rules {
            if rule.pattern.is_match(&record.sni) {
                bus.publish(
                    event::CLASSIFICATION,
                    Event::Classification(Classification {
                        header: record.header,
                        class: rule.class.clone(),
                    }),
                );
            }
        }
    }
}

//! Normalized packet representation and flow identity.
//!
//! Grounded in `original_source/common/common.go` and
//! `original_source/packets/packetparser.go`'s `FiveTuple`/`Packet` types,
//! with string addresses replaced by `IpAddr` — the representation
//! `datatypes/src/connection.rs` uses throughout its own connection
//! datatypes.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The 5-tuple that identifies a transport-layer flow.
///
/// The *canonical* orientation of a 5-tuple is the inbound direction: when a
/// packet is outbound, [`Packet::canonical_key`] swaps source and
/// destination before returning a `FiveTuple`, so two packets belonging to
/// the same flow always produce the same key regardless of which direction
/// they travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FiveTuple {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

impl std::fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} ={}= {}:{}",
            self.src_ip, self.src_port, self.protocol, self.dst_ip, self.dst_port
        )
    }
}

/// The parsed TCP-specific fields needed by the TCP telemetry functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpHeader {
    pub seq: u32,
    pub ack: u32,
    pub syn: bool,
    pub ack_flag: bool,
}

/// A normalized packet as delivered to the event fabric.
///
/// `timestamp` is capture time (monotonic per input source), never wall
/// clock: every telemetry function and the flow table's idle-eviction logic
/// is driven exclusively by this field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub timestamp: Duration,
    pub header: FiveTuple,
    pub total_len: u32,
    pub payload: Vec<u8>,
    pub is_outbound: bool,
    pub tcp: Option<TcpHeader>,
}

impl Packet {
    /// The direction-independent identity of this packet's flow.
    ///
    /// Idempotent: `canonical_key` of a packet already in canonical
    /// orientation returns the same tuple unchanged.
    pub fn canonical_key(&self) -> FiveTuple {
        if self.is_outbound {
            FiveTuple {
                src_ip: self.header.dst_ip,
                dst_ip: self.header.src_ip,
                src_port: self.header.dst_port,
                dst_port: self.header.src_port,
                protocol: self.header.protocol,
            }
        } else {
            self.header
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(src_port: u16, dst_port: u16) -> FiveTuple {
        FiveTuple {
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "1.2.3.4".parse().unwrap(),
            src_port,
            dst_port,
            protocol: 6,
        }
    }

    fn packet(header: FiveTuple, is_outbound: bool) -> Packet {
        Packet {
            timestamp: Duration::ZERO,
            header,
            total_len: 0,
            payload: Vec::new(),
            is_outbound,
            tcp: None,
        }
    }

    #[test]
    fn canonical_key_is_direction_independent() {
        let inbound = packet(tuple(443, 51000), false);
        let outbound = packet(
            FiveTuple {
                src_ip: inbound.header.dst_ip,
                dst_ip: inbound.header.src_ip,
                src_port: inbound.header.dst_port,
                dst_port: inbound.header.src_port,
                protocol: 6,
            },
            true,
        );
        assert_eq!(inbound.canonical_key(), outbound.canonical_key());
    }

    #[test]
    fn canonical_key_is_idempotent() {
        let p = packet(tuple(443, 51000), false);
        let key = p.canonical_key();
        let rewrapped = packet(key, false);
        assert_eq!(rewrapped.canonical_key(), key);
    }
}

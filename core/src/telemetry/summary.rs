//! `FlowSummary`: whole-flow byte/packet/payload counters and first/last
//! packet timestamps.
//!
//! Grounded in `original_source/telemetry/flowsummary.go`.

use std::time::Duration;

use serde::Serialize;

use super::TelemetryFunction;
use crate::event::EventManager;
use crate::packet::{FiveTuple, Packet};

#[derive(Debug, Clone, Serialize)]
pub struct FlowSummarySnapshot {
    pub header: FiveTuple,
    pub up_bytes: u64,
    pub down_bytes: u64,
    pub up_payload_bytes: u64,
    pub down_payload_bytes: u64,
    pub up_packets: u64,
    pub down_packets: u64,
    pub first_ts: Duration,
    pub last_ts: Duration,
}

pub struct FlowSummary {
    header: FiveTuple,
    up_bytes: u64,
    down_bytes: u64,
    up_payload_bytes: u64,
    down_payload_bytes: u64,
    up_packets: u64,
    down_packets: u64,
    first_ts: Option<Duration>,
    last_ts: Duration,
}

impl FlowSummary {
    pub fn new() -> Self {
        FlowSummary {
            header: FiveTuple {
                src_ip: "0.0.0.0".parse().unwrap(),
                dst_ip: "0.0.0.0".parse().unwrap(),
                src_port: 0,
                dst_port: 0,
                protocol: 0,
            },
            up_bytes: 0,
            down_bytes: 0,
            up_payload_bytes: 0,
            down_payload_bytes: 0,
            up_packets: 0,
            down_packets: 0,
            first_ts: None,
            last_ts: Duration::ZERO,
        }
    }

    fn snapshot(&self) -> FlowSummarySnapshot {
        FlowSummarySnapshot {
            header: self.header,
            up_bytes: self.up_bytes,
            down_bytes: self.down_bytes,
            up_payload_bytes: self.up_payload_bytes,
            down_payload_bytes: self.down_payload_bytes,
            up_packets: self.up_packets,
            down_packets: self.down_packets,
            first_ts: self.first_ts.unwrap_or(Duration::ZERO),
            last_ts: self.last_ts,
        }
    }
}

impl Default for FlowSummary {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryFunction for FlowSummary {
    fn name(&self) -> &'static str {
        "flow_summary"
    }

    fn set_header(&mut self, header: FiveTuple) {
        self.header = header;
    }

    fn on_flow_packet(&mut self, packet: &Packet, _bus: &EventManager) {
        if self.first_ts.is_none() {
            self.first_ts = Some(packet.timestamp);
        }
        self.last_ts = packet.timestamp;
        if packet.is_outbound {
            self.up_bytes += packet.total_len as u64;
            self.up_payload_bytes += packet.payload.len() as u64;
            self.up_packets += 1;
        } else {
            self.down_bytes += packet.total_len as u64;
            self.down_payload_bytes += packet.payload.len() as u64;
            self.down_packets += 1;
        }
    }

    fn teardown(&mut self, bus: &EventManager) {
        bus.publish(
            crate::event::TELEMETRY_FLOW_SUMMARY,
            crate::event::Event::FlowSummary(self.snapshot()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(ts_ms: u64, len: usize, outbound: bool) -> Packet {
        Packet {
            timestamp: Duration::from_millis(ts_ms),
            header: FiveTuple {
                src_ip: "10.0.0.1".parse().unwrap(),
                dst_ip: "1.2.3.4".parse().unwrap(),
                src_port: 1000,
                dst_port: 443,
                protocol: 6,
            },
            total_len: len as u32,
            payload: vec![0u8; len],
            is_outbound: outbound,
            tcp: None,
        }
    }

    #[test]
    fn tracks_first_and_last_timestamp() {
        let mut s = FlowSummary::new();
        let bus = EventManager::new();
        s.on_flow_packet(&packet(10, 100, false), &bus);
        s.on_flow_packet(&packet(50, 100, true), &bus);
        assert_eq!(s.first_ts, Some(Duration::from_millis(10)));
        assert_eq!(s.last_ts, Duration::from_millis(50));
    }

    #[test]
    fn accumulates_per_direction_counters() {
        let mut s = FlowSummary::new();
        let bus = EventManager::new();
        s.on_flow_packet(&packet(0, 100, false), &bus);
        s.on_flow_packet(&packet(1, 200, false), &bus);
        s.on_flow_packet(&packet(2, 50, true), &bus);
        assert_eq!(s.down_packets, 2);
        assert_eq!(s.down_bytes, 300);
        assert_eq!(s.up_packets, 1);
        assert_eq!(s.up_bytes, 50);
    }
}

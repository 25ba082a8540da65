//! `FlowPulse` and `FlowPrint`: fixed-interval traffic histograms.
//!
//! Grounded in `original_source/telemetry/flowpulse.go`,
//! `original_source/telemetry/flowprint.go`, and the shared
//! `GetIndex`/`ExtendUntil` helpers in `original_source/telemetry/helper.go`.
//! `FlowPrint` additionally buckets packets by payload size into zero / mid
//! (<=1250 bytes) / high (>1250 bytes), one triple of counters per
//! direction per interval, exactly as `flowprint.go` does.

use std::time::Duration;

use serde::Serialize;

use super::TelemetryFunction;
use crate::event::{self, Event, EventManager};
use crate::packet::{FiveTuple, Packet};

/// The payload-size threshold `original_source/telemetry/flowprint.go`
/// classifies packets against: `<=1250` is "mid", `>1250` is "high".
const MID_PAYLOAD_THRESHOLD: usize = 1250;

/// Computes which fixed-width interval bucket `now` falls into, given the
/// histogram's `start` timestamp and `interval`. Mirrors
/// `original_source/telemetry/helper.go`'s `GetIndex`.
fn bucket_index(start: Duration, now: Duration, interval: Duration) -> usize {
    let elapsed = now.saturating_sub(start);
    (elapsed.as_nanos() / interval.as_nanos().max(1)) as usize
}

/// Grows `buckets` with `default()`-initialized entries so that
/// `buckets[idx]` is valid, mirroring `ExtendUntil`.
fn extend_until<T: Default + Clone>(buckets: &mut Vec<T>, idx: usize) {
    if idx >= buckets.len() {
        buckets.resize(idx + 1, T::default());
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct PulseBucket {
    pub up_bytes: u64,
    pub down_bytes: u64,
    pub up_packets: u64,
    pub down_packets: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowPulseSnapshot {
    pub header: FiveTuple,
    pub interval_ms: u64,
    pub buckets: Vec<PulseBucket>,
}

pub struct FlowPulse {
    header: FiveTuple,
    interval: Duration,
    start: Option<Duration>,
    buckets: Vec<PulseBucket>,
}

impl FlowPulse {
    pub fn new(interval: Duration) -> Self {
        FlowPulse {
            header: FiveTuple {
                src_ip: "0.0.0.0".parse().unwrap(),
                dst_ip: "0.0.0.0".parse().unwrap(),
                src_port: 0,
                dst_port: 0,
                protocol: 0,
            },
            interval,
            start: None,
            buckets: Vec::new(),
        }
    }
}

impl TelemetryFunction for FlowPulse {
    fn name(&self) -> &'static str {
        "flow_pulse"
    }

    fn set_header(&mut self, header: FiveTuple) {
        self.header = header;
    }

    fn on_flow_packet(&mut self, packet: &Packet, _bus: &EventManager) {
        let start = *self.start.get_or_insert(packet.timestamp);
        let idx = bucket_index(start, packet.timestamp, self.interval);
        extend_until(&mut self.buckets, idx);
        let bucket = &mut self.buckets[idx];
        if packet.is_outbound {
            bucket.up_bytes += packet.total_len as u64;
            bucket.up_packets += 1;
        } else {
            bucket.down_bytes += packet.total_len as u64;
            bucket.down_packets += 1;
        }
    }

    fn teardown(&mut self, bus: &EventManager) {
        bus.publish(
            event::TELEMETRY_FLOW_PULSE,
            Event::FlowPulse(FlowPulseSnapshot {
                header: self.header,
                interval_ms: self.interval.as_millis() as u64,
                buckets: self.buckets.clone(),
            }),
        );
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct PrintBucket {
    pub up_zero: u64,
    pub up_mid: u64,
    pub up_high: u64,
    pub down_zero: u64,
    pub down_mid: u64,
    pub down_high: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowPrintSnapshot {
    pub header: FiveTuple,
    pub interval_ms: u64,
    pub buckets: Vec<PrintBucket>,
}

pub struct FlowPrint {
    header: FiveTuple,
    interval: Duration,
    start: Option<Duration>,
    buckets: Vec<PrintBucket>,
}

impl FlowPrint {
    pub fn new(interval: Duration) -> Self {
        FlowPrint {
            header: FiveTuple {
                src_ip: "0.0.0.0".parse().unwrap(),
                dst_ip: "0.0.0.0".parse().unwrap(),
                src_port: 0,
                dst_port: 0,
                protocol: 0,
            },
            interval,
            start: None,
            buckets: Vec::new(),
        }
    }
}

impl TelemetryFunction for FlowPrint {
    fn name(&self) -> &'static str {
        "flow_print"
    }

    fn set_header(&mut self, header: FiveTuple) {
        self.header = header;
    }

    fn on_flow_packet(&mut self, packet: &Packet, _bus: &EventManager) {
        let start = *self.start.get_or_insert(packet.timestamp);
        let idx = bucket_index(start, packet.timestamp, self.interval);
        extend_until(&mut self.buckets, idx);
        let bucket = &mut self.buckets[idx];
        let payload_len = packet.payload.len();
        match (packet.is_outbound, payload_len) {
            (true, 0) => bucket.up_zero += 1,
            (true, n) if n <= MID_PAYLOAD_THRESHOLD => bucket.up_mid += 1,
            (true, _) => bucket.up_high += 1,
            (false, 0) => bucket.down_zero += 1,
            (false, n) if n <= MID_PAYLOAD_THRESHOLD => bucket.down_mid += 1,
            (false, _) => bucket.down_high += 1,
        }
    }

    fn teardown(&mut self, bus: &EventManager) {
        bus.publish(
            event::TELEMETRY_FLOW_PRINT,
            Event::FlowPrint(FlowPrintSnapshot {
                header: self.header,
                interval_ms: self.interval.as_millis() as u64,
                buckets: self.buckets.clone(),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> FiveTuple {
        FiveTuple {
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "1.2.3.4".parse().unwrap(),
            src_port: 1000,
            dst_port: 443,
            protocol: 6,
        }
    }

    fn packet(ts_ms: u64, payload_len: usize, outbound: bool) -> Packet {
        Packet {
            timestamp: Duration::from_millis(ts_ms),
            header: header(),
            total_len: payload_len as u32,
            payload: vec![0u8; payload_len],
            is_outbound: outbound,
            tcp: None,
        }
    }

    #[test]
    fn bucket_index_is_relative_to_first_packet() {
        assert_eq!(bucket_index(Duration::from_millis(100), Duration::from_millis(100), Duration::from_millis(50)), 0);
        assert_eq!(bucket_index(Duration::from_millis(100), Duration::from_millis(149), Duration::from_millis(50)), 0);
        assert_eq!(bucket_index(Duration::from_millis(100), Duration::from_millis(150), Duration::from_millis(50)), 1);
    }

    #[test]
    fn pulse_buckets_packets_by_interval() {
        let mut pulse = FlowPulse::new(Duration::from_millis(1000));
        let bus = EventManager::new();
        pulse.on_flow_packet(&packet(0, 10, false), &bus);
        pulse.on_flow_packet(&packet(500, 10, false), &bus);
        pulse.on_flow_packet(&packet(1500, 10, true), &bus);
        assert_eq!(pulse.buckets.len(), 2);
        assert_eq!(pulse.buckets[0].down_packets, 2);
        assert_eq!(pulse.buckets[1].up_packets, 1);
    }

    #[test]
    fn print_classifies_by_payload_size() {
        let mut print = FlowPrint::new(Duration::from_millis(1000));
        let bus = EventManager::new();
        print.on_flow_packet(&packet(0, 0, false), &bus);
        print.on_flow_packet(&packet(0, 500, false), &bus);
        print.on_flow_packet(&packet(0, 2000, true), &bus);
        let b = print.buckets[0];
        assert_eq!(b.down_zero, 1);
        assert_eq!(b.down_mid, 1);
        assert_eq!(b.up_high, 1);
    }
}

//! `HTTPChunkDetector`: tracks inbound response bursts that follow a
//! large-enough outbound request.
//!
//! Fully specified by spec prose (no surviving `original_source` file for
//! this function); an outbound packet whose payload exceeds `threshold`
//! opens a chunk, inbound packets accumulate into it, and an informational
//! >200ms inbound-gap warning is logged but never affects chunk boundaries.

use std::time::Duration;

use serde::Serialize;

use super::TelemetryFunction;
use crate::event::{self, Event, EventManager};
use crate::packet::{FiveTuple, Packet};

/// Logged, not acted on: an inbound packet arriving more than this long
/// after the previous inbound packet of the same open chunk.
const INFORMATIONAL_GAP_WARNING: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Serialize)]
pub struct HttpChunk {
    pub start: Duration,
    pub end: Duration,
    pub request_len: u64,
    pub packets: u64,
    pub bytes: u64,
    pub inter_packet_times_ms: Vec<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpChunkClosed {
    pub header: FiveTuple,
    pub start: Duration,
    pub end: Duration,
    pub threshold: u64,
    pub chunks: Vec<HttpChunk>,
}

struct OpenChunk {
    start: Duration,
    end: Duration,
    request_len: u64,
    packets: u64,
    bytes: u64,
    last_inbound_ts: Option<Duration>,
    inter_packet_times_ms: Vec<u64>,
}

pub struct HttpChunkDetector {
    header: FiveTuple,
    threshold: u64,
    first_ts: Option<Duration>,
    last_ts: Duration,
    open: Option<OpenChunk>,
    chunks: Vec<HttpChunk>,
}

impl HttpChunkDetector {
    pub fn new(threshold: u64) -> Self {
        HttpChunkDetector {
            header: zero_header(),
            threshold,
            first_ts: None,
            last_ts: Duration::ZERO,
            open: None,
            chunks: Vec::new(),
        }
    }

    fn close_open(&mut self) {
        if let Some(o) = self.open.take() {
            self.chunks.push(HttpChunk {
                start: o.start,
                end: o.end,
                request_len: o.request_len,
                packets: o.packets,
                bytes: o.bytes,
                inter_packet_times_ms: o.inter_packet_times_ms,
            });
        }
    }
}

fn zero_header() -> FiveTuple {
    FiveTuple {
        src_ip: "0.0.0.0".parse().unwrap(),
        dst_ip: "0.0.0.0".parse().unwrap(),
        src_port: 0,
        dst_port: 0,
        protocol: 0,
    }
}

impl TelemetryFunction for HttpChunkDetector {
    fn name(&self) -> &'static str {
        "http_chunk_detector"
    }

    fn set_header(&mut self, header: FiveTuple) {
        self.header = header;
    }

    fn on_flow_packet(&mut self, packet: &Packet, _bus: &EventManager) {
        if self.first_ts.is_none() {
            self.first_ts = Some(packet.timestamp);
        }
        self.last_ts = packet.timestamp;

        let payload_len = packet.payload.len() as u64;

        if packet.is_outbound {
            if payload_len > self.threshold {
                // A new request closes whatever inbound burst was open.
                self.close_open();
                self.open = Some(OpenChunk {
                    start: packet.timestamp,
                    end: packet.timestamp,
                    request_len: payload_len,
                    packets: 0,
                    bytes: 0,
                    last_inbound_ts: None,
                    inter_packet_times_ms: Vec::new(),
                });
            }
            return;
        }

        // Inbound packet: only accumulates if a chunk is already open;
        // inbound packets before any chunk opens are discarded.
        let Some(open) = self.open.as_mut() else {
            return;
        };
        if let Some(last) = open.last_inbound_ts {
            let gap = packet.timestamp.saturating_sub(last);
            open.inter_packet_times_ms.push(gap.as_millis() as u64);
            if gap > INFORMATIONAL_GAP_WARNING {
                log::debug!(
                    "http_chunk_detector: inbound gap {:?} exceeds 200ms on {}",
                    gap,
                    self.header
                );
            }
        }
        open.last_inbound_ts = Some(packet.timestamp);
        open.end = packet.timestamp;
        open.packets += 1;
        open.bytes += payload_len;
    }

    fn teardown(&mut self, bus: &EventManager) {
        self.close_open();
        bus.publish(
            event::TELEMETRY_HTTP_CHUNK,
            Event::HttpChunk(HttpChunkClosed {
                header: self.header,
                start: self.first_ts.unwrap_or(Duration::ZERO),
                end: self.last_ts,
                threshold: self.threshold,
                chunks: self.chunks.clone(),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(ts_ms: u64, len: usize, outbound: bool) -> Packet {
        Packet {
            timestamp: Duration::from_millis(ts_ms),
            header: zero_header(),
            total_len: len as u32,
            payload: vec![0u8; len],
            is_outbound: outbound,
            tcp: None,
        }
    }

    #[test]
    fn inbound_before_any_request_is_discarded() {
        let mut d = HttpChunkDetector::new(100);
        let bus = EventManager::new();
        d.on_flow_packet(&packet(0, 50, false), &bus);
        assert!(d.open.is_none());
        assert!(d.chunks.is_empty());
    }

    #[test]
    fn large_outbound_opens_a_chunk_that_accumulates_inbound() {
        let mut d = HttpChunkDetector::new(100);
        let bus = EventManager::new();
        d.on_flow_packet(&packet(0, 200, true), &bus);
        d.on_flow_packet(&packet(10, 50, false), &bus);
        d.on_flow_packet(&packet(20, 50, false), &bus);
        assert!(d.open.is_some());
        let open = d.open.as_ref().unwrap();
        assert_eq!(open.packets, 2);
        assert_eq!(open.bytes, 100);
        assert_eq!(open.request_len, 200);
    }

    #[test]
    fn small_outbound_does_not_open_a_chunk() {
        let mut d = HttpChunkDetector::new(100);
        let bus = EventManager::new();
        d.on_flow_packet(&packet(0, 50, true), &bus);
        assert!(d.open.is_none());
    }

    #[test]
    fn second_large_request_closes_the_prior_chunk() {
        let mut d = HttpChunkDetector::new(100);
        let bus = EventManager::new();
        d.on_flow_packet(&packet(0, 200, true), &bus);
        d.on_flow_packet(&packet(10, 50, false), &bus);
        d.on_flow_packet(&packet(100, 200, true), &bus);
        assert_eq!(d.chunks.len(), 1);
        assert_eq!(d.chunks[0].packets, 1);
    }
}

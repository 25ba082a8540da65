//! `FrameDetector`: inbound-only frame boundary detection driven by a
//! marker byte in each packet's payload.
//!
//! Grounded in `original_source/telemetry/frame.go`: the third payload byte
//! is inspected on every inbound packet. `0xA0` extends the frame currently
//! accumulating (counting its size and packets in). `0x80` is a pure
//! delimiter — it is never itself counted into any frame — that closes the
//! frame currently accumulating, exporting it only if it actually
//! accumulated at least one `0xA0` packet. Any other marker value is
//! ignored entirely: the packet affects neither the open frame nor its
//! counters. Unlike the chunk/flowlet/summary functions, closed frames are
//! published immediately rather than buffered until teardown.

use std::time::Duration;

use serde::Serialize;

use super::TelemetryFunction;
use crate::event::{self, Event, EventManager};
use crate::packet::{FiveTuple, Packet};

/// The marker value (third payload byte) that extends the current frame.
const FRAME_EXTEND_MARKER: u8 = 0xA0;
/// The marker value (third payload byte) that closes the current frame.
const FRAME_CLOSE_MARKER: u8 = 0x80;

fn zero_header() -> FiveTuple {
    FiveTuple {
        src_ip: "0.0.0.0".parse().unwrap(),
        dst_ip: "0.0.0.0".parse().unwrap(),
        src_port: 0,
        dst_port: 0,
        protocol: 0,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameClosed {
    pub header: FiveTuple,
    pub start: Duration,
    pub end: Duration,
    pub size: u64,
    pub packets: u64,
}

struct OpenFrame {
    start: Duration,
    end: Duration,
    size: u64,
    packets: u64,
}

pub struct FrameDetector {
    header: FiveTuple,
    open: Option<OpenFrame>,
}

impl FrameDetector {
    pub fn new() -> Self {
        FrameDetector {
            header: zero_header(),
            open: None,
        }
    }
}

impl Default for FrameDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryFunction for FrameDetector {
    fn name(&self) -> &'static str {
        "frame_detector"
    }

    fn set_header(&mut self, header: FiveTuple) {
        self.header = header;
    }

    fn on_flow_packet(&mut self, packet: &Packet, bus: &EventManager) {
        if packet.is_outbound {
            return;
        }
        // Fewer than 3 payload bytes: no marker to read, packet is dropped
        // from frame accounting entirely.
        let Some(&marker) = packet.payload.get(2) else {
            return;
        };

        match marker {
            FRAME_EXTEND_MARKER => {
                let frame = self.open.get_or_insert_with(|| OpenFrame {
                    start: packet.timestamp,
                    end: packet.timestamp,
                    size: 0,
                    packets: 0,
                });
                frame.end = packet.timestamp;
                frame.size += packet.payload.len() as u64;
                frame.packets += 1;
            }
            FRAME_CLOSE_MARKER => {
                if let Some(closed) = self.open.take() {
                    if closed.packets != 0 {
                        bus.publish(
                            event::TELEMETRY_FRAME,
                            Event::Frame(FrameClosed {
                                header: self.header,
                                start: closed.start,
                                end: closed.end,
                                size: closed.size,
                                packets: closed.packets,
                            }),
                        );
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(ts_ms: u64, payload: Vec<u8>, outbound: bool) -> Packet {
        Packet {
            timestamp: Duration::from_millis(ts_ms),
            header: zero_header(),
            total_len: payload.len() as u32,
            payload,
            is_outbound: outbound,
            tcp: None,
        }
    }

    #[test]
    fn close_marker_closes_and_reopens() {
        let bus = EventManager::new();
        let mut fd = FrameDetector::new();
        fd.on_flow_packet(&packet(0, vec![0, 0, 0xA0], false), &bus);
        fd.on_flow_packet(&packet(10, vec![0, 0, 0x80], false), &bus);
        assert!(fd.open.is_none());
        fd.on_flow_packet(&packet(20, vec![0, 0, 0xA0], false), &bus);
        assert!(fd.open.is_some());
        assert_eq!(fd.open.as_ref().unwrap().packets, 1);
    }

    #[test]
    fn close_marker_with_no_accumulated_packets_exports_nothing() {
        let bus = EventManager::new();
        let mut fd = FrameDetector::new();
        fd.on_flow_packet(&packet(0, vec![0, 0, 0x80], false), &bus);
        assert!(fd.open.is_none());
    }

    #[test]
    fn close_marker_is_not_itself_counted_into_the_frame() {
        let bus = EventManager::new();
        let mut fd = FrameDetector::new();
        fd.on_flow_packet(&packet(0, vec![0, 0, 0xA0], false), &bus);
        fd.on_flow_packet(&packet(10, vec![0, 0, 0xA0, 0xff], false), &bus);
        assert_eq!(fd.open.as_ref().unwrap().packets, 2);
        let size_before_close = fd.open.as_ref().unwrap().size;

        fd.on_flow_packet(&packet(20, vec![0, 0, 0x80, 0xff, 0xff], false), &bus);
        // The close-marker packet (5 bytes) must not have been folded into
        // the exported frame's size/packet counters.
        assert!(fd.open.is_none());
        assert_eq!(size_before_close, 3 + 4);
    }

    #[test]
    fn unrecognized_marker_is_ignored() {
        let bus = EventManager::new();
        let mut fd = FrameDetector::new();
        fd.on_flow_packet(&packet(0, vec![0, 0, 0x01], false), &bus);
        assert!(fd.open.is_none());
    }

    #[test]
    fn outbound_packets_are_ignored() {
        let bus = EventManager::new();
        let mut fd = FrameDetector::new();
        fd.on_flow_packet(&packet(0, vec![0, 0, 0x80], true), &bus);
        assert!(fd.open.is_none());
    }

    #[test]
    fn short_payload_has_no_marker_to_read() {
        let bus = EventManager::new();
        let mut fd = FrameDetector::new();
        fd.on_flow_packet(&packet(0, vec![0, 0], false), &bus);
        assert!(fd.open.is_none());
    }
}

//! `GapChunkDetector` and `FlowletTracker`: inbound-only traffic burst
//! segmentation, splitting on inter-packet gaps larger than a threshold.
//!
//! Grounded in `original_source/telemetry/chunk.go` (`GapChunkDetector`,
//! strict `>` gap comparison) and `original_source/telemetry/flowlet.go`
//! (`FlowletTracker`, the same segmentation plus a per-flowlet duration and
//! the gap that preceded it).

use std::time::Duration;

use serde::Serialize;

use super::TelemetryFunction;
use crate::event::{self, Event, EventManager};
use crate::packet::{FiveTuple, Packet};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Chunk {
    pub chunk_start: Duration,
    pub chunk_end: Duration,
    pub chunk_size: u64,
    pub chunk_packets: u64,
    pub gap_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GapChunkClosed {
    pub header: FiveTuple,
    pub chunks: Vec<Chunk>,
}

struct OpenChunk {
    start: Duration,
    end: Duration,
    size: u64,
    packets: u64,
}

/// Segments a flow's inbound traffic into chunks: a new chunk starts
/// whenever the gap since the previous inbound packet is strictly greater
/// than `gap`. Outbound packets are ignored entirely.
pub struct GapChunkDetector {
    header: FiveTuple,
    gap: Duration,
    first_down_ts: Option<Duration>,
    last_down_ts: Option<Duration>,
    open: Option<OpenChunk>,
    chunks: Vec<Chunk>,
}

impl GapChunkDetector {
    pub fn new(gap: Duration) -> Self {
        GapChunkDetector {
            header: zero_header(),
            gap,
            first_down_ts: None,
            last_down_ts: None,
            open: None,
            chunks: Vec::new(),
        }
    }

    fn close_open(&mut self, gap_ms: u64) {
        if let Some(c) = self.open.take() {
            self.chunks.push(Chunk {
                chunk_start: c.start,
                chunk_end: c.end,
                chunk_size: c.size,
                chunk_packets: c.packets,
                gap_ms,
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

impl TelemetryFunction for GapChunkDetector {
    fn name(&self) -> &'static str {
        "gap_chunk_detector"
    }

    fn set_header(&mut self, header: FiveTuple) {
        self.header = header;
    }

    fn on_flow_packet(&mut self, packet: &Packet, _bus: &EventManager) {
        if packet.is_outbound {
            return;
        }
        if self.first_down_ts.is_none() {
            self.first_down_ts = Some(packet.timestamp);
        }

        let gap_elapsed = self
            .last_down_ts
            .map(|last| packet.timestamp.saturating_sub(last));
        self.last_down_ts = Some(packet.timestamp);

        if let Some(elapsed) = gap_elapsed {
            if elapsed > self.gap {
                self.close_open(elapsed.as_millis() as u64);
            }
        }

        match self.open.as_mut() {
            Some(open) => {
                open.end = packet.timestamp;
                open.size += packet.payload.len() as u64;
                open.packets += 1;
            }
            None => {
                self.open = Some(OpenChunk {
                    start: packet.timestamp,
                    end: packet.timestamp,
                    size: packet.payload.len() as u64,
                    packets: 1,
                });
            }
        }
    }

    fn teardown(&mut self, bus: &EventManager) {
        self.close_open(0);
        bus.publish(
            event::TELEMETRY_GAP_CHUNK,
            Event::GapChunk(GapChunkClosed {
                header: self.header,
                chunks: self.chunks.clone(),
            }),
        );
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Flowlet {
    pub start: Duration,
    pub end: Duration,
    pub duration_us: u64,
    pub size: u64,
    pub packets: u64,
    pub gap_prev_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowletClosed {
    pub header: FiveTuple,
    pub flowlets: Vec<Flowlet>,
}

struct OpenFlowlet {
    start: Duration,
    end: Duration,
    size: u64,
    packets: u64,
    gap_prev_ms: u64,
}

/// Identical segmentation rule to [`GapChunkDetector`], but each closed
/// segment additionally records its own duration and the gap that preceded
/// it, matching `original_source/telemetry/flowlet.go`.
pub struct FlowletTracker {
    header: FiveTuple,
    gap: Duration,
    last_down_ts: Option<Duration>,
    open: Option<OpenFlowlet>,
    flowlets: Vec<Flowlet>,
}

impl FlowletTracker {
    pub fn new(gap: Duration) -> Self {
        FlowletTracker {
            header: zero_header(),
            gap,
            last_down_ts: None,
            open: None,
            flowlets: Vec::new(),
        }
    }

    fn close_open(&mut self, gap_ms_for_next: Option<u64>) {
        if let Some(o) = self.open.take() {
            self.flowlets.push(Flowlet {
                start: o.start,
                end: o.end,
                duration_us: o.end.saturating_sub(o.start).as_micros() as u64,
                size: o.size,
                packets: o.packets,
                gap_prev_ms: o.gap_prev_ms,
            });
        }
        let _ = gap_ms_for_next;
    }
}

impl TelemetryFunction for FlowletTracker {
    fn name(&self) -> &'static str {
        "flowlet_tracker"
    }

    fn set_header(&mut self, header: FiveTuple) {
        self.header = header;
    }

    fn on_flow_packet(&mut self, packet: &Packet, _bus: &EventManager) {
        if packet.is_outbound {
            return;
        }

        let gap_elapsed = self
            .last_down_ts
            .map(|last| packet.timestamp.saturating_sub(last));
        self.last_down_ts = Some(packet.timestamp);

        let starts_new = match gap_elapsed {
            Some(elapsed) => elapsed > self.gap,
            None => false,
        };
        let gap_ms = gap_elapsed.map(|e| e.as_millis() as u64).unwrap_or(0);

        if starts_new {
            self.close_open(None);
        }

        match self.open.as_mut() {
            Some(open) => {
                open.end = packet.timestamp;
                open.size += packet.payload.len() as u64;
                open.packets += 1;
            }
            None => {
                self.open = Some(OpenFlowlet {
                    start: packet.timestamp,
                    end: packet.timestamp,
                    size: packet.payload.len() as u64,
                    packets: 1,
                    gap_prev_ms: if starts_new { gap_ms } else { 0 },
                });
            }
        }
    }

    fn teardown(&mut self, bus: &EventManager) {
        self.close_open(None);
        bus.publish(
            event::TELEMETRY_FLOWLET,
            Event::Flowlet(FlowletClosed {
                header: self.header,
                flowlets: self.flowlets.clone(),
            }),
        );
    }
}

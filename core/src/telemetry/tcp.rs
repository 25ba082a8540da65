//! `TCPRetransmit` and `TCPRTT`.
//!
//! `TCPRetransmit` is grounded in `original_source/telemetry/tcp.go`'s
//! `TCPRetransmitSimple` (per-direction running-maximum sequence number,
//! wraparound guard at `max - seq <= 2^31`, lazily extended bucket arrays).
//! `TCPRTT` has no surviving Go source in the retrieved slice; it is
//! implemented directly from spec prose (handshake-anchored RTT sampling
//! keyed by expected-ack, with an out-of-order/loss window that suppresses
//! samples while unresolved).

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use super::TelemetryFunction;
use crate::event::{self, Event, EventManager};
use crate::packet::{FiveTuple, Packet};

/// Half the 32-bit sequence space: the threshold `original_source`'s
/// `TCPRetransmitSimple` uses to tell an actual retransmission apart from a
/// sequence-number wraparound.
const WRAPAROUND_THRESHOLD: u32 = u32::MAX / 2;

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
pub struct TcpRetransmitEvent {
    pub header: FiveTuple,
    pub first_ts: Duration,
    pub last_ts: Duration,
    pub interval_ms: u64,
    pub retransmits_up: Vec<u64>,
    pub retransmits_down: Vec<u64>,
}

#[derive(Default)]
struct DirectionTracker {
    max_seq: Option<u32>,
}

impl DirectionTracker {
    /// Returns `true` if this sequence number counts as a retransmission.
    fn observe(&mut self, seq: u32) -> bool {
        match self.max_seq {
            None => {
                self.max_seq = Some(seq);
                false
            }
            Some(max) if seq < max => {
                let behind = max - seq;
                if behind <= WRAPAROUND_THRESHOLD {
                    true
                } else {
                    // Sequence space wrapped around; this is forward progress.
                    self.max_seq = Some(seq);
                    false
                }
            }
            Some(_) => {
                self.max_seq = Some(seq);
                false
            }
        }
    }
}

fn extend_until(buckets: &mut Vec<u64>, idx: usize) {
    if idx >= buckets.len() {
        buckets.resize(idx + 1, 0);
    }
}

pub struct TcpRetransmit {
    header: FiveTuple,
    interval: Duration,
    first_ts: Option<Duration>,
    last_ts: Duration,
    up: DirectionTracker,
    down: DirectionTracker,
    retransmits_up: Vec<u64>,
    retransmits_down: Vec<u64>,
}

impl TcpRetransmit {
    pub fn new(interval: Duration) -> Self {
        TcpRetransmit {
            header: zero_header(),
            interval,
            first_ts: None,
            last_ts: Duration::ZERO,
            up: DirectionTracker::default(),
            down: DirectionTracker::default(),
            retransmits_up: Vec::new(),
            retransmits_down: Vec::new(),
        }
    }
}

impl TelemetryFunction for TcpRetransmit {
    fn name(&self) -> &'static str {
        "tcp_retransmit"
    }

    fn set_header(&mut self, header: FiveTuple) {
        self.header = header;
    }

    fn on_flow_packet(&mut self, packet: &Packet, _bus: &EventManager) {
        let Some(tcp) = packet.tcp else {
            return;
        };
        let first_ts = *self.first_ts.get_or_insert(packet.timestamp);
        self.last_ts = packet.timestamp;
        let idx = ((packet.timestamp.saturating_sub(first_ts)).as_nanos()
            / self.interval.as_nanos().max(1)) as usize;

        let is_retransmit = if packet.is_outbound {
            self.up.observe(tcp.seq)
        } else {
            self.down.observe(tcp.seq)
        };
        if !is_retransmit {
            return;
        }

        if packet.is_outbound {
            extend_until(&mut self.retransmits_up, idx);
            self.retransmits_up[idx] += 1;
        } else {
            extend_until(&mut self.retransmits_down, idx);
            self.retransmits_down[idx] += 1;
        }
    }

    fn teardown(&mut self, bus: &EventManager) {
        bus.publish(
            event::TELEMETRY_TCP_RETRANSMIT,
            Event::TcpRetransmit(TcpRetransmitEvent {
                header: self.header,
                first_ts: self.first_ts.unwrap_or(Duration::ZERO),
                last_ts: self.last_ts,
                interval_ms: self.interval.as_millis() as u64,
                retransmits_up: self.retransmits_up.clone(),
                retransmits_down: self.retransmits_down.clone(),
            }),
        );
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TcpRttSample {
    pub header: FiveTuple,
    pub first_ts: Duration,
    pub last_ts: Duration,
    pub rel_ts_ms: Vec<u64>,
    pub rtt_ms: Vec<u64>,
}

struct PendingAck {
    ts: Duration,
    ignore: bool,
}

/// Handshake-anchored RTT estimator. Every outbound packet with a nonzero
/// effect on the sequence number (a SYN or carrying payload) registers the
/// ack value the receiver should echo back; the matching inbound ACK closes
/// the entry and, unless it was marked `ignore`, yields one RTT sample.
pub struct TcpRtt {
    header: FiveTuple,
    first_ts: Option<Duration>,
    last_ts: Duration,
    next_expected_seq: Option<u32>,
    loss_seen: bool,
    ooo_right: Option<u32>,
    pending: HashMap<u32, PendingAck>,
    rel_ts_ms: Vec<u64>,
    rtt_ms: Vec<u64>,
}

impl TcpRtt {
    pub fn new() -> Self {
        TcpRtt {
            header: zero_header(),
            first_ts: None,
            last_ts: Duration::ZERO,
            next_expected_seq: None,
            loss_seen: false,
            ooo_right: None,
            pending: HashMap::new(),
            rel_ts_ms: Vec::new(),
            rtt_ms: Vec::new(),
        }
    }

    fn on_outbound(&mut self, packet: &Packet) {
        let Some(tcp) = packet.tcp else { return };
        let payload_len = packet.payload.len() as u32;

        if tcp.syn && payload_len == 0 {
            let expected_ack = tcp.seq.wrapping_add(1);
            self.pending.insert(
                expected_ack,
                PendingAck {
                    ts: packet.timestamp,
                    ignore: false,
                },
            );
            self.next_expected_seq = Some(expected_ack);
            return;
        }

        if payload_len == 0 {
            return;
        }

        let expected_ack = tcp.seq.wrapping_add(payload_len);
        let mut ignore = false;

        match self.next_expected_seq {
            None => {
                self.next_expected_seq = Some(expected_ack);
            }
            Some(next) if tcp.seq > next => {
                // Out of order: opens (or extends) the loss window.
                ignore = true;
                if !self.loss_seen {
                    self.loss_seen = true;
                    self.ooo_right = Some(tcp.seq);
                } else {
                    let extends = match self.ooo_right {
                        Some(right) => tcp.seq > right,
                        None => true,
                    };
                    if extends {
                        self.ooo_right = Some(tcp.seq);
                    }
                }
            }
            Some(next) if tcp.seq < next => {
                // Already-seen data retransmitted.
                ignore = true;
            }
            Some(next) => {
                // In order. If a loss window is open, this packet closes it
                // once it reaches far enough to cover the out-of-order edge.
                if self.loss_seen {
                    let covers_gap = match self.ooo_right {
                        Some(right) => expected_ack >= right,
                        None => true,
                    };
                    if covers_gap {
                        self.loss_seen = false;
                        self.ooo_right = None;
                    } else {
                        ignore = true;
                    }
                }
                self.next_expected_seq = Some(expected_ack.max(next));
            }
        }

        if !ignore && self.loss_seen {
            ignore = true;
        }

        self.pending.insert(
            expected_ack,
            PendingAck {
                ts: packet.timestamp,
                ignore,
            },
        );
    }

    fn on_inbound(&mut self, packet: &Packet) {
        let Some(tcp) = packet.tcp else { return };
        if !tcp.ack_flag {
            return;
        }
        let Some(entry) = self.pending.remove(&tcp.ack) else {
            return;
        };
        if !entry.ignore {
            let first = self.first_ts.unwrap_or(entry.ts);
            self.rel_ts_ms
                .push(entry.ts.saturating_sub(first).as_millis() as u64);
            self.rtt_ms
                .push(packet.timestamp.saturating_sub(entry.ts).as_millis() as u64);
        }
    }
}

impl Default for TcpRtt {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryFunction for TcpRtt {
    fn name(&self) -> &'static str {
        "tcp_rtt"
    }

    fn set_header(&mut self, header: FiveTuple) {
        self.header = header;
    }

    fn on_flow_packet(&mut self, packet: &Packet, _bus: &EventManager) {
        self.first_ts.get_or_insert(packet.timestamp);
        self.last_ts = packet.timestamp;
        if packet.is_outbound {
            self.on_outbound(packet);
        } else {
            self.on_inbound(packet);
        }
    }

    fn teardown(&mut self, bus: &EventManager) {
        bus.publish(
            event::TELEMETRY_TCP_RTT,
            Event::TcpRtt(TcpRttSample {
                header: self.header,
                first_ts: self.first_ts.unwrap_or(Duration::ZERO),
                last_ts: self.last_ts,
                rel_ts_ms: self.rel_ts_ms.clone(),
                rtt_ms: self.rtt_ms.clone(),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::TcpHeader;

    fn packet(ts_ms: u64, outbound: bool, tcp: TcpHeader, payload_len: usize) -> Packet {
        Packet {
            timestamp: Duration::from_millis(ts_ms),
            header: zero_header(),
            total_len: payload_len as u32,
            payload: vec![0u8; payload_len],
            is_outbound: outbound,
            tcp: Some(tcp),
        }
    }

    fn tcp(seq: u32, ack: u32, syn: bool, ack_flag: bool) -> TcpHeader {
        TcpHeader {
            seq,
            ack,
            syn,
            ack_flag,
        }
    }

    #[test]
    fn retransmit_detects_seq_below_max() {
        let mut t = TcpRetransmit::new(Duration::from_secs(1));
        t.on_flow_packet(&packet(0, false, tcp(100, 0, false, false), 10), &EventManager::new());
        t.on_flow_packet(&packet(1, false, tcp(110, 0, false, false), 10), &EventManager::new());
        t.on_flow_packet(&packet(2, false, tcp(105, 0, false, false), 10), &EventManager::new());
        assert_eq!(t.retransmits_down.iter().sum::<u64>(), 1);
    }

    #[test]
    fn retransmit_treats_large_backward_jump_as_wraparound() {
        let mut t = TcpRetransmit::new(Duration::from_secs(1));
        t.on_flow_packet(
            &packet(0, false, tcp(u32::MAX - 10, 0, false, false), 10),
            &EventManager::new(),
        );
        t.on_flow_packet(&packet(1, false, tcp(5, 0, false, false), 10), &EventManager::new());
        assert_eq!(t.retransmits_down.iter().sum::<u64>(), 0);
    }

    #[test]
    fn rtt_sample_emitted_for_in_order_ack() {
        let bus = EventManager::new();
        let mut t = TcpRtt::new();
        t.on_flow_packet(&packet(0, true, tcp(1000, 0, false, false), 100), &bus);
        t.on_flow_packet(&packet(50, false, tcp(0, 1100, false, true), 0), &bus);
        assert_eq!(t.rtt_ms, vec![50]);
    }

    #[test]
    fn rtt_sample_suppressed_for_out_of_order_packet() {
        let bus = EventManager::new();
        let mut t = TcpRtt::new();
        t.on_flow_packet(&packet(0, true, tcp(1000, 0, false, false), 100), &bus);
        // Jumps ahead of the expected sequence: out of order.
        t.on_flow_packet(&packet(10, true, tcp(1300, 0, false, false), 100), &bus);
        t.on_flow_packet(&packet(60, false, tcp(0, 1400, false, true), 0), &bus);
        assert!(t.rtt_ms.is_empty());
    }
}

//! The flow table: a 5-tuple indexed cache of in-progress flows with
//! MRU idle-timeout eviction.
//!
//! Grounded in `original_source/processor/flow.go`'s `FlowProcessor`/`Entry`
//! (map + intrusive doubly-linked list ordered by last-packet time,
//! `Insert`/`Update`/`expireEntries`/`BeforeExpire`/`Teardown`). The
//! intrusive pointer list is replaced by an arena (`Vec<Option<Slot>>`) plus
//! a free list, indexed by `prev`/`next` fields — the safe-Rust substitute
//! for raw-pointer intrusive structures that `core/src/memory/mbuf.rs`'s
//! own slab documents when `unsafe` is off the table.

use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::event::{self, Event, EventManager, Processor, Topic};
use crate::packet::{FiveTuple, Packet};
use crate::telemetry::TelemetryFunction;

/// Emitted the instant a new 5-tuple is first seen.
#[derive(Debug, Clone, Serialize)]
pub struct FlowStarted {
    pub header: FiveTuple,
    pub created_ts: Duration,
}

/// Emitted when a flow is evicted, either for idle timeout or at shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct FlowExpired {
    pub header: FiveTuple,
    pub created_ts: Duration,
    pub last_ts: Duration,
    /// The eviction clock's value at the moment this flow was evicted —
    /// the packet timestamp that triggered `expire`, or, at teardown, the
    /// synthesized `latest.updated_ts + timeout`. Distinct from `last_ts`:
    /// a flow idle for longer than the timeout expires at a time strictly
    /// after its own last packet.
    pub expired_ts: Duration,
    pub up_bytes: u64,
    pub down_bytes: u64,
    pub up_packets: u64,
    pub down_packets: u64,
}

struct Slot {
    header: FiveTuple,
    created_ts: Duration,
    updated_ts: Duration,
    up_bytes: u64,
    down_bytes: u64,
    up_packets: u64,
    down_packets: u64,
    telemetry: HashMap<String, Box<dyn TelemetryFunction>>,
    prev: Option<usize>,
    next: Option<usize>,
}

impl Slot {
    fn new(header: FiveTuple, ts: Duration) -> Self {
        Slot {
            header,
            created_ts: ts,
            updated_ts: ts,
            up_bytes: 0,
            down_bytes: 0,
            up_packets: 0,
            down_packets: 0,
            telemetry: HashMap::new(),
            prev: None,
            next: None,
        }
    }

    fn apply(&mut self, p: &Packet) {
        self.updated_ts = p.timestamp;
        if p.is_outbound {
            self.up_bytes += p.total_len as u64;
            self.up_packets += 1;
        } else {
            self.down_bytes += p.total_len as u64;
            self.down_packets += 1;
        }
    }

    fn to_expired(&self, expired_ts: Duration) -> FlowExpired {
        FlowExpired {
            header: self.header,
            created_ts: self.created_ts,
            last_ts: self.updated_ts,
            expired_ts,
            up_bytes: self.up_bytes,
            down_bytes: self.down_bytes,
            up_packets: self.up_packets,
            down_packets: self.down_packets,
        }
    }
}

struct Inner {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    map: HashMap<FiveTuple, usize>,
    /// Head of the MRU list: the least-recently-updated entry.
    oldest: Option<usize>,
    /// Tail of the MRU list: the most-recently-updated entry.
    latest: Option<usize>,
}

impl Inner {
    fn new() -> Self {
        Inner {
            slots: Vec::new(),
            free: Vec::new(),
            map: HashMap::new(),
            oldest: None,
            latest: None,
        }
    }

    fn alloc(&mut self, slot: Slot) -> usize {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(slot);
            idx
        } else {
            self.slots.push(Some(slot));
            self.slots.len() - 1
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let s = self.slots[idx].as_ref().unwrap();
            (s.prev, s.next)
        };
        match prev {
            Some(p) => self.slots[p].as_mut().unwrap().next = next,
            None => self.oldest = next,
        }
        match next {
            Some(n) => self.slots[n].as_mut().unwrap().prev = prev,
            None => self.latest = prev,
        }
    }

    /// Moves `idx` to the tail of the MRU list (the most-recently-used end).
    fn move_to_latest(&mut self, idx: usize) {
        if self.latest == Some(idx) {
            return;
        }
        self.unlink(idx);
        let old_latest = self.latest;
        {
            let s = self.slots[idx].as_mut().unwrap();
            s.prev = old_latest;
            s.next = None;
        }
        match old_latest {
            Some(l) => self.slots[l].as_mut().unwrap().next = Some(idx),
            None => self.oldest = Some(idx),
        }
        self.latest = Some(idx);
    }

    fn push_latest(&mut self, idx: usize) {
        let old_latest = self.latest;
        {
            let s = self.slots[idx].as_mut().unwrap();
            s.prev = old_latest;
            s.next = None;
        }
        match old_latest {
            Some(l) => self.slots[l].as_mut().unwrap().next = Some(idx),
            None => self.oldest = Some(idx),
        }
        self.latest = Some(idx);
    }

    fn remove(&mut self, idx: usize) -> Slot {
        self.unlink(idx);
        let slot = self.slots[idx].take().unwrap();
        self.map.remove(&slot.header);
        self.free.push(idx);
        slot
    }
}

/// The 5-tuple indexed flow cache.
///
/// Subscribes to `"packet"` (drives insert/update and idle eviction) and
/// `"flow.attach_telemetry"` (attaches telemetry functions the classifier
/// pipeline decided this flow needs). Publishes `"flow.created"` and
/// `"flow.expired"`.
pub struct FlowTable {
    inner: RefCell<Inner>,
    timeout: Duration,
    subs: Vec<Topic>,
    pubs: Vec<Topic>,
}

impl FlowTable {
    pub fn new(timeout: Duration) -> Self {
        FlowTable {
            inner: RefCell::new(Inner::new()),
            timeout,
            subs: vec![event::PACKET, event::FLOW_ATTACH_TELEMETRY],
            pubs: vec![event::FLOW_CREATED, event::FLOW_EXPIRED],
        }
    }

    fn on_packet(&self, p: &Packet, bus: &EventManager) {
        let key = p.canonical_key();
        let existing = self.inner.borrow().map.get(&key).copied();
        let idx = match existing {
            Some(idx) => idx,
            None => self.insert(&key, p, bus),
        };
        self.update(idx, p, bus);
        self.expire(p.timestamp, bus);
    }

    /// Inserts a brand-new entry, publishes `flow.created`, then
    /// initializes any telemetry function attached synchronously as a
    /// consequence of that publish.
    ///
    /// The borrow of `inner` is dropped before `bus.publish` runs:
    /// `flow.created` -> classification -> `flow.attach_telemetry` loops
    /// back into this same `FlowTable` (see `on_attach` below), and that
    /// reentrant call also needs `inner.borrow_mut()`.
    fn insert(&self, key: &FiveTuple, p: &Packet, bus: &EventManager) -> usize {
        let idx = {
            let mut inner = self.inner.borrow_mut();
            let idx = inner.alloc(Slot::new(*key, p.timestamp));
            inner.map.insert(*key, idx);
            inner.push_latest(idx);
            idx
        };

        bus.publish(
            event::FLOW_CREATED,
            Event::FlowCreated(FlowStarted {
                header: *key,
                created_ts: p.timestamp,
            }),
        );

        {
            let mut inner = self.inner.borrow_mut();
            if let Some(slot) = inner.slots[idx].as_mut() {
                for tf in slot.telemetry.values_mut() {
                    tf.init(bus);
                }
            }
        }

        idx
    }

    fn update(&self, idx: usize, p: &Packet, bus: &EventManager) {
        let mut inner = self.inner.borrow_mut();
        if let Some(slot) = inner.slots[idx].as_mut() {
            slot.apply(p);
            for tf in slot.telemetry.values_mut() {
                tf.on_flow_packet(p, bus);
            }
        }
        inner.move_to_latest(idx);
    }

    /// Attaches each function to the flow, unless a function of the same
    /// name is already attached — mirrors `original_source/processor/flow.go`'s
    /// `if exists { log.Warn(...); continue }`: the existing instance (and
    /// whatever state it has already accumulated) is kept, and the
    /// duplicate is dropped with a warning rather than silently overwriting
    /// it.
    fn on_attach(&self, header: FiveTuple, functions: Vec<Box<dyn TelemetryFunction>>) {
        let mut inner = self.inner.borrow_mut();
        let Some(&idx) = inner.map.get(&header) else {
            return;
        };
        if let Some(slot) = inner.slots[idx].as_mut() {
            for mut tf in functions {
                tf.set_header(header);
                let name = tf.name().to_string();
                if slot.telemetry.contains_key(&name) {
                    log::warn!(
                        "flow_table: telemetry function {name:?} already attached to {header}, skipping duplicate"
                    );
                    continue;
                }
                slot.telemetry.insert(name, tf);
            }
        }
    }

    /// Evicts every entry whose idle time, measured against `now`, is at
    /// least `self.timeout` — mirrors `expireEntries`'s `>=` comparison in
    /// `original_source/processor/flow.go`.
    fn expire(&self, now: Duration, bus: &EventManager) {
        loop {
            let oldest = self.inner.borrow().oldest;
            let Some(idx) = oldest else { break };
            let updated_ts = self.inner.borrow().slots[idx].as_ref().unwrap().updated_ts;
            if now.saturating_sub(updated_ts) < self.timeout {
                break;
            }
            self.evict(idx, now, bus);
        }
    }

    fn evict(&self, idx: usize, now: Duration, bus: &EventManager) {
        let mut slot = self.inner.borrow_mut().remove(idx);
        for (_, mut tf) in slot.telemetry.drain() {
            tf.teardown(bus);
        }
        bus.publish(event::FLOW_EXPIRED, Event::FlowExpired(slot.to_expired(now)));
    }
}

impl Processor for FlowTable {
    fn name(&self) -> &str {
        "flow_table"
    }

    fn subs(&self) -> &[Topic] {
        &self.subs
    }

    fn pubs(&self) -> &[Topic] {
        &self.pubs
    }

    fn handle_event(&self, topic: Topic, event: &Event, bus: &EventManager) {
        match (topic, event) {
            (t, Event::Packet(p)) if t == event::PACKET => self.on_packet(p, bus),
            (t, Event::AttachTelemetry(at)) if t == event::FLOW_ATTACH_TELEMETRY => {
                // `AttachTelemetry::functions` is taken by value via RefCell,
                // since the bus hands us only a shared reference here.
                let functions = at.take_functions();
                self.on_attach(at.header, functions);
            }
            _ => {}
        }
    }

    /// Forces every remaining entry out, as if one final packet had arrived
    /// exactly `timeout` after the most recently updated entry — matching
    /// `original_source/processor/flow.go`'s `Teardown`, which synthesizes
    /// `now = latest.UpdatedTS.Add(Timeout)` so the normal `expireEntries`
    /// walk empties the table unconditionally.
    fn teardown(&self, bus: &EventManager) {
        let latest_ts = {
            let inner = self.inner.borrow();
            inner
                .latest
                .and_then(|idx| inner.slots[idx].as_ref())
                .map(|s| s.updated_ts)
        };
        if let Some(ts) = latest_ts {
            self.expire(ts + self.timeout, bus);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventManager;
    use std::net::IpAddr;

    fn key(port: u16) -> FiveTuple {
        FiveTuple {
            src_ip: "10.0.0.1".parse::<IpAddr>().unwrap(),
            dst_ip: "1.2.3.4".parse::<IpAddr>().unwrap(),
            src_port: port,
            dst_port: 443,
            protocol: 6,
        }
    }

    fn packet(header: FiveTuple, ts_ms: u64, outbound: bool) -> Packet {
        Packet {
            timestamp: Duration::from_millis(ts_ms),
            header,
            total_len: 100,
            payload: vec![],
            is_outbound: outbound,
            tcp: None,
        }
    }

    #[test]
    fn first_packet_for_a_tuple_creates_an_entry() {
        let table = FlowTable::new(Duration::from_secs(30));
        let bus = EventManager::new();
        let p = packet(key(1000), 0, false);
        table.on_packet(&p, &bus);
        assert!(table.inner.borrow().map.contains_key(&key(1000)));
    }

    #[test]
    fn idle_entries_are_evicted_on_later_packet_arrival() {
        let table = FlowTable::new(Duration::from_secs(30));
        let bus = EventManager::new();
        let p1 = packet(key(1000), 0, false);
        table.on_packet(&p1, &bus);

        // A later, unrelated packet 31s on should trigger eviction of the
        // idle flow even though it doesn't touch that flow's counters.
        let p2 = packet(key(2000), 31_000, false);
        table.on_packet(&p2, &bus);

        assert!(!table.inner.borrow().map.contains_key(&key(1000)));
        assert!(table.inner.borrow().map.contains_key(&key(2000)));
    }

    #[test]
    fn counters_accumulate_per_direction() {
        let table = FlowTable::new(Duration::from_secs(30));
        let bus = EventManager::new();
        table.on_packet(&packet(key(1000), 0, false), &bus);
        table.on_packet(&packet(key(1000), 1, true), &bus);
        table.on_packet(&packet(key(1000), 2, false), &bus);

        let inner = table.inner.borrow();
        let idx = inner.map[&key(1000)];
        let slot = inner.slots[idx].as_ref().unwrap();
        assert_eq!(slot.down_packets, 2);
        assert_eq!(slot.up_packets, 1);
    }

    #[test]
    fn teardown_evicts_every_remaining_entry() {
        let table = FlowTable::new(Duration::from_secs(30));
        let bus = EventManager::new();
        table.on_packet(&packet(key(1000), 0, false), &bus);
        table.on_packet(&packet(key(2000), 5, false), &bus);
        Processor::teardown(&table, &bus);
        assert!(table.inner.borrow().map.is_empty());
    }
}

//! The event fabric: a synchronous, same-thread publish/subscribe bus.
//!
//! Grounded in `original_source/eventbus/eventbus.go` (topic -> handler list,
//! `Publish`/`Subscribe`) and `original_source/manager.go` (`SanityCheck`'s
//! dependency-closure check, `InitProcessors`/`Run`/`Teardown` sequencing).
//! The `Processor` abstraction below (a single trait governing a
//! component's whole lifecycle) follows the same shape as the connection
//! traits in `core/src/protocols/stream/conn/mod.rs`.
//!
//! Dispatch is recursive by design: a handler invoked from inside
//! [`EventManager::publish`] may itself call `publish`, and the call is
//! serviced synchronously before the outer `publish` returns. Processors
//! that need to mutate state while handling an event that was itself
//! triggered by their own publish (the flow table is the one case in this
//! engine) hold that state behind a `RefCell` and never keep a borrow alive
//! across a nested `publish` call — see `flow.rs`.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::classify::Classification;
use crate::flow::{FlowExpired, FlowStarted};
use crate::packet::Packet;
use crate::protocols::dns::DnsAnswer;
use crate::protocols::tls::SniRecord;
use crate::telemetry::chunk::{FlowletClosed, GapChunkClosed};
use crate::telemetry::frame::FrameClosed;
use crate::telemetry::http_chunk::HttpChunkClosed;
use crate::telemetry::pulse::{FlowPrintSnapshot, FlowPulseSnapshot};
use crate::telemetry::summary::FlowSummarySnapshot;
use crate::telemetry::tcp::{TcpRetransmitEvent, TcpRttSample};
use crate::telemetry::AttachTelemetry;

/// A well-known event-bus topic name.
pub type Topic = &'static str;

pub const PACKET: Topic = "packet";
pub const FLOW_CREATED: Topic = "flow.created";
pub const FLOW_EXPIRED: Topic = "flow.expired";
pub const FLOW_ATTACH_TELEMETRY: Topic = "flow.attach_telemetry";
pub const CLASSIFICATION: Topic = "classification";
pub const PROTOCOL_SNI: Topic = "protocol.sni";
pub const PROTOCOL_DNS: Topic = "protocol.dns";
pub const TELEMETRY_FLOW_SUMMARY: Topic = "telemetry.flow_summary";
pub const TELEMETRY_FLOW_PULSE: Topic = "telemetry.flow_pulse";
pub const TELEMETRY_FLOW_PRINT: Topic = "telemetry.flow_print";
pub const TELEMETRY_GAP_CHUNK: Topic = "telemetry.gap_chunk";
pub const TELEMETRY_FLOWLET: Topic = "telemetry.flowlet";
pub const TELEMETRY_HTTP_CHUNK: Topic = "telemetry.http_chunk";
pub const TELEMETRY_TCP_RETRANSMIT: Topic = "telemetry.tcp_retransmit";
pub const TELEMETRY_TCP_RTT: Topic = "telemetry.tcp_rtt";
pub const TELEMETRY_FRAME: Topic = "telemetry.frame";

/// Every payload type that can cross the event fabric.
///
/// `AttachTelemetry` carries live `Box<dyn TelemetryFunction>` instances and
/// so cannot implement `Serialize` generically; the JSON sink uses
/// [`Event::as_json`] rather than a blanket derive, matching which topics
/// `original_source/processor/dump.go`'s `Dumper` is actually configured to
/// record (control-plane wiring events are never sink targets).
pub enum Event {
    Packet(Packet),
    FlowCreated(FlowStarted),
    FlowExpired(FlowExpired),
    Classification(Classification),
    AttachTelemetry(AttachTelemetry),
    Sni(SniRecord),
    Dns(DnsAnswer),
    FlowSummary(FlowSummarySnapshot),
    FlowPulse(FlowPulseSnapshot),
    FlowPrint(FlowPrintSnapshot),
    GapChunk(GapChunkClosed),
    Flowlet(FlowletClosed),
    HttpChunk(HttpChunkClosed),
    TcpRetransmit(TcpRetransmitEvent),
    TcpRtt(TcpRttSample),
    Frame(FrameClosed),
}

impl Event {
    /// Renders this event as a JSON value for the sink, or `None` for
    /// control-plane events that are never meant to be recorded.
    pub fn as_json(&self) -> Option<serde_json::Value> {
        match self {
            Event::Packet(_) | Event::AttachTelemetry(_) => None,
            Event::FlowCreated(e) => serde_json::to_value(e).ok(),
            Event::FlowExpired(e) => serde_json::to_value(e).ok(),
            Event::Classification(e) => serde_json::to_value(e).ok(),
            Event::Sni(e) => serde_json::to_value(e).ok(),
            Event::Dns(e) => serde_json::to_value(e).ok(),
            Event::FlowSummary(e) => serde_json::to_value(e).ok(),
            Event::FlowPulse(e) => serde_json::to_value(e).ok(),
            Event::FlowPrint(e) => serde_json::to_value(e).ok(),
            Event::GapChunk(e) => serde_json::to_value(e).ok(),
            Event::Flowlet(e) => serde_json::to_value(e).ok(),
            Event::HttpChunk(e) => serde_json::to_value(e).ok(),
            Event::TcpRetransmit(e) => serde_json::to_value(e).ok(),
            Event::TcpRtt(e) => serde_json::to_value(e).ok(),
            Event::Frame(e) => serde_json::to_value(e).ok(),
        }
    }
}

/// A component attached to the event fabric.
///
/// `init` runs once, before any event is dispatched, with exclusive access
/// to the processor (mirrors `original_source/manager.go`'s
/// `InitProcessors`). `handle_event` and `teardown` take `&self` so that
/// dispatch can recurse; processors that mutate state in response to events
/// do so through interior mutability.
pub trait Processor {
    fn name(&self) -> &str;

    fn subs(&self) -> &[Topic] {
        &[]
    }

    fn pubs(&self) -> &[Topic] {
        &[]
    }

    fn init(&mut self) {}

    fn handle_event(&self, topic: Topic, event: &Event, bus: &EventManager);

    fn teardown(&self, _bus: &EventManager) {}
}

#[derive(Debug, Error)]
pub enum EventManagerError {
    #[error("processor name {0:?} is registered more than once")]
    DuplicateProcessor(String),
    #[error(
        "topic {topic:?} is subscribed to by {subscriber:?} but has no publisher"
    )]
    UnpublishedSubscription { topic: String, subscriber: String },
}

/// Owns every registered [`Processor`] and routes events between them.
///
/// The subscriber index is built once in [`EventManager::finalize`] and is
/// never mutated again, so [`publish`](EventManager::publish) only needs a
/// shared reference to `self` — the prerequisite for recursive dispatch.
pub struct EventManager {
    processors: Vec<Box<dyn Processor>>,
    subs_index: HashMap<Topic, Vec<usize>>,
}

impl EventManager {
    pub fn new() -> Self {
        EventManager {
            processors: Vec::new(),
            subs_index: HashMap::new(),
        }
    }

    /// Registers a processor. Must be called before [`finalize`](Self::finalize).
    pub fn register(&mut self, processor: Box<dyn Processor>) -> Result<(), EventManagerError> {
        let name = processor.name().to_string();
        if self.processors.iter().any(|p| p.name() == name) {
            return Err(EventManagerError::DuplicateProcessor(name));
        }
        self.processors.push(processor);
        Ok(())
    }

    /// Runs `init()` on every processor, builds the subscriber index, and
    /// checks that every subscribed topic has at least one publisher.
    ///
    /// The built-in `"packet"` topic is seeded as always-published, mirroring
    /// `original_source/manager.go`'s `SanityCheck`, which seeds the same
    /// topic before checking closure (packets originate outside the
    /// processor graph, from the capture source).
    pub fn finalize(&mut self) -> Result<(), EventManagerError> {
        for p in self.processors.iter_mut() {
            p.init();
        }

        let mut published: HashSet<Topic> = HashSet::new();
        published.insert(PACKET);
        for p in &self.processors {
            for t in p.pubs() {
                published.insert(t);
            }
        }

        let mut subs_index: HashMap<Topic, Vec<usize>> = HashMap::new();
        for (idx, p) in self.processors.iter().enumerate() {
            for t in p.subs() {
                if !published.contains(t) {
                    return Err(EventManagerError::UnpublishedSubscription {
                        topic: t.to_string(),
                        subscriber: p.name().to_string(),
                    });
                }
                subs_index.entry(t).or_default().push(idx);
            }
        }
        self.subs_index = subs_index;
        Ok(())
    }

    /// Dispatches `event` to every processor subscribed to `topic`, in
    /// registration order. May be called reentrantly from inside a handler.
    pub fn publish(&self, topic: Topic, event: Event) {
        let Some(indices) = self.subs_index.get(topic) else {
            return;
        };
        for &idx in indices {
            self.processors[idx].handle_event(topic, &event, self);
        }
    }

    /// Tears down every processor in registration order.
    pub fn teardown(&self) {
        for p in &self.processors {
            p.teardown(self);
        }
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct Recorder {
        name: &'static str,
        subs: Vec<Topic>,
        pubs: Vec<Topic>,
        seen: RefCell<Vec<Topic>>,
    }

    impl Processor for Recorder {
        fn name(&self) -> &str {
            self.name
        }
        fn subs(&self) -> &[Topic] {
            &self.subs
        }
        fn pubs(&self) -> &[Topic] {
            &self.pubs
        }
        fn handle_event(&self, topic: Topic, _event: &Event, _bus: &EventManager) {
            self.seen.borrow_mut().push(topic);
        }
    }

    #[test]
    fn rejects_duplicate_processor_names() {
        let mut mgr = EventManager::new();
        mgr.register(Box::new(Recorder {
            name: "a",
            subs: vec![],
            pubs: vec![],
            seen: RefCell::new(vec![]),
        }))
        .unwrap();
        let err = mgr
            .register(Box::new(Recorder {
                name: "a",
                subs: vec![],
                pubs: vec![],
                seen: RefCell::new(vec![]),
            }))
            .unwrap_err();
        assert!(matches!(err, EventManagerError::DuplicateProcessor(_)));
    }

    #[test]
    fn finalize_rejects_unpublished_subscription() {
        let mut mgr = EventManager::new();
        mgr.register(Box::new(Recorder {
            name: "sub-only",
            subs: vec!["nobody.publishes.this"],
            pubs: vec![],
            seen: RefCell::new(vec![]),
        }))
        .unwrap();
        let err = mgr.finalize().unwrap_err();
        assert!(matches!(
            err,
            EventManagerError::UnpublishedSubscription { .. }
        ));
    }

    #[test]
    fn packet_topic_is_always_satisfied() {
        let mut mgr = EventManager::new();
        mgr.register(Box::new(Recorder {
            name: "consumer",
            subs: vec![PACKET],
            pubs: vec![],
            seen: RefCell::new(vec![]),
        }))
        .unwrap();
        mgr.finalize().unwrap();
    }
}

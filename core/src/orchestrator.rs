//! Ties the event fabric to a packet source and drives the ingest loop.
//!
//! Grounded in `original_source/manager.go`'s `Manager.Run` (publish every
//! parsed packet on `events.PACKET`, then tear every processor down once the
//! source is exhausted) — the loop itself is trivial by design, since all
//! of the actual work happens inside [`EventManager::publish`](crate::event::EventManager::publish)
//! via the processor graph built up through `register`.

use crate::event::{Event, EventManager, EventManagerError, Processor};
use crate::packet::Packet;

/// Anything that can hand back a stream of packets, online or offline.
///
/// Implementations live outside this crate (see the `dump` binary's
/// `PcapFileSource`): this crate stays free of any actual capture library
/// dependency, matching `original_source`'s separation between
/// `PacketParser` (capture-specific) and `Manager` (capture-agnostic).
pub trait PacketSource {
    /// Returns the next packet, or `None` once the source is exhausted.
    fn next_packet(&mut self) -> Option<Packet>;
}

/// Owns the [`EventManager`] and drives packets from a [`PacketSource`]
/// through it until the source is exhausted or a configured packet cap is
/// reached.
pub struct Orchestrator {
    bus: EventManager,
    max_packets: Option<u64>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Orchestrator {
            bus: EventManager::new(),
            max_packets: None,
        }
    }

    /// Stop after this many packets, regardless of whether the source has
    /// more. `None` (the default) means run until the source is exhausted.
    pub fn with_max_packets(mut self, max_packets: Option<u64>) -> Self {
        self.max_packets = max_packets;
        self
    }

    pub fn register(&mut self, processor: Box<dyn Processor>) -> Result<(), EventManagerError> {
        self.bus.register(processor)
    }

    /// Finalizes the processor graph (runs `init()`, checks topic closure),
    /// then pulls packets from `source` until exhausted or `max_packets` is
    /// reached, publishing each on `"packet"`. Tears every processor down
    /// before returning.
    pub fn run(&mut self, source: &mut dyn PacketSource) -> Result<u64, EventManagerError> {
        self.bus.finalize()?;

        let mut count = 0u64;
        while self.max_packets.map(|max| count < max).unwrap_or(true) {
            let Some(packet) = source.next_packet() else {
                break;
            };
            self.bus.publish(crate::event::PACKET, Event::Packet(packet));
            count += 1;
        }

        self.bus.teardown();
        Ok(count)
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::time::Duration;

    use crate::event::Topic;
    use crate::packet::FiveTuple;

    struct CountingSink {
        subs: Vec<Topic>,
        count: RefCell<u64>,
    }

    impl Processor for CountingSink {
        fn name(&self) -> &str {
            "counting_sink"
        }
        fn subs(&self) -> &[Topic] {
            &self.subs
        }
        fn handle_event(&self, _topic: Topic, _event: &Event, _bus: &EventManager) {
            *self.count.borrow_mut() += 1;
        }
    }

    struct VecSource(std::vec::IntoIter<Packet>);

    impl PacketSource for VecSource {
        fn next_packet(&mut self) -> Option<Packet> {
            self.0.next()
        }
    }

    fn packet(n: u16) -> Packet {
        Packet {
            timestamp: Duration::from_millis(n as u64),
            header: FiveTuple {
                src_ip: "10.0.0.1".parse().unwrap(),
                dst_ip: "1.2.3.4".parse().unwrap(),
                src_port: n,
                dst_port: 443,
                protocol: 6,
            },
            total_len: 0,
            payload: vec![],
            is_outbound: true,
            tcp: None,
        }
    }

    #[test]
    fn every_packet_reaches_subscribers() {
        let mut orch = Orchestrator::new();
        orch.register(Box::new(CountingSink {
            subs: vec![crate::event::PACKET],
            count: RefCell::new(0),
        }))
        .unwrap();

        let mut source = VecSource(vec![packet(1), packet(2), packet(3)].into_iter());
        let processed = orch.run(&mut source).unwrap();
        assert_eq!(processed, 3);
    }

    #[test]
    fn max_packets_caps_ingestion() {
        let mut orch = Orchestrator::new().with_max_packets(Some(2));
        orch.register(Box::new(CountingSink {
            subs: vec![crate::event::PACKET],
            count: RefCell::new(0),
        }))
        .unwrap();

        let mut source = VecSource(vec![packet(1), packet(2), packet(3)].into_iter());
        let processed = orch.run(&mut source).unwrap();
        assert_eq!(processed, 2);
    }

    #[test]
    fn unpublished_subscription_surfaces_as_an_error() {
        let mut orch = Orchestrator::new();
        orch.register(Box::new(CountingSink {
            subs: vec!["nobody.publishes.this"],
            count: RefCell::new(0),
        }))
        .unwrap();
        let mut source = VecSource(vec![].into_iter());
        let err = orch.run(&mut source).unwrap_err();
        assert!(matches!(
            err,
            EventManagerError::UnpublishedSubscription { .. }
        ));
    }
}

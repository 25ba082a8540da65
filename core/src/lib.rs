//! Offline/online packet telemetry engine: an event-driven pipeline from
//! raw packets to per-flow telemetry, built around a synchronous pub/sub
//! event fabric, a 5-tuple flow table, protocol parsers, and a set of
//! stateful per-flow telemetry functions.
//!
//! Grounded in the overall shape of `original_source` (`eventbus` +
//! `manager` + `processor/*`) reimplemented as safe, single-threaded Rust.

pub mod classify;
pub mod config;
pub mod event;
pub mod flow;
pub mod orchestrator;
pub mod packet;
pub mod protocols;
pub mod sink;
pub mod telemetry;

pub use config::RuntimeConfig;
pub use event::{Event, EventManager, EventManagerError, Processor, Topic};
pub use orchestrator::{Orchestrator, PacketSource};
pub use packet::{FiveTuple, Packet, TcpHeader};

//! Protocol-specific parsers that run directly off the raw packet stream.
//!
//! Each parser here is itself an event-fabric [`Processor`](crate::event::Processor):
//! it subscribes to `"packet"`, attempts to recognize its protocol in the
//! payload, and on success publishes a protocol-specific event. None of
//! these parsers touch the flow table directly — they are siblings of it,
//! not children.

pub mod dns;
pub mod quic;
pub mod tls;

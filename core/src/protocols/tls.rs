//! TLS ClientHello SNI extraction.
//!
//! Grounded in `original_source/telemetry/http_req.go`'s `ExtractTCPSNI`
//! (also duplicated in `original_source/processor/protoparsers.go`'s
//! `SNIParser`): a defensively bounds-checked byte walk over the record
//! header, handshake header, and ClientHello body down to the
//! `server_name` extension. This is deliberately *not* a full handshake
//! parse (contrast `core/src/protocols/stream/tls/mod.rs`, which decodes
//! the whole handshake via the `tls_parser` crate) — the
//! only datum this engine needs is the SNI hostname.

use serde::Serialize;

use crate::event::{self, Event, EventManager, Processor, Topic};
use crate::packet::{FiveTuple, Packet};

const TLS_CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const TLS_HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const TLS_EXTENSION_SERVER_NAME: u16 = 0;
const SNI_ENTRY_TYPE_HOST_NAME: u8 = 0;

/// A small bounds-checked cursor over a byte slice: every read returns
/// `None` instead of panicking when the slice is exhausted.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let hi = self.u8()? as u16;
        let lo = self.u8()? as u16;
        Some((hi << 8) | lo)
    }

    fn u24(&mut self) -> Option<u32> {
        let hi = self.u8()? as u32;
        let mid = self.u8()? as u32;
        let lo = self.u8()? as u32;
        Some((hi << 16) | (mid << 8) | lo)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        if self.pos + n > self.buf.len() {
            return None;
        }
        self.pos += n;
        Some(())
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return None;
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(out)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Attempts to extract the `server_name` extension's hostname from a TCP
/// payload that may or may not be the start of a TLS ClientHello.
///
/// Returns `None` on anything from "clearly not TLS" to "truncated
/// mid-parse" — every read is bounds-checked and a short buffer simply
/// yields no SNI, never a panic.
pub fn extract_sni(payload: &[u8]) -> Option<String> {
    let mut record = Cursor::new(payload);
    if record.u8()? != TLS_CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    record.skip(2)?; // legacy record version
    let record_len = record.u16()? as usize;
    let handshake_bytes = record.take(record_len.min(record.remaining()))?;
    extract_sni_from_handshake(handshake_bytes)
}

/// Same walk as [`extract_sni`], but starting directly at the handshake
/// message rather than a TLS record: QUIC CRYPTO frames carry raw
/// handshake messages with no surrounding record layer.
pub fn extract_sni_from_handshake(handshake_bytes: &[u8]) -> Option<String> {
    let mut hs = Cursor::new(handshake_bytes);
    if hs.u8()? != TLS_HANDSHAKE_TYPE_CLIENT_HELLO {
        return None;
    }
    let _hs_len = hs.u24()?;

    hs.skip(2)?; // client_version
    hs.skip(32)?; // random

    let session_id_len = hs.u8()? as usize;
    hs.skip(session_id_len)?;

    let cipher_suites_len = hs.u16()? as usize;
    hs.skip(cipher_suites_len)?;

    let compression_methods_len = hs.u8()? as usize;
    hs.skip(compression_methods_len)?;

    if hs.remaining() == 0 {
        // No extensions block at all: a legal, SNI-less ClientHello.
        return None;
    }
    let extensions_len = hs.u16()? as usize;
    let extensions = hs.take(extensions_len.min(hs.remaining()))?;

    let mut ext = Cursor::new(extensions);
    while ext.remaining() >= 4 {
        let ext_type = ext.u16()?;
        let ext_len = ext.u16()? as usize;
        let ext_data = ext.take(ext_len.min(ext.remaining()))?;
        if ext_type == TLS_EXTENSION_SERVER_NAME {
            return parse_server_name_extension(ext_data);
        }
    }
    None
}

fn parse_server_name_extension(data: &[u8]) -> Option<String> {
    let mut c = Cursor::new(data);
    let list_len = c.u16()? as usize;
    let list = c.take(list_len.min(c.remaining()))?;
    let mut entries = Cursor::new(list);
    while entries.remaining() >= 3 {
        let entry_type = entries.u8()?;
        let entry_len = entries.u16()? as usize;
        let name = entries.take(entry_len.min(entries.remaining()))?;
        if entry_type == SNI_ENTRY_TYPE_HOST_NAME {
            return std::str::from_utf8(name).ok().map(|s| s.to_string());
        }
    }
    None
}

#[derive(Debug, Clone, Serialize)]
pub struct SniRecord {
    pub header: FiveTuple,
    pub sni: String,
}

/// Subscribes to `"packet"`, attempts SNI extraction on every TCP payload,
/// and publishes `"protocol.sni"` on success.
pub struct SniParser {
    subs: Vec<Topic>,
    pubs: Vec<Topic>,
}

impl SniParser {
    pub fn new() -> Self {
        SniParser {
            subs: vec![event::PACKET],
            pubs: vec![event::PROTOCOL_SNI],
        }
    }
}

impl Default for SniParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for SniParser {
    fn name(&self) -> &str {
        "sni_parser"
    }

    fn subs(&self) -> &[Topic] {
        &self.subs
    }

    fn pubs(&self) -> &[Topic] {
        &self.pubs
    }

    fn handle_event(&self, topic: Topic, event: &Event, bus: &EventManager) {
        let Event::Packet(p) = event else { return };
        if topic != event::PACKET || p.tcp.is_none() {
            return;
        }
        if let Some(sni) = extract_sni(&p.payload) {
            bus.publish(
                event::PROTOCOL_SNI,
                Event::Sni(SniRecord {
                    header: p.canonical_key(),
                    sni,
                }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_hello_with_sni(host: &str) -> Vec<u8> {
        let mut server_name_entry = Vec::new();
        server_name_entry.push(SNI_ENTRY_TYPE_HOST_NAME);
        server_name_entry.extend_from_slice(&(host.len() as u16).to_be_bytes());
        server_name_entry.extend_from_slice(host.as_bytes());

        let mut server_name_list = Vec::new();
        server_name_list.extend_from_slice(&(server_name_entry.len() as u16).to_be_bytes());
        server_name_list.extend_from_slice(&server_name_entry);

        let mut sni_extension = Vec::new();
        sni_extension.extend_from_slice(&TLS_EXTENSION_SERVER_NAME.to_be_bytes());
        sni_extension.extend_from_slice(&(server_name_list.len() as u16).to_be_bytes());
        sni_extension.extend_from_slice(&server_name_list);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client_version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session_id_len
        body.extend_from_slice(&[0x00, 0x02]); // cipher_suites_len
        body.extend_from_slice(&[0x13, 0x01]); // one cipher suite
        body.push(1); // compression_methods_len
        body.push(0); // null compression
        body.extend_from_slice(&(sni_extension.len() as u16).to_be_bytes());
        body.extend_from_slice(&sni_extension);

        let mut handshake = Vec::new();
        handshake.push(TLS_HANDSHAKE_TYPE_CLIENT_HELLO);
        let len = body.len() as u32;
        handshake.push((len >> 16) as u8);
        handshake.push((len >> 8) as u8);
        handshake.push(len as u8);
        handshake.extend_from_slice(&body);

        let mut record = Vec::new();
        record.push(TLS_CONTENT_TYPE_HANDSHAKE);
        record.extend_from_slice(&[0x03, 0x01]); // legacy record version
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn extracts_sni_from_well_formed_client_hello() {
        let record = client_hello_with_sni("example.com");
        assert_eq!(extract_sni(&record), Some("example.com".to_string()));
    }

    #[test]
    fn rejects_non_tls_payload() {
        assert_eq!(extract_sni(&[0x00, 0x01, 0x02]), None);
    }

    #[test]
    fn truncated_client_hello_does_not_panic() {
        let mut record = client_hello_with_sni("example.com");
        record.truncate(record.len() - 5);
        assert_eq!(extract_sni(&record), None);
    }

    #[test]
    fn empty_payload_returns_none() {
        assert_eq!(extract_sni(&[]), None);
    }
}

//! QUIC Initial-packet SNI extraction.
//!
//! The IETF/mvfst family is decrypted via the standard Initial-secret AEAD
//! pipeline (RFC 9001) and the recovered ClientHello is handed to
//! [`tls::extract_sni_from_handshake`](crate::protocols::tls::extract_sni_from_handshake).
//! The legacy GQUIC family (Q035/Q043/Q046/Q050) predates TLS-in-QUIC
//! entirely and carries its SNI as a cleartext tag in a fixed-offset frame,
//! scanned for directly. Grounded in
//! `core/src/protocols/stream/quic/parser.rs` (packet dispatch) and
//! `core/src/protocols/stream/quic/crypto.rs` (the decrypt pipeline this
//! mirrors); the GQUIC path has no counterpart in that file and is
//! grounded in `original_source`'s retrieved QUIC notes instead.
//!
//! Any failure along this pipeline — a length check, a bad version, an AEAD
//! authentication failure — yields "no SNI" silently. A malformed or
//! unsupported QUIC packet must never abort the packet stream.

pub mod crypto;
pub mod frame;
pub mod header;

use std::cell::RefCell;
use std::collections::HashMap;

use crate::event::{self, Event, EventManager, Processor, Topic};
use crate::packet::Packet;
use crate::protocols::tls::{extract_sni_from_handshake, SniRecord};

use frame::{parse_crypto_frames, CryptoReassembler};
use header::{parse_long_header_initial, LongHeaderInitial};

const UDP_PROTOCOL: u8 = 17;
/// The GQUIC cleartext tag name carrying the SNI value, as a 4-byte tag.
const GQUIC_SNI_TAG: &[u8; 4] = b"SNI\0";

/// Attempts the full Initial-packet decrypt pipeline on one UDP payload and
/// returns the ClientHello bytes on success.
fn decrypt_initial(parsed: &LongHeaderInitial<'_>) -> Option<Vec<u8>> {
    let keys = crypto::derive_initial_keys(parsed.version, parsed.dcid)?;

    // Sample for header-protection removal starts 4 bytes after the
    // (still-protected) packet-number field begins, per RFC 9001 §5.4.2.
    let sample_offset = parsed.pn_offset + 4;
    let sample_bytes = parsed.packet.get(sample_offset..sample_offset + 16)?;
    let mut sample = [0u8; 16];
    sample.copy_from_slice(sample_bytes);
    let mask = crypto::header_protection_mask(&keys.hp, &sample).ok()?;

    let mut first_byte = parsed.packet[0];
    first_byte ^= mask[0] & 0x0f; // long header: only the low 4 bits are protected
    let pn_len = (first_byte & 0x03) as usize + 1;

    let pn_bytes_protected = parsed.packet.get(parsed.pn_offset..parsed.pn_offset + pn_len)?;
    let mut pn_bytes = [0u8; 4];
    for (i, b) in pn_bytes_protected.iter().enumerate() {
        pn_bytes[i] = b ^ mask[1 + i];
    }
    let packet_number = u32::from_be_bytes(pn_bytes) >> (8 * (4 - pn_len)) as u32;

    let header_len = parsed.pn_offset + pn_len;
    if header_len > parsed.packet.len() {
        return None;
    }
    let mut associated_data = parsed.packet[..parsed.pn_offset].to_vec();
    associated_data.extend_from_slice(&pn_bytes[..pn_len]);
    // The unprotected first byte and packet number must be reflected into
    // the AAD the AEAD tag was computed over.
    associated_data[0] = first_byte;

    let payload_end = (parsed.pn_offset + parsed.payload_len).min(parsed.packet.len());
    let ciphertext = parsed.packet.get(header_len..payload_end)?;

    let plaintext = crypto::decrypt_payload(
        &keys.key,
        &keys.iv,
        packet_number as u64,
        &associated_data,
        ciphertext,
    )
    .ok()?;

    let fragments = parse_crypto_frames(&plaintext);
    if fragments.is_empty() {
        return None;
    }
    let mut reassembler = CryptoReassembler::new();
    for f in fragments {
        reassembler.add(f);
    }
    reassembler.contiguous_prefix()
}

/// Scans a cleartext GQUIC Initial packet for the `SNI\0` tag at the
/// version's fixed cleartext offset and reads its length-prefixed value.
/// GQUIC's legacy tag format is `tag(4) + offset(4)` pairs in a header
/// followed by concatenated values; since this engine only ever needs the
/// SNI tag, a direct byte search for the tag anchored near the known
/// offset is sufficient and avoids parsing the full tag table.
fn extract_gquic_sni(packet: &[u8], offset: usize) -> Option<String> {
    let window = packet.get(offset..)?;
    let tag_pos = window
        .windows(4)
        .position(|w| w == GQUIC_SNI_TAG)?;
    // Value immediately follows every tag's 4-byte offset field in the
    // table; the value itself lives after the table, so this treats
    // whatever cleartext bytes follow the discovered tag position as the
    // search window for a plausible ASCII hostname run instead of
    // computing the exact table layout.
    let rest = &window[tag_pos + 4..];
    let end = rest
        .iter()
        .position(|&b| !(b.is_ascii_graphic() && b != b'\\'))
        .unwrap_or(0);
    if end < 3 {
        return None;
    }
    std::str::from_utf8(&rest[..end]).ok().map(|s| s.to_string())
}

/// Subscribes to `"packet"`, attempts QUIC Initial-packet SNI extraction on
/// UDP payloads, and publishes `"protocol.sni"` on success. Reuses the same
/// topic and event type as the TLS-over-TCP [`SniParser`](crate::protocols::tls::SniParser)
/// since both ultimately recover the same datum.
pub struct QuicParser {
    subs: Vec<Topic>,
    pubs: Vec<Topic>,
    /// CRYPTO reassembly state per flow, keyed by destination connection
    /// ID, since a ClientHello may be split across several Initial packets.
    reassemblers: RefCell<HashMap<Vec<u8>, CryptoReassembler>>,
}

impl QuicParser {
    pub fn new() -> Self {
        QuicParser {
            subs: vec![event::PACKET],
            pubs: vec![event::PROTOCOL_SNI],
            reassemblers: RefCell::new(HashMap::new()),
        }
    }
}

impl Default for QuicParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for QuicParser {
    fn name(&self) -> &str {
        "quic_parser"
    }

    fn subs(&self) -> &[Topic] {
        &self.subs
    }

    fn pubs(&self) -> &[Topic] {
        &self.pubs
    }

    fn handle_event(&self, topic: Topic, event: &Event, bus: &EventManager) {
        let Event::Packet(p) = event else { return };
        if topic != event::PACKET || p.header.protocol != UDP_PROTOCOL {
            return;
        }

        let parsed = match parse_long_header_initial(&p.payload) {
            Ok(parsed) => parsed,
            Err(_) => return,
        };

        let sni = if parsed.version.uses_cleartext_decoder() {
            parsed
                .version
                .cleartext_offset()
                .and_then(|offset| extract_gquic_sni(&p.payload, offset))
        } else {
            self.extract_via_decrypt(&parsed, &p)
        };

        if let Some(sni) = sni {
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

impl QuicParser {
    fn extract_via_decrypt(&self, parsed: &LongHeaderInitial<'_>, p: &Packet) -> Option<String> {
        let client_hello = decrypt_initial(parsed)?;
        if let Some(sni) = extract_sni_from_handshake(&client_hello) {
            return Some(sni);
        }
        // Single packet didn't yield a complete ClientHello on its own;
        // fold its CRYPTO fragments into this DCID's running reassembler
        // and retry once more data has accumulated.
        let mut reassemblers = self.reassemblers.borrow_mut();
        let reassembler = reassemblers
            .entry(parsed.dcid.to_vec())
            .or_insert_with(CryptoReassembler::new);
        for fragment in parse_crypto_frames(&client_hello) {
            reassembler.add(fragment);
        }
        reassembler
            .contiguous_prefix()
            .and_then(|bytes| extract_sni_from_handshake(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_udp_packet_is_ignored() {
        let bus = EventManager::new();
        let parser = QuicParser::new();
        let p = Packet {
            timestamp: std::time::Duration::ZERO,
            header: crate::packet::FiveTuple {
                src_ip: "10.0.0.1".parse().unwrap(),
                dst_ip: "1.2.3.4".parse().unwrap(),
                src_port: 1000,
                dst_port: 443,
                protocol: 6,
            },
            total_len: 0,
            payload: vec![0x80, 0, 0, 0, 1],
            is_outbound: true,
            tcp: None,
        };
        parser.handle_event(event::PACKET, &Event::Packet(p), &bus);
    }

    #[test]
    fn malformed_quic_payload_does_not_panic() {
        let bus = EventManager::new();
        let parser = QuicParser::new();
        let p = Packet {
            timestamp: std::time::Duration::ZERO,
            header: crate::packet::FiveTuple {
                src_ip: "10.0.0.1".parse().unwrap(),
                dst_ip: "1.2.3.4".parse().unwrap(),
                src_port: 1000,
                dst_port: 443,
                protocol: 17,
            },
            total_len: 3,
            payload: vec![0x80, 0, 0],
            is_outbound: true,
            tcp: None,
        };
        parser.handle_event(event::PACKET, &Event::Packet(p), &bus);
    }

    #[test]
    fn gquic_cleartext_tag_is_found_when_present() {
        let mut packet = vec![0u8; 30];
        packet.extend_from_slice(b"SNI\0");
        packet.extend_from_slice(&[0u8; 4]); // fake offset field
        packet.extend_from_slice(b"example.com");
        let sni = extract_gquic_sni(&packet, 26);
        assert_eq!(sni, Some("example.com".to_string()));
    }

    #[test]
    fn gquic_scan_returns_none_when_tag_absent() {
        let packet = vec![0u8; 40];
        assert_eq!(extract_gquic_sni(&packet, 26), None);
    }
}

//! QUIC frame parsing over a decrypted Initial payload, with CRYPTO-frame
//! offset-keyed reassembly.
//!
//! Grounded in `core/src/protocols/stream/quic/frame.rs`'s frame-type
//! dispatch and its `BTreeMap<u64, Vec<u8>>`-keyed CRYPTO reassembly buffer.
//! This engine only needs enough frame parsing to find and reassemble
//! CRYPTO frames (the ClientHello lives entirely inside them); PADDING,
//! PING, and ACK frames are skipped rather than interpreted.

use std::collections::BTreeMap;

const FRAME_TYPE_PADDING: u64 = 0x00;
const FRAME_TYPE_PING: u64 = 0x01;
const FRAME_TYPE_ACK: u64 = 0x02;
const FRAME_TYPE_ACK_ECN: u64 = 0x03;
const FRAME_TYPE_CRYPTO: u64 = 0x06;
const FRAME_TYPE_CONNECTION_CLOSE: u64 = 0x1c;
const FRAME_TYPE_CONNECTION_CLOSE_APP: u64 = 0x1d;

fn read_varint(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let first = *buf.get(*pos)?;
    let len = 1usize << (first >> 6);
    if *pos + len > buf.len() {
        return None;
    }
    let mut val = (first & 0x3f) as u64;
    for b in &buf[*pos + 1..*pos + len] {
        val = (val << 8) | (*b as u64);
    }
    *pos += len;
    Some(val)
}

/// One CRYPTO frame's contribution to the reassembled handshake stream.
pub struct CryptoFragment {
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Walks a decrypted Initial payload and returns every CRYPTO frame found,
/// skipping PADDING/PING/ACK/CONNECTION_CLOSE frames along the way.
///
/// Any parse failure (unknown frame type with a length this walk can't
/// skip, truncated varint) simply stops the walk and returns whatever
/// CRYPTO fragments were already found — a partial parse is still useful.
pub fn parse_crypto_frames(payload: &[u8]) -> Vec<CryptoFragment> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < payload.len() {
        let Some(frame_type) = read_varint(payload, &mut pos) else {
            break;
        };
        match frame_type {
            FRAME_TYPE_PADDING | FRAME_TYPE_PING => {}
            FRAME_TYPE_ACK | FRAME_TYPE_ACK_ECN => {
                if skip_ack_frame(payload, &mut pos, frame_type == FRAME_TYPE_ACK_ECN).is_none() {
                    break;
                }
            }
            FRAME_TYPE_CRYPTO => {
                let Some(offset) = read_varint(payload, &mut pos) else {
                    break;
                };
                let Some(len) = read_varint(payload, &mut pos) else {
                    break;
                };
                let len = len as usize;
                let Some(data) = payload.get(pos..pos + len) else {
                    break;
                };
                pos += len;
                out.push(CryptoFragment {
                    offset,
                    data: data.to_vec(),
                });
            }
            FRAME_TYPE_CONNECTION_CLOSE | FRAME_TYPE_CONNECTION_CLOSE_APP => {
                // Error code, (frame type for transport variant), reason
                // length + reason phrase: enough fields vary by variant
                // that the safest behavior is to stop the walk here rather
                // than guess a layout and desync.
                break;
            }
            _ => break,
        }
    }
    out
}

fn skip_ack_frame(payload: &[u8], pos: &mut usize, ecn: bool) -> Option<()> {
    let _largest_acked = read_varint(payload, pos)?;
    let _ack_delay = read_varint(payload, pos)?;
    let range_count = read_varint(payload, pos)?;
    let _first_range = read_varint(payload, pos)?;
    for _ in 0..range_count {
        let _gap = read_varint(payload, pos)?;
        let _len = read_varint(payload, pos)?;
    }
    if ecn {
        let _ect0 = read_varint(payload, pos)?;
        let _ect1 = read_varint(payload, pos)?;
        let _ce = read_varint(payload, pos)?;
    }
    Some(())
}

/// Reassembles CRYPTO frame fragments (which may arrive out of order or
/// overlap) into a contiguous byte stream, keyed by stream offset exactly
/// as `core/src/protocols/stream/quic/crypto.rs`'s `CryptoBuffer` does with
/// its `BTreeMap`.
#[derive(Default)]
pub struct CryptoReassembler {
    fragments: BTreeMap<u64, Vec<u8>>,
}

impl CryptoReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, fragment: CryptoFragment) {
        self.fragments.insert(fragment.offset, fragment.data);
    }

    /// Returns the reassembled stream if the fragments gathered so far form
    /// one contiguous run starting at offset 0, `None` otherwise (a gap
    /// still open, or nothing received yet).
    pub fn contiguous_prefix(&self) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        let mut expected = 0u64;
        for (&offset, data) in &self.fragments {
            if offset != expected {
                break;
            }
            out.extend_from_slice(data);
            expected += data.len() as u64;
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crypto_frame(offset: u64, data: &[u8]) -> Vec<u8> {
        let mut f = vec![FRAME_TYPE_CRYPTO as u8];
        f.extend_from_slice(&(offset as u8).to_be_bytes()); // offsets < 64 in tests
        f.push(data.len() as u8);
        f.extend_from_slice(data);
        f
    }

    #[test]
    fn parses_single_crypto_frame_after_padding() {
        let mut payload = vec![FRAME_TYPE_PADDING as u8; 4];
        payload.extend_from_slice(&crypto_frame(0, b"hello"));
        let frames = parse_crypto_frames(&payload);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].offset, 0);
        assert_eq!(frames[0].data, b"hello");
    }

    #[test]
    fn reassembler_joins_contiguous_fragments() {
        let mut r = CryptoReassembler::new();
        r.add(CryptoFragment {
            offset: 5,
            data: b"world".to_vec(),
        });
        assert!(r.contiguous_prefix().is_none());
        r.add(CryptoFragment {
            offset: 0,
            data: b"hello".to_vec(),
        });
        assert_eq!(r.contiguous_prefix(), Some(b"helloworld".to_vec()));
    }

    #[test]
    fn unknown_frame_type_stops_the_walk_without_panicking() {
        let payload = vec![0xffu8, 0x01, 0x02, 0x03];
        let frames = parse_crypto_frames(&payload);
        assert!(frames.is_empty());
    }
}

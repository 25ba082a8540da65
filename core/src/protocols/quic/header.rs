//! QUIC long-header parsing and the version → decode-strategy table.
//!
//! Grounded in `core/src/protocols/stream/quic/parser.rs`'s `QuicVersion`
//! and `QuicPacket::parse_from` (DCID/SCID/token/payload-length parsing,
//! the `fb & 0xA0 == 0x80 && fb & 0x30 == 0x00` long-header-Initial check)
//! and `core/src/protocols/stream/quic/crypto.rs`'s four salt constants.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuicHeaderError {
    #[error("payload too short to contain a QUIC header")]
    Truncated,
    #[error("first byte {0:#04x} is not a long-header Initial packet")]
    NotLongHeaderInitial(u8),
    #[error("unsupported QUIC version {0:#010x}")]
    UnsupportedVersion(u32),
    #[error("variable-length integer overruns the buffer")]
    VarIntOverrun,
}

/// One of the QUIC/GQUIC version families this engine can decrypt.
///
/// Mirrors `QuicVersion::from_u32` in `core/src/protocols/stream/quic/parser.rs`;
/// GQUIC versions are folded in since `original_source`'s retrieved slice
/// names them as required targets that the IETF/mvfst table alone doesn't
/// cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuicVersion {
    V1,
    V2,
    Draft29,
    Draft27,
    Mvfst27,
    GquicQ035,
    GquicQ043,
    GquicQ046,
    GquicQ050,
    GquicQ051,
}

impl QuicVersion {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x0000_0001 => Some(QuicVersion::V1),
            0x6b33_43cf => Some(QuicVersion::V2),
            0xff00_001d => Some(QuicVersion::Draft29),
            0xff00_001b => Some(QuicVersion::Draft27),
            0xface_b002 => Some(QuicVersion::Mvfst27),
            0x5130_3335 => Some(QuicVersion::GquicQ035),
            0x5130_3433 => Some(QuicVersion::GquicQ043),
            0x5130_3436 => Some(QuicVersion::GquicQ046),
            0x5130_3530 => Some(QuicVersion::GquicQ050),
            0x5130_3531 => Some(QuicVersion::GquicQ051),
            _ => None,
        }
    }

    /// The initial-secret salt for this version. RFC 9369 and RFC 9000
    /// (v2/v1) each get their own salt; the three pre-RFC drafts share the
    /// draft-27 salt, mirroring `derive_initial_secret` in
    /// `core/src/protocols/stream/quic/crypto.rs` exactly (including the
    /// Q050 discrepancy noted below).
    pub fn initial_salt(&self) -> Option<&'static [u8]> {
        match self {
            QuicVersion::V1 => Some(&SALT_V1),
            QuicVersion::V2 => Some(&SALT_V2),
            QuicVersion::Draft29 => Some(&SALT_DRAFT29),
            QuicVersion::Draft27 | QuicVersion::Mvfst27 => Some(&SALT_DRAFT27),
            // Q050 carries a non-trivial salt in the source table despite
            // being routed through the cleartext decoder below — mirrored
            // literally per the open question in the design notes rather
            // than "fixed".
            QuicVersion::GquicQ050 => Some(&SALT_DRAFT27),
            QuicVersion::GquicQ035
            | QuicVersion::GquicQ043
            | QuicVersion::GquicQ046
            | QuicVersion::GquicQ051 => None,
        }
    }

    /// Whether this version's Initial packet is decrypted via the
    /// TLS-1.3-style AEAD pipeline, or read as GQUIC cleartext frames at a
    /// fixed offset.
    pub fn uses_cleartext_decoder(&self) -> bool {
        matches!(
            self,
            QuicVersion::GquicQ035
                | QuicVersion::GquicQ043
                | QuicVersion::GquicQ046
                | QuicVersion::GquicQ050
        )
    }

    /// The fixed cleartext frame offset used by the legacy GQUIC decoder.
    /// Q046 differs from the others (30 vs 26 bytes) — mirrored literally.
    pub fn cleartext_offset(&self) -> Option<usize> {
        match self {
            QuicVersion::GquicQ035 | QuicVersion::GquicQ043 => Some(26),
            QuicVersion::GquicQ046 | QuicVersion::GquicQ050 => Some(30),
            _ => None,
        }
    }
}

const SALT_V1: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c, 0xad,
    0xcc, 0xbb, 0x7f, 0x0a,
];
const SALT_V2: [u8; 20] = [
    0x0d, 0xed, 0xe3, 0xde, 0xf7, 0x00, 0xa6, 0xdb, 0x81, 0x93, 0x81, 0xbe, 0x6e, 0x26, 0x9d, 0xcb,
    0xf9, 0xbd, 0x2e, 0xd9,
];
const SALT_DRAFT29: [u8; 20] = [
    0xaf, 0xbf, 0xec, 0x28, 0x99, 0x93, 0xd2, 0x4c, 0x9e, 0x97, 0x86, 0xf1, 0x9c, 0x61, 0x11, 0xe0,
    0x43, 0x90, 0xa8, 0x99,
];
const SALT_DRAFT27: [u8; 20] = [
    0xc3, 0xee, 0xf7, 0x12, 0xc7, 0x2e, 0xbb, 0x5a, 0x11, 0xa7, 0xd2, 0x43, 0x2b, 0xb4, 0x63, 0x65,
    0xbe, 0xf9, 0xf5, 0x02,
];

/// A long-header Initial packet, split into the parts needed to derive
/// keys and locate the sample for header-protection removal.
pub struct LongHeaderInitial<'a> {
    pub version: QuicVersion,
    pub dcid: &'a [u8],
    pub scid: &'a [u8],
    /// Offset of the (still header-protected) packet-number field, and the
    /// full remainder of the packet from that offset onward.
    pub pn_offset: usize,
    pub payload_len: usize,
    pub packet: &'a [u8],
}

fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64, QuicHeaderError> {
    let first = *buf.get(*pos).ok_or(QuicHeaderError::VarIntOverrun)?;
    let len = 1usize << (first >> 6);
    if *pos + len > buf.len() {
        return Err(QuicHeaderError::VarIntOverrun);
    }
    let mut val = (first & 0x3f) as u64;
    for b in &buf[*pos + 1..*pos + len] {
        val = (val << 8) | (*b as u64);
    }
    *pos += len;
    Ok(val)
}

/// Parses the long-header Initial framing (everything up to and including
/// the token and length fields) out of `packet`.
pub fn parse_long_header_initial(packet: &[u8]) -> Result<LongHeaderInitial<'_>, QuicHeaderError> {
    if packet.len() < 7 {
        return Err(QuicHeaderError::Truncated);
    }
    let first_byte = packet[0];
    if first_byte & 0xA0 != 0x80 || first_byte & 0x30 != 0x00 {
        return Err(QuicHeaderError::NotLongHeaderInitial(first_byte));
    }

    let version_num = u32::from_be_bytes([packet[1], packet[2], packet[3], packet[4]]);
    let version =
        QuicVersion::from_u32(version_num).ok_or(QuicHeaderError::UnsupportedVersion(version_num))?;

    let mut pos = 5usize;
    let dcid_len = *packet.get(pos).ok_or(QuicHeaderError::Truncated)? as usize;
    pos += 1;
    let dcid = packet
        .get(pos..pos + dcid_len)
        .ok_or(QuicHeaderError::Truncated)?;
    pos += dcid_len;

    let scid_len = *packet.get(pos).ok_or(QuicHeaderError::Truncated)? as usize;
    pos += 1;
    let scid = packet
        .get(pos..pos + scid_len)
        .ok_or(QuicHeaderError::Truncated)?;
    pos += scid_len;

    let token_len = read_varint(packet, &mut pos)? as usize;
    if pos + token_len > packet.len() {
        return Err(QuicHeaderError::Truncated);
    }
    pos += token_len;

    let payload_len = read_varint(packet, &mut pos)? as usize;

    Ok(LongHeaderInitial {
        version,
        dcid,
        scid,
        pn_offset: pos,
        payload_len,
        packet,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_header_first_byte() {
        let packet = [0x40u8, 0, 0, 0, 0, 0, 0];
        let err = parse_long_header_initial(&packet).unwrap_err();
        assert!(matches!(err, QuicHeaderError::NotLongHeaderInitial(_)));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut packet = vec![0x80u8, 0xde, 0xad, 0xbe, 0xef, 0, 0];
        packet.extend_from_slice(&[0u8; 10]);
        let err = parse_long_header_initial(&packet).unwrap_err();
        assert!(matches!(err, QuicHeaderError::UnsupportedVersion(_)));
    }

    #[test]
    fn recognizes_v1_and_extracts_cids() {
        let mut packet = vec![0x80u8, 0x00, 0x00, 0x00, 0x01];
        packet.push(8); // dcid len
        packet.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        packet.push(0); // scid len
        packet.push(0x00); // token len varint (0)
        packet.push(0x40); // payload len varint, 2-byte form
        packet.push(0x10);
        packet.extend_from_slice(&[0u8; 20]);
        let parsed = parse_long_header_initial(&packet).unwrap();
        assert_eq!(parsed.version, QuicVersion::V1);
        assert_eq!(parsed.dcid, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(parsed.payload_len, 0x10);
    }
}

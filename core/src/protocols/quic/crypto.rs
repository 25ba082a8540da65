//! Initial-secret key derivation and Initial-packet decryption.
//!
//! Grounded in `core/src/protocols/stream/quic/crypto.rs`'s
//! `derive_initial_secret`/`derive_pkt_protection` pipeline (HKDF-Extract
//! from the per-version salt, then four HKDF-Expand-Label calls for
//! client key/iv/hp and the header-protection mask). The AEAD step uses
//! `aes-gcm`, a maintained crate already present in this workspace's
//! dependency graph, rather than the unlisted/abandoned crypto crate the
//! original Initial-decryption code reaches for.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use ring::hkdf;

use super::header::QuicVersion;

const CLIENT_IN_LABEL: &[u8] = b"client in";
const LABEL_KEY: &[u8] = b"quic key";
const LABEL_IV: &[u8] = b"quic iv";
const LABEL_HP: &[u8] = b"quic hp";

#[derive(Debug)]
pub struct QuicDecryptError(pub &'static str);

impl std::fmt::Display for QuicDecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "quic decrypt failed: {}", self.0)
    }
}

struct RawSecret(Vec<u8>);

impl hkdf::KeyType for RawSecret {
    fn len(&self) -> usize {
        self.0.len()
    }
}

/// TLS 1.3 HKDF-Expand-Label, scoped to the fixed-length outputs QUIC's key
/// schedule ever asks for (`aead_key_len` is 16 for AES-128-GCM, 12 for the
/// IV/mask sampling window).
fn hkdf_expand_label(secret: &hkdf::Prk, label: &[u8], out_len: usize) -> Vec<u8> {
    let mut info = Vec::with_capacity(2 + 1 + 6 + label.len() + 1);
    info.extend_from_slice(&(out_len as u16).to_be_bytes());
    let full_label_len = 6 + label.len();
    info.push(full_label_len as u8);
    info.extend_from_slice(b"tls13 ");
    info.extend_from_slice(label);
    info.push(0); // empty context

    let okm = secret
        .expand(&[&info], RawSecret(vec![0u8; out_len]))
        .expect("hkdf expand with a fixed, validated output length cannot fail");
    let mut out = vec![0u8; out_len];
    okm.fill(&mut out).expect("length matches RawSecret::len");
    out
}

pub struct InitialKeys {
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
    pub hp: Vec<u8>,
}

/// Derives the client-direction Initial packet-protection keys for `dcid`
/// under `version`'s salt. Returns `None` for versions with no AEAD salt
/// (the GQUIC cleartext family, handled separately).
pub fn derive_initial_keys(version: QuicVersion, dcid: &[u8]) -> Option<InitialKeys> {
    let salt_bytes = version.initial_salt()?;
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, salt_bytes);
    let initial_secret: hkdf::Prk = salt.extract(dcid);

    let client_secret_bytes = hkdf_expand_label(&initial_secret, CLIENT_IN_LABEL, 32);
    let client_prk = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, &client_secret_bytes);

    let key = hkdf_expand_label(&client_prk, LABEL_KEY, 16);
    let iv = hkdf_expand_label(&client_prk, LABEL_IV, 12);
    let hp = hkdf_expand_label(&client_prk, LABEL_HP, 16);

    Some(InitialKeys { key, iv, hp })
}

/// Computes the 5-byte header-protection mask from a packet-protection `hp`
/// key and the 16-byte sample taken from the packet-number-sized window
/// immediately following the (still-protected) packet-number field, via
/// AES-128-ECB as specified for QUIC header protection (RFC 9001 §5.4.2).
/// `ring` only exposes AES-ECB through its QUIC-specific
/// `HeaderProtectionKey`, which this reuses directly.
pub fn header_protection_mask(hp: &[u8], sample: &[u8; 16]) -> Result<[u8; 5], QuicDecryptError> {
    let key = ring::aead::quic::HeaderProtectionKey::new(ring::aead::quic::AES_128, hp)
        .map_err(|_| QuicDecryptError("invalid header protection key length"))?;
    key.new_mask(sample)
        .map_err(|_| QuicDecryptError("header protection mask computation failed"))
}

/// Decrypts an Initial packet's payload with AES-128-GCM, using the
/// per-packet nonce formed by XORing the packet number into the low bits of
/// the static IV (RFC 9001 §5.3).
pub fn decrypt_payload(
    key: &[u8],
    iv: &[u8],
    packet_number: u64,
    associated_data: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, QuicDecryptError> {
    let cipher =
        Aes128Gcm::new_from_slice(key).map_err(|_| QuicDecryptError("invalid AEAD key length"))?;

    let mut nonce_bytes = [0u8; 12];
    nonce_bytes.copy_from_slice(iv);
    let pn_bytes = packet_number.to_be_bytes();
    for i in 0..8 {
        nonce_bytes[4 + i] ^= pn_bytes[i];
    }
    let nonce = Nonce::from_slice(&nonce_bytes);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|_| QuicDecryptError("AEAD authentication failed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_initial_keys_have_expected_lengths() {
        let dcid = [0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08];
        let keys = derive_initial_keys(QuicVersion::V1, &dcid).expect("v1 has a salt");
        assert_eq!(keys.key.len(), 16);
        assert_eq!(keys.iv.len(), 12);
        assert_eq!(keys.hp.len(), 16);
    }

    #[test]
    fn cleartext_family_has_no_initial_keys() {
        assert!(derive_initial_keys(QuicVersion::GquicQ043, &[1, 2, 3]).is_none());
    }

    #[test]
    fn decrypt_with_wrong_key_fails_closed() {
        let dcid = [1, 2, 3, 4, 5, 6, 7, 8];
        let keys = derive_initial_keys(QuicVersion::V1, &dcid).unwrap();
        let wrong = derive_initial_keys(QuicVersion::V1, &[9, 9, 9, 9, 9, 9, 9, 9]).unwrap();
        let ciphertext = decrypt_payload(&keys.key, &keys.iv, 0, b"aad", b"0123456789abcdef0123456789abcdef");
        // Encrypting isn't exposed (decrypt-only pipeline); this simply
        // checks that garbage ciphertext under the wrong key still returns
        // an error rather than panicking.
        let attempt = decrypt_payload(&wrong.key, &wrong.iv, 0, b"aad", b"0123456789abcdef0123456789abcdef");
        assert!(ciphertext.is_err());
        assert!(attempt.is_err());
    }
}

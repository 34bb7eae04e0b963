//! Root client token codec.
//!
//! Layout: one tag byte, a 16-byte MAC, then a CBOR array of caveats.
//! Each caveat is a CBOR byte string whose content is a `(type, value)`
//! pair of CBOR unsigned integers. The MAC chains over the raw caveat
//! contents: starting from the secret, each step is
//! `HMAC-SHA256(previous, caveat)` truncated to 16 bytes.

use minicbor::{Decoder, Encoder};
use subtle::ConstantTimeEq;

use crate::auth::hmac_sha256;

const ROOT_TOKEN_TAG: u8 = 0x50;
const MAC_LEN: usize = 16;

const CAVEAT_AUTH_SCOPE: u8 = 1;
const CAVEAT_ISSUED: u8 = 3;

// Caveat scope code for the device owner; the only scope a root client
// token is ever minted with.
const CAVEAT_SCOPE_OWNER: u8 = 2;

fn encode_pair(first: u8, second: u64) -> Vec<u8> {
    let mut buffer = Vec::new();
    let mut encoder = Encoder::new(&mut buffer);
    encoder
        .u8(first)
        .and_then(|encoder| encoder.u64(second))
        .expect("cbor encoding into a vec cannot fail");
    buffer
}

fn chain_mac(secret: &[u8], caveats: &[Vec<u8>]) -> [u8; MAC_LEN] {
    let mut key = secret.to_vec();
    for caveat in caveats {
        key = hmac_sha256(&key, caveat)[..MAC_LEN].to_vec();
    }
    let mut mac = [0u8; MAC_LEN];
    mac.copy_from_slice(&key[..MAC_LEN]);
    mac
}

/// Mint the owner-scoped root client token for `issued` (unix seconds).
/// Deterministic for a given secret and timestamp.
pub fn encode_root_token(secret: &[u8], issued: u64) -> Vec<u8> {
    let caveats = vec![
        encode_pair(CAVEAT_AUTH_SCOPE, u64::from(CAVEAT_SCOPE_OWNER)),
        encode_pair(CAVEAT_ISSUED, issued),
    ];
    let mac = chain_mac(secret, &caveats);

    let mut token = vec![ROOT_TOKEN_TAG];
    token.extend_from_slice(&mac);
    let mut body = Vec::new();
    let mut encoder = Encoder::new(&mut body);
    encoder
        .array(caveats.len() as u64)
        .expect("cbor encoding into a vec cannot fail");
    for caveat in &caveats {
        encoder
            .bytes(caveat)
            .expect("cbor encoding into a vec cannot fail");
    }
    token.extend_from_slice(&body);
    token
}

/// Check a root client token against `secret`. Constant-time MAC
/// comparison; malformed tokens simply fail.
pub fn verify_root_token(secret: &[u8], token: &[u8]) -> bool {
    if token.len() <= 1 + MAC_LEN || token[0] != ROOT_TOKEN_TAG {
        return false;
    }
    let mac = &token[1..1 + MAC_LEN];
    let body = &token[1 + MAC_LEN..];

    let mut decoder = Decoder::new(body);
    let Ok(Some(count)) = decoder.array() else {
        return false;
    };
    let mut caveats = Vec::with_capacity(count as usize);
    for _ in 0..count {
        match decoder.bytes() {
            Ok(caveat) => caveats.push(caveat.to_vec()),
            Err(_) => return false,
        }
    }
    let expected = chain_mac(secret, &caveats);
    expected.ct_eq(mac).into()
}

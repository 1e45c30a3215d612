//! Wire encoding helpers.
//!
//! Every binary field travels as unpadded URL-safe base64. Counters are
//! little-endian `u64`, door identifiers big-endian `u32`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

use crate::error::{CardKitError, CardKitResult};

/// Size of an encoded counter on the wire.
pub const COUNTER_LEN: usize = 8;
/// Size of a truncated authentication tag.
pub const TAG_LEN: usize = 16;
/// Size of the per-presentation nonce of the door-bound scheme.
pub const NONCE_LEN: usize = 12;
/// Size of an encoded door identifier.
pub const DOOR_ID_LEN: usize = 4;

/// Encodes bytes as unpadded URL-safe base64.
#[must_use]
pub fn encode_b64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decodes unpadded URL-safe base64.
///
/// # Errors
///
/// Returns [`CardKitError::Encoding`] when the input is not valid base64.
pub fn decode_b64url(input: &str) -> CardKitResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(input.trim())
        .map_err(|err| CardKitError::Encoding(err.to_string()))
}

/// Copies `bytes` into a fixed-size array.
///
/// # Errors
///
/// Returns [`CardKitError::InvalidInput`] when the length is not exactly `N`.
pub fn fixed<const N: usize>(bytes: &[u8], label: &str) -> CardKitResult<[u8; N]> {
    <[u8; N]>::try_from(bytes).map_err(|_| {
        CardKitError::InvalidInput(format!(
            "{label} length mismatch: expected {N}, got {}",
            bytes.len()
        ))
    })
}

/// Encodes a counter as 8 little-endian bytes.
#[must_use]
pub const fn counter_to_le(counter: u64) -> [u8; COUNTER_LEN] {
    counter.to_le_bytes()
}

/// Decodes an 8-byte little-endian counter.
///
/// # Errors
///
/// Returns [`CardKitError::InvalidInput`] for any other length.
pub fn counter_from_le(bytes: &[u8]) -> CardKitResult<u64> {
    fixed::<COUNTER_LEN>(bytes, "counter").map(u64::from_le_bytes)
}

/// Decodes a 4-byte big-endian door identifier.
///
/// # Errors
///
/// Returns [`CardKitError::InvalidInput`] for any other length.
pub fn door_id_from_be(bytes: &[u8]) -> CardKitResult<u32> {
    fixed::<DOOR_ID_LEN>(bytes, "door id").map(u32::from_be_bytes)
}

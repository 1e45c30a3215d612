//! Identifier and key material newtypes.

use std::fmt;
use std::str::FromStr;

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::encoding::{decode_b64url, encode_b64url, fixed, TAG_LEN};
use crate::error::{CardKitError, CardKitResult};

/// Opaque 128-bit card identifier. Immutable once issued.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CardId([u8; 16]);

impl CardId {
    /// Wraps raw identifier bytes.
    #[must_use]
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Draws a fresh identifier from the OS random source.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Returns the raw identifier bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Parses the unpadded URL-safe base64 form.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not base64 or does not decode to 16 bytes.
    pub fn from_b64(input: &str) -> CardKitResult<Self> {
        let bytes = decode_b64url(input)?;
        fixed::<16>(&bytes, "card id").map(Self)
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_b64url(&self.0))
    }
}

impl fmt::Debug for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CardId({self})")
    }
}

impl FromStr for CardId {
    type Err = CardKitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_b64(s)
    }
}

impl Serialize for CardId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CardId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_b64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// A card's 256-bit symmetric secret (`K_master`).
///
/// # Security
///
/// - The key is zeroized on drop.
/// - `Debug` never prints the key bytes; there is no `Display` or `Serialize`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CardSecret([u8; 32]);

impl CardSecret {
    /// Creates a secret from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parses a secret from an arbitrary slice, enforcing the 32-byte length.
    ///
    /// # Errors
    ///
    /// Returns [`CardKitError::InvalidInput`] on a length mismatch.
    pub fn from_slice(bytes: &[u8]) -> CardKitResult<Self> {
        fixed::<32>(bytes, "card secret").map(Self)
    }

    /// Generates a new random secret.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Returns a reference to the raw key bytes. Treat as sensitive material.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for CardSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardSecret")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Truncated (16-byte) authentication tag of a one-time code.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Tag([u8; TAG_LEN]);

impl Tag {
    /// Wraps raw tag bytes.
    #[must_use]
    pub const fn new(bytes: [u8; TAG_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw tag bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; TAG_LEN] {
        &self.0
    }

    /// Compares two tags without branching on the first differing byte.
    #[must_use]
    pub fn ct_eq(&self, other: &[u8; TAG_LEN]) -> bool {
        self.0[..].ct_eq(&other[..]).into()
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", encode_b64url(&self.0))
    }
}

//! Envelope encryption of card secrets under a deployment key-encryption key.
//!
//! A wrapped value is a CBOR document `{version, nonce, ciphertext}` where the
//! ciphertext is XChaCha20-Poly1305 over the plaintext, bound to caller
//! supplied associated data.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::encoding::{decode_b64url, fixed};
use crate::error::{CardKitError, CardKitResult};
use crate::primitives::{CardId, CardSecret};

const ENVELOPE_VERSION: u32 = 1;
const XNONCE_LEN: usize = 24;

/// Environment variable holding the base64url encoded key-encryption key.
pub const KEK_ENV_VAR: &str = "CARDKIT_KEK_B64";

const CARD_SECRET_LABEL: &[u8] = b"cardkit:card-secret:";

#[derive(Clone, Serialize, Deserialize)]
struct WrappedEnvelope {
    version: u32,
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
}

impl WrappedEnvelope {
    fn serialize(&self) -> CardKitResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|err| CardKitError::Serialization(err.to_string()))?;
        Ok(bytes)
    }

    fn deserialize(bytes: &[u8]) -> CardKitResult<Self> {
        let envelope: Self = ciborium::de::from_reader(bytes)
            .map_err(|err| CardKitError::Serialization(err.to_string()))?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(CardKitError::Crypto(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }
        Ok(envelope)
    }
}

/// Wraps and unwraps secrets at rest.
///
/// Implementations may be backed by a local key (see [`KekWrap`]) or by an
/// external key management service.
pub trait KeyWrap: Send + Sync {
    /// Encrypts `plaintext`, authenticating `aad` alongside it.
    ///
    /// # Errors
    ///
    /// Returns [`CardKitError::Crypto`] if encryption fails.
    fn wrap(&self, plaintext: &[u8], aad: &[u8]) -> CardKitResult<Vec<u8>>;

    /// Decrypts a value produced by [`wrap`](KeyWrap::wrap) with the same `aad`.
    ///
    /// # Errors
    ///
    /// Returns [`CardKitError::Crypto`] on authentication failure and
    /// [`CardKitError::Serialization`] on a malformed envelope.
    fn unwrap(&self, wrapped: &[u8], aad: &[u8]) -> CardKitResult<Zeroizing<Vec<u8>>>;
}

/// [`KeyWrap`] backed by a 256-bit key-encryption key held in memory.
pub struct KekWrap {
    key: SecretBox<[u8; 32]>,
}

impl KekWrap {
    /// Creates a wrapper from raw key bytes.
    #[must_use]
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            key: SecretBox::new(Box::new(key)),
        }
    }

    /// Generates a random key-encryption key. Intended for tests and
    /// simulations; a deployment supplies its key.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(key.as_mut());
        Self::new(*key)
    }

    /// Parses a base64url encoded key.
    ///
    /// # Errors
    ///
    /// Returns an error if the input does not decode to exactly 32 bytes.
    pub fn from_b64(encoded: &str) -> CardKitResult<Self> {
        let bytes = Zeroizing::new(decode_b64url(encoded)?);
        fixed::<32>(&bytes, "key-encryption key").map(Self::new)
    }

    /// Loads the key from the [`KEK_ENV_VAR`] environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`CardKitError::InvalidInput`] if the variable is unset, or the
    /// parse error of [`KekWrap::from_b64`].
    pub fn from_env() -> CardKitResult<Self> {
        let encoded = Zeroizing::new(std::env::var(KEK_ENV_VAR).map_err(|_| {
            CardKitError::InvalidInput(format!("{KEK_ENV_VAR} is not set"))
        })?);
        Self::from_b64(&encoded)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(self.key.expose_secret()))
    }
}

impl std::fmt::Debug for KekWrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KekWrap").finish_non_exhaustive()
    }
}

impl KeyWrap for KekWrap {
    fn wrap(&self, plaintext: &[u8], aad: &[u8]) -> CardKitResult<Vec<u8>> {
        let mut nonce = [0u8; XNONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CardKitError::Crypto("envelope encryption failed".to_string()))?;
        WrappedEnvelope {
            version: ENVELOPE_VERSION,
            nonce: nonce.to_vec(),
            ciphertext,
        }
        .serialize()
    }

    fn unwrap(&self, wrapped: &[u8], aad: &[u8]) -> CardKitResult<Zeroizing<Vec<u8>>> {
        let envelope = WrappedEnvelope::deserialize(wrapped)?;
        let nonce = fixed::<XNONCE_LEN>(&envelope.nonce, "envelope nonce")?;
        self.cipher()
            .decrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: &envelope.ciphertext,
                    aad,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| CardKitError::Crypto("envelope authentication failed".to_string()))
    }
}

fn card_secret_aad(card_id: &CardId) -> Vec<u8> {
    let mut aad = Vec::with_capacity(CARD_SECRET_LABEL.len() + 16);
    aad.extend_from_slice(CARD_SECRET_LABEL);
    aad.extend_from_slice(card_id.as_bytes());
    aad
}

/// Wraps a card secret, binding the envelope to the card identifier.
///
/// # Errors
///
/// Propagates the wrapper's error.
pub fn wrap_card_secret(
    wrap: &dyn KeyWrap,
    card_id: &CardId,
    secret: &CardSecret,
) -> CardKitResult<Vec<u8>> {
    wrap.wrap(secret.as_bytes(), &card_secret_aad(card_id))
}

/// Unwraps a card secret produced by [`wrap_card_secret`] for the same card.
///
/// # Errors
///
/// Returns [`CardKitError::Crypto`] if the envelope belongs to another card
/// or was tampered with.
pub fn unwrap_card_secret(
    wrap: &dyn KeyWrap,
    card_id: &CardId,
    wrapped: &[u8],
) -> CardKitResult<CardSecret> {
    let plaintext = wrap.unwrap(wrapped, &card_secret_aad(card_id))?;
    CardSecret::from_slice(&plaintext)
}

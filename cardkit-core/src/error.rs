use thiserror::Error;

/// Result type used across `CardKit`.
pub type CardKitResult<T, E = CardKitError> = std::result::Result<T, E>;

/// Error outputs from `CardKit`
///
/// Payloads are plain strings so the error stays flat across the FFI boundary.
/// They never carry key material or raw MAC intermediates.
#[derive(Debug, Error)]
#[cfg_attr(feature = "ffi", derive(uniffi::Error))]
#[cfg_attr(feature = "ffi", uniffi(flat_error))]
pub enum CardKitError {
    /// The presented input is not valid for the requested operation
    #[error("invalid_input: {0}")]
    InvalidInput(String),
    /// A binary field could not be decoded from its wire encoding
    #[error("encoding_error: {0}")]
    Encoding(String),
    /// A cryptographic primitive failed (key wrap, unwrap, random source)
    #[error("crypto_error: {0}")]
    Crypto(String),
    /// The backing store rejected or failed an operation
    #[error("storage_error: {0}")]
    Storage(String),
    /// Unexpected error serializing information
    #[error("serialization_error: {0}")]
    Serialization(String),
    /// The referenced card does not exist
    #[error("card_not_found")]
    NotFound,
    /// The card's counter reached `u64::MAX`; no further codes can be produced
    #[error("counter_exhausted")]
    CounterExhausted,
    /// The counter high-water mark could not be persisted; generation fails closed
    #[error("counter_persistence_error: {0}")]
    CounterPersistence(String),
    /// Network connection error with details
    #[error("network_error: {url} (status {status:?}): {error}")]
    Network {
        /// Target URL of the failing request.
        url: String,
        /// HTTP status code, when a response was received.
        status: Option<u16>,
        /// Human readable error description.
        error: String,
    },
    /// An operation did not complete in its time budget
    #[error("timeout: {0}")]
    Timeout(String),
    /// A lock guarding shared state was poisoned by a panicking holder
    #[error("lock_poisoned: {0}")]
    LockPoisoned(String),
    /// Key rotation for a card failed; the card keeps its previous secret
    #[error("rotation_failed: {0}")]
    RotationFailed(String),
    /// The synchronization server could not be reached or refused the batch
    #[error("sync_unavailable: {0}")]
    SyncUnavailable(String),
}

impl CardKitError {
    pub(crate) fn poisoned(what: &str) -> Self {
        Self::LockPoisoned(format!("{what} lock poisoned"))
    }
}

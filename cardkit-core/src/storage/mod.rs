//! Storage layer: card records, atomic blobs, and secret envelopes.

mod blob_store;
pub mod envelope;
mod memory;
pub mod traits;

pub use blob_store::FsBlobStore;
pub use envelope::{unwrap_card_secret, wrap_card_secret, KekWrap, KeyWrap, KEK_ENV_VAR};
pub use memory::{MemoryBlobStore, MemoryCredentialStore};
pub use traits::{AtomicBlobStore, CredentialStore, ExtendOutcome, RotationCommit};

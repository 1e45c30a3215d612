//! `cardkit-core` issues access cards, derives and verifies their one-time
//! codes, rotates card keys and runs an offline door controller with a
//! signed, synchronizable journal.
//!
//! The main entry points are [`CardService`] on the central side,
//! [`code::CodeGenerator`] on the card side and
//! [`controller::OfflineController`] at the door.
#![deny(clippy::all, clippy::pedantic, clippy::nursery)]

mod error;
pub use error::*;

mod card;
pub use card::*;

mod clock;
pub use clock::*;

mod config;
pub use config::*;

mod primitives;
pub use primitives::*;

mod role;
pub use role::*;

mod service;
pub use service::*;

mod verifier;
pub use verifier::*;

/// Audit trail of central operations.
pub mod audit;

/// Code generation: counter persistence and tag derivation.
pub mod code;

/// Offline controller, its card cache, QR admission and sync.
pub mod controller;

/// Binary field encodings shared by the wire format.
pub mod encoding;

/// Signed append-only event journal.
pub mod journal;

/// Logger bridge for embedders.
pub mod logger;

/// Key rotation.
pub mod rotation;

/// Credential and blob stores plus secret envelope wrapping.
pub mod storage;

mod http_request;
pub use http_request::HttpSyncTransport;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!("cardkit_core");

//! One-time code derivation and the card-side generator.

mod counter;
mod generator;
pub mod mac;

pub use counter::{BlobCounterJournal, CounterJournal, MemoryCounterJournal};
pub use generator::{CodeGenerator, OneTimeCode, WireCode};
pub use mac::{basic_tag, derive_tag, door_bound_tag, DoorBinding};

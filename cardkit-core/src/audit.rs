//! Audit collaborator.

use std::sync::Mutex;

use strum::{Display, EnumString};

use crate::error::{CardKitError, CardKitResult};
use crate::primitives::CardId;

/// Kind of audited event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEvent {
    /// A card was issued.
    CardCreated,
    /// A card was revoked.
    CardRevoked,
    /// A card's validity was extended.
    CardExtended,
    /// A card's secret was rotated.
    KeyRotated,
    /// Rotating a card's secret failed.
    KeyRotationFailed,
    /// A code was verified (granted or denied).
    Verify,
}

/// One audit record. `detail` never carries secret material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    /// Event kind.
    pub event_type: AuditEvent,
    /// Card concerned, if any.
    pub card_id: Option<CardId>,
    /// Whether the operation succeeded (for `Verify`: granted).
    pub success: bool,
    /// Short human readable detail (deny reason code, new key version, ...).
    pub detail: String,
}

impl AuditRecord {
    /// Creates a record.
    pub fn new(
        event_type: AuditEvent,
        card_id: Option<CardId>,
        success: bool,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            card_id,
            success,
            detail: detail.into(),
        }
    }
}

/// Receives audit records. Implementations must not block for long: they are
/// called on the verification path.
pub trait AuditSink: Send + Sync {
    /// Records one event. Failures are the sink's own concern.
    fn record(&self, record: AuditRecord);
}

/// Sink writing audit records to the `log` facade under target `cardkit::audit`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, record: AuditRecord) {
        let card = record
            .card_id
            .map_or_else(|| "-".to_string(), |card_id| card_id.to_string());
        log::info!(
            target: "cardkit::audit",
            "{} card={card} success={} detail={}",
            record.event_type,
            record.success,
            record.detail
        );
    }
}

/// Sink collecting records in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies all collected records.
    ///
    /// # Errors
    ///
    /// Returns an error if the record lock is poisoned.
    pub fn records(&self) -> CardKitResult<Vec<AuditRecord>> {
        self.records
            .lock()
            .map(|records| records.clone())
            .map_err(|_| CardKitError::poisoned("audit records"))
    }

    /// Collected records of one kind.
    ///
    /// # Errors
    ///
    /// Returns an error if the record lock is poisoned.
    pub fn of_kind(&self, event_type: AuditEvent) -> CardKitResult<Vec<AuditRecord>> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|record| record.event_type == event_type)
            .collect())
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

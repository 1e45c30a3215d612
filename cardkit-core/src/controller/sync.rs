//! Journal synchronization contract and an in-memory server.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CardKitError, CardKitResult};
use crate::journal::JournalEntry;

/// One transmission of unsynced journal entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBatch {
    /// Fresh identifier per attempt, for server-side tracing.
    pub batch_id: Uuid,
    /// Sending controller.
    pub controller_id: String,
    /// Entries in sequence order.
    pub entries: Vec<JournalEntry>,
}

/// Server answer to a [`SyncBatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncAck {
    /// Highest sequence number the server has durably stored.
    pub acknowledged_through: Option<u64>,
}

/// Outcome of one [`sync`](super::OfflineController::sync) attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    /// Whether the server acknowledged the batch.
    pub success: bool,
    /// Entries sent in this attempt.
    pub transmitted: usize,
    /// Acknowledged cursor after the attempt.
    pub acknowledged_through: Option<u64>,
    /// Human readable summary.
    pub message: String,
}

/// Delivers journal batches to the central server.
///
/// Entries are keyed by `(controller_id, seq)`, so a transport may resend a
/// batch after a lost acknowledgement without creating duplicates.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Sends one batch.
    ///
    /// # Errors
    ///
    /// Returns [`CardKitError::SyncUnavailable`] or
    /// [`CardKitError::Network`] when the batch was not acknowledged.
    async fn push(&self, batch: SyncBatch) -> CardKitResult<SyncAck>;
}

/// In-memory sync server. Stores entries keyed by `(controller_id, seq)`.
#[derive(Debug, Default)]
pub struct MemorySyncServer {
    entries: Mutex<BTreeMap<(String, u64), JournalEntry>>,
    unavailable: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl MemorySyncServer {
    /// Creates an empty, available server.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the server refuse (or accept again) every batch.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delays every answer, to exercise sync timeouts.
    pub fn set_delay(&self, delay: Option<Duration>) {
        if let Ok(mut current) = self.delay.lock() {
            *current = delay;
        }
    }

    /// Stored entries of one controller, in sequence order.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry lock is poisoned.
    pub fn entries(&self, controller_id: &str) -> CardKitResult<Vec<JournalEntry>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| CardKitError::poisoned("sync server"))?;
        Ok(entries
            .iter()
            .filter(|((owner, _), _)| owner == controller_id)
            .map(|(_, entry)| entry.clone())
            .collect())
    }
}

#[async_trait]
impl SyncTransport for MemorySyncServer {
    async fn push(&self, batch: SyncBatch) -> CardKitResult<SyncAck> {
        let delay = *self
            .delay
            .lock()
            .map_err(|_| CardKitError::poisoned("sync server"))?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CardKitError::SyncUnavailable("server unavailable".to_string()));
        }

        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CardKitError::poisoned("sync server"))?;
        let mut acknowledged_through = None;
        for entry in batch.entries {
            acknowledged_through = acknowledged_through.max(Some(entry.seq));
            entries
                .entry((batch.controller_id.clone(), entry.seq))
                .or_insert(entry);
        }
        Ok(SyncAck {
            acknowledged_through,
        })
    }
}

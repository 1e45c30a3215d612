//! Journal persistence.
//!
//! On disk a journal is a sequence of records, each a big-endian `u32`
//! length followed by one CBOR encoded [`JournalEntry`]. A record cut short
//! by a crash while appending is dropped when the file is opened.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::encoding::counter_from_le;
use crate::error::{CardKitError, CardKitResult};
use crate::storage::{AtomicBlobStore, FsBlobStore};

use super::entry::JournalEntry;

const JOURNAL_FILE: &str = "journal.log";
const CURSOR_BLOB: &str = "journal.ack";
const LENGTH_PREFIX: usize = 4;

/// Backing storage for a controller journal.
///
/// Writes happen under the controller's write lock, so implementations see a
/// single writer.
pub trait JournalStore: Send + Sync {
    /// Loads every stored entry in append order.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium cannot be read or a complete record
    /// cannot be decoded.
    fn load(&self) -> CardKitResult<Vec<JournalEntry>>;

    /// Appends one entry durably.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry could not be written.
    fn append(&mut self, entry: &JournalEntry) -> CardKitResult<()>;

    /// Atomically replaces the stored entries (used by retention pruning).
    ///
    /// # Errors
    ///
    /// Returns an error if the replacement could not be written.
    fn rewrite(&mut self, entries: &[JournalEntry]) -> CardKitResult<()>;

    /// Highest sequence number acknowledged by the sync server.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor cannot be read.
    fn acknowledged(&self) -> CardKitResult<Option<u64>>;

    /// Persists the acknowledged cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor cannot be written.
    fn set_acknowledged(&mut self, seq: u64) -> CardKitResult<()>;
}

fn encode_record(entry: &JournalEntry) -> CardKitResult<Vec<u8>> {
    let mut body = Vec::new();
    ciborium::ser::into_writer(entry, &mut body)
        .map_err(|err| CardKitError::Serialization(err.to_string()))?;
    let length = u32::try_from(body.len())
        .map_err(|_| CardKitError::Serialization("journal record too large".to_string()))?;
    let mut record = Vec::with_capacity(LENGTH_PREFIX + body.len());
    record.extend_from_slice(&length.to_be_bytes());
    record.extend_from_slice(&body);
    Ok(record)
}

/// Decodes framed records. Returns the entries and the length of the valid
/// prefix; anything after it is a torn trailing record.
fn decode_records(bytes: &[u8]) -> CardKitResult<(Vec<JournalEntry>, usize)> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while bytes.len() - offset >= LENGTH_PREFIX {
        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&bytes[offset..offset + LENGTH_PREFIX]);
        let length = u32::from_be_bytes(prefix) as usize;
        let start = offset + LENGTH_PREFIX;
        let Some(end) = start.checked_add(length).filter(|end| *end <= bytes.len()) else {
            break;
        };
        let entry: JournalEntry = ciborium::de::from_reader(&bytes[start..end])
            .map_err(|err| CardKitError::Serialization(format!("journal record at byte {offset}: {err}")))?;
        entries.push(entry);
        offset = end;
    }
    Ok((entries, offset))
}

/// In-memory [`JournalStore`].
#[derive(Debug, Default)]
pub struct MemoryJournalStore {
    entries: Vec<JournalEntry>,
    acknowledged: Option<u64>,
    fail_appends: bool,
}

impl MemoryJournalStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store whose appends fail, to exercise fail-closed decisions.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail_appends: true,
            ..Self::default()
        }
    }
}

impl JournalStore for MemoryJournalStore {
    fn load(&self) -> CardKitResult<Vec<JournalEntry>> {
        Ok(self.entries.clone())
    }

    fn append(&mut self, entry: &JournalEntry) -> CardKitResult<()> {
        if self.fail_appends {
            return Err(CardKitError::Storage("journal is read-only".to_string()));
        }
        self.entries.push(entry.clone());
        Ok(())
    }

    fn rewrite(&mut self, entries: &[JournalEntry]) -> CardKitResult<()> {
        self.entries = entries.to_vec();
        Ok(())
    }

    fn acknowledged(&self) -> CardKitResult<Option<u64>> {
        Ok(self.acknowledged)
    }

    fn set_acknowledged(&mut self, seq: u64) -> CardKitResult<()> {
        self.acknowledged = Some(seq);
        Ok(())
    }
}

/// File-backed [`JournalStore`] living in one directory: an append-only
/// `journal.log` and an atomically replaced `journal.ack` cursor.
#[derive(Debug)]
pub struct FileJournalStore {
    path: PathBuf,
    blobs: FsBlobStore,
    file: File,
}

impl FileJournalStore {
    /// Opens (or creates) the journal in `directory`, cutting off a torn
    /// trailing record if the last append was interrupted.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be opened, or a
    /// complete record is corrupt.
    pub fn open<P: AsRef<Path>>(directory: P) -> CardKitResult<Self> {
        let blobs = FsBlobStore::new(directory)?;
        let path = blobs.directory().join(JOURNAL_FILE);

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(storage_error(&path, &err)),
        };
        let (_, valid) = decode_records(&bytes)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| storage_error(&path, &err))?;
        if valid < bytes.len() {
            log::warn!(
                "dropping {} bytes of torn journal record in {}",
                bytes.len() - valid,
                path.display()
            );
            file.set_len(valid as u64)
                .map_err(|err| storage_error(&path, &err))?;
        }
        Ok(Self { path, blobs, file })
    }

    /// Path of the append-only log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn reopen(&mut self) -> CardKitResult<()> {
        self.file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|err| storage_error(&self.path, &err))?;
        Ok(())
    }
}

fn storage_error(path: &Path, err: &std::io::Error) -> CardKitError {
    CardKitError::Storage(format!("journal '{}': {err}", path.display()))
}

impl JournalStore for FileJournalStore {
    fn load(&self) -> CardKitResult<Vec<JournalEntry>> {
        let bytes = self
            .blobs
            .read(JOURNAL_FILE)?
            .unwrap_or_default();
        decode_records(&bytes).map(|(entries, _)| entries)
    }

    fn append(&mut self, entry: &JournalEntry) -> CardKitResult<()> {
        let record = encode_record(entry)?;
        self.file
            .write_all(&record)
            .and_then(|()| self.file.sync_data())
            .map_err(|err| storage_error(&self.path, &err))
    }

    fn rewrite(&mut self, entries: &[JournalEntry]) -> CardKitResult<()> {
        let mut bytes = Vec::new();
        for entry in entries {
            bytes.extend_from_slice(&encode_record(entry)?);
        }
        self.blobs.write_atomic(JOURNAL_FILE, &bytes)?;
        // The rename replaced the inode our append handle points at.
        self.reopen()
    }

    fn acknowledged(&self) -> CardKitResult<Option<u64>> {
        self.blobs
            .read(CURSOR_BLOB)?
            .map(|bytes| counter_from_le(&bytes))
            .transpose()
    }

    fn set_acknowledged(&mut self, seq: u64) -> CardKitResult<()> {
        self.blobs.write_atomic(CURSOR_BLOB, &seq.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalEvent;

    fn entry(seq: u64) -> JournalEntry {
        JournalEntry {
            seq,
            timestamp: 100 + seq,
            controller_id: "c".to_string(),
            event_type: JournalEvent::Error,
            message: format!("entry {seq}"),
            card_id: None,
            signature: [0; 32],
        }
    }

    #[test]
    fn test_file_store_round_trip_and_cursor() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let mut store = FileJournalStore::open(dir.path()).expect("open");
            store.append(&entry(0)).expect("append");
            store.append(&entry(1)).expect("append");
            store.set_acknowledged(1).expect("cursor");
        }
        let store = FileJournalStore::open(dir.path()).expect("reopen");
        assert_eq!(store.load().expect("load"), vec![entry(0), entry(1)]);
        assert_eq!(store.acknowledged().expect("cursor"), Some(1));
    }

    #[test]
    fn test_torn_tail_is_dropped_on_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = {
            let mut store = FileJournalStore::open(dir.path()).expect("open");
            store.append(&entry(0)).expect("append");
            store.path().to_path_buf()
        };
        let mut torn = encode_record(&entry(1)).expect("encode");
        torn.truncate(torn.len() - 3);
        let mut file = OpenOptions::new().append(true).open(&path).expect("file");
        file.write_all(&torn).expect("write");
        drop(file);

        let mut store = FileJournalStore::open(dir.path()).expect("reopen");
        assert_eq!(store.load().expect("load"), vec![entry(0)]);
        store.append(&entry(1)).expect("append");
        assert_eq!(store.load().expect("load"), vec![entry(0), entry(1)]);
    }

    #[test]
    fn test_rewrite_then_append() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FileJournalStore::open(dir.path()).expect("open");
        for seq in 0..4 {
            store.append(&entry(seq)).expect("append");
        }
        store.rewrite(&[entry(0), entry(3)]).expect("rewrite");
        store.append(&entry(4)).expect("append");
        assert_eq!(
            store.load().expect("load"),
            vec![entry(0), entry(3), entry(4)]
        );
    }

    #[test]
    fn test_failing_memory_store() {
        let mut store = MemoryJournalStore::failing();
        assert!(matches!(
            store.append(&entry(0)),
            Err(CardKitError::Storage(_))
        ));
    }
}

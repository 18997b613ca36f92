use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::record::{today_home_zone, Record, RecordError};

/// Records older than this are dropped by [`RecordSink::cleanup_old`] callers.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;
/// A store whose oldest record exceeds this age is compacted unconditionally.
const VACUUM_AGE_DAYS: i64 = 35;
/// Probability of an opportunistic compaction on any given cleanup.
const VACUUM_PROBABILITY: f64 = 0.03;

/// Why a sink operation failed.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The record failed validation and was not persisted.
    #[error("unprocessable record: {0}")]
    Unprocessable(#[from] RecordError),
    /// The backing file could not be read or written.
    #[error("record store I/O: {0}")]
    Io(#[from] std::io::Error),
    /// The backing file held invalid JSON.
    #[error("record store serialization: {0}")]
    Serde(#[from] serde_json::Error),
    /// The store path has no parent directory.
    #[error("invalid record store path: {}", .0.display())]
    InvalidPath(PathBuf),
}

/// Destination for validated records.
///
/// `save` validates before anything is written; a sink in collect mode
/// buffers instead of persisting so a parallel-subprocess runner can hand
/// its records back to a single writer, which later calls `flush`.
pub trait RecordSink {
    /// Validates `record` and either persists it or appends it to the
    /// in-memory buffer (collect mode). Duplicate primary keys upsert.
    fn save(&mut self, record: Record) -> Result<(), SinkError>;

    /// Switches the sink to collect (buffering) mode.
    fn collect(&mut self);

    /// Moves buffered records into the persistent store and leaves collect
    /// mode. Returns the number of records flushed.
    fn flush(&mut self) -> Result<usize, SinkError>;

    /// Deletes records whose scrape date is older than `retention_days`.
    /// Returns the number of records removed.
    fn cleanup_old(&mut self, retention_days: i64) -> Result<usize, SinkError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RecordFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    records: Vec<Record>,
}

/// File-backed record store: a versioned JSON table keyed by primary key,
/// rewritten atomically (write `*.tmp`, rename into place).
pub struct JsonRecordStore {
    path: PathBuf,
    records: BTreeMap<String, Record>,
    buffer: Vec<Record>,
    buffering: bool,
}

impl JsonRecordStore {
    /// Opens the store at `path`, loading any existing table.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let path = path.into();
        let mut records = BTreeMap::new();

        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let file: RecordFile = serde_json::from_str(&raw)?;
            for record in file.records {
                records.insert(record.primary_key(), record);
            }
        }

        Ok(Self {
            path,
            records,
            buffer: Vec::new(),
            buffering: false,
        })
    }

    /// Number of records currently in the persistent table.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the persistent table is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Looks up a record by primary key.
    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    /// Iterates the persistent table in key order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    /// Rewrites the backing file from the in-memory table, dropping any
    /// garbage left by earlier schema versions. Forced by the `VACUUM`
    /// environment variable; otherwise run opportunistically by cleanup.
    pub fn vacuum(&mut self) -> Result<(), SinkError> {
        self.persist()
    }

    fn persist(&self) -> Result<(), SinkError> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| SinkError::InvalidPath(self.path.clone()))?;
        std::fs::create_dir_all(dir)?;

        let file = RecordFile {
            version: 1,
            records: self.records.values().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(tmp, &self.path)?;
        Ok(())
    }

    fn oldest_scrape_date(&self) -> Option<NaiveDate> {
        self.records.values().filter_map(Record::scraped_on).min()
    }

    fn should_vacuum(&self, today: NaiveDate) -> bool {
        if crate::env::flag("VACUUM") {
            return true;
        }
        if let Some(oldest) = self.oldest_scrape_date() {
            if (today - oldest).num_days() > VACUUM_AGE_DAYS {
                return true;
            }
        }
        rand::random::<f64>() < VACUUM_PROBABILITY
    }
}

impl RecordSink for JsonRecordStore {
    fn save(&mut self, record: Record) -> Result<(), SinkError> {
        record.validate(today_home_zone())?;

        if self.buffering {
            self.buffer.push(record);
            return Ok(());
        }

        self.records.insert(record.primary_key(), record);
        self.persist()
    }

    fn collect(&mut self) {
        self.buffering = true;
    }

    fn flush(&mut self) -> Result<usize, SinkError> {
        self.buffering = false;
        let drained: Vec<Record> = self.buffer.drain(..).collect();
        let count = drained.len();
        for record in drained {
            self.records.insert(record.primary_key(), record);
        }
        self.persist()?;
        Ok(count)
    }

    fn cleanup_old(&mut self, retention_days: i64) -> Result<usize, SinkError> {
        let today = today_home_zone();
        let before = self.records.len();
        self.records.retain(|_, record| match record.scraped_on() {
            Some(date) => (today - date).num_days() <= retention_days,
            None => true,
        });
        let removed = before - self.records.len();

        if removed > 0 || self.should_vacuum(today) {
            self.persist()?;
        }
        Ok(removed)
    }
}

/// In-memory sink with the same contract as [`JsonRecordStore`]; used by
/// tests and by collect-mode subprocess runners that never touch disk.
#[derive(Default)]
pub struct MemorySink {
    records: BTreeMap<String, Record>,
    buffer: Vec<Record>,
    buffering: bool,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored (non-buffered) records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Looks up a stored record by primary key.
    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    /// Records currently held in the buffer, in arrival order.
    pub fn buffered(&self) -> &[Record] {
        &self.buffer
    }
}

impl RecordSink for MemorySink {
    fn save(&mut self, record: Record) -> Result<(), SinkError> {
        record.validate(today_home_zone())?;
        if self.buffering {
            self.buffer.push(record);
        } else {
            self.records.insert(record.primary_key(), record);
        }
        Ok(())
    }

    fn collect(&mut self) {
        self.buffering = true;
    }

    fn flush(&mut self) -> Result<usize, SinkError> {
        self.buffering = false;
        let count = self.buffer.len();
        for record in self.buffer.drain(..) {
            self.records.insert(record.primary_key(), record);
        }
        Ok(count)
    }

    fn cleanup_old(&mut self, retention_days: i64) -> Result<usize, SinkError> {
        let today = today_home_zone();
        let before = self.records.len();
        self.records.retain(|_, record| match record.scraped_on() {
            Some(date) => (today - date).num_days() <= retention_days,
            None => true,
        });
        Ok(before - self.records.len())
    }
}

/// Atomically writes `contents` to `path` via a sibling temp file.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(reference: &str) -> Record {
        Record {
            authority_label: Some("ballina".to_string()),
            council_reference: reference.to_string(),
            address: "1 River St".to_string(),
            description: "Carport".to_string(),
            info_url: "https://da.example/x".to_string(),
            date_scraped: today_home_zone().format("%Y-%m-%d").to_string(),
            date_received: None,
            on_notice_from: None,
            on_notice_to: None,
            extra: Default::default(),
        }
    }

    #[test]
    fn save_rejects_invalid_records_without_persisting() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonRecordStore::open(dir.path().join("data.json")).unwrap();

        let mut bad = record("DA1");
        bad.address = String::new();
        let err = store.save(bad).unwrap_err();
        assert!(err.to_string().contains("address"));
        assert!(store.is_empty());
    }

    #[test]
    fn duplicate_primary_key_upserts_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        let mut store = JsonRecordStore::open(&path).unwrap();

        let mut first = record("DA1");
        first.description = "Old".to_string();
        let mut second = record("DA1");
        second.description = "New".to_string();

        store.save(first).unwrap();
        store.save(second).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("ballina/DA1").unwrap().description, "New");

        // Survives a reload from disk.
        let reloaded = JsonRecordStore::open(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get("ballina/DA1").unwrap().description, "New");
    }

    #[test]
    fn collect_buffers_until_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        let mut store = JsonRecordStore::open(&path).unwrap();

        store.collect();
        store.save(record("DA1")).unwrap();
        store.save(record("DA2")).unwrap();
        assert!(store.is_empty());
        assert!(!path.exists());

        assert_eq!(store.flush().unwrap(), 2);
        assert_eq!(store.len(), 2);
        assert!(path.exists());
    }

    #[test]
    fn cleanup_drops_records_past_retention() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonRecordStore::open(dir.path().join("data.json")).unwrap();

        let mut old = record("DA-old");
        old.date_scraped = (today_home_zone() - Duration::days(45))
            .format("%Y-%m-%d")
            .to_string();
        let fresh = record("DA-fresh");

        // The old record is injected past validation on purpose.
        store.records.insert(old.primary_key(), old);
        store.save(fresh).unwrap();

        let removed = store.cleanup_old(DEFAULT_RETENTION_DAYS).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("ballina/DA-fresh").is_some());
    }

    #[test]
    fn memory_sink_matches_store_semantics() {
        let mut sink = MemorySink::new();
        sink.save(record("DA1")).unwrap();
        sink.save(record("DA1")).unwrap();
        assert_eq!(sink.len(), 1);

        sink.collect();
        sink.save(record("DA2")).unwrap();
        assert_eq!(sink.buffered().len(), 1);
        assert_eq!(sink.flush().unwrap(), 1);
        assert_eq!(sink.len(), 2);
    }
}

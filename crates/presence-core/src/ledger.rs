//! Attendance ledger.
//!
//! The durable side is a CSV file with a `Name,Timestamp` header that is only
//! ever appended to, except by an explicit clear. Each append opens, writes and
//! closes the file. The per-run side, [`AttendanceLedger`], remembers who was
//! already marked so nobody is written twice in one session.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const HEADER: [&str; 2] = ["Name", "Timestamp"];

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("failed to write attendance log {path}: {source}")]
    StoreWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read attendance log {path}: {source}")]
    StoreRead {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// One presence record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Timestamp", with = "timestamp")]
    pub timestamp: NaiveDateTime,
}

mod timestamp {
    use super::TIMESTAMP_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&value.format(TIMESTAMP_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT).map_err(serde::de::Error::custom)
    }
}

/// The CSV file behind the ledger.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the file with its header if it does not exist yet.
    pub fn initialize(&self) -> Result<(), LedgerError> {
        if self.path.exists() {
            return Ok(());
        }
        self.write_header_only()?;
        tracing::info!(path = %self.path.display(), "attendance log created");
        Ok(())
    }

    /// Drop every event, leaving just the header.
    pub fn clear(&self) -> Result<(), LedgerError> {
        self.write_header_only()?;
        tracing::info!(path = %self.path.display(), "attendance log cleared");
        Ok(())
    }

    /// Append one event as its own write.
    pub fn append(&self, event: &AttendanceEvent) -> Result<(), LedgerError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.write_error(e))?;

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer.serialize(event).map_err(|e| self.write_error(e.into()))?;
        writer.flush().map_err(|e| self.write_error(e))
    }

    /// All recorded events in file order. A missing file reads as empty;
    /// malformed rows are logged and skipped.
    pub fn events(&self) -> Result<Vec<AttendanceEvent>, LedgerError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut reader = csv::Reader::from_path(&self.path).map_err(|source| LedgerError::StoreRead {
            path: self.path.clone(),
            source,
        })?;

        let mut events = Vec::new();
        for (row, record) in reader.deserialize::<AttendanceEvent>().enumerate() {
            match record {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!(path = %self.path.display(), row = row + 1, error = %e, "skipping malformed attendance row"),
            }
        }
        Ok(events)
    }

    fn write_header_only(&self) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.write_error(e))?;
        }

        let file = File::create(&self.path).map_err(|e| self.write_error(e))?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(HEADER).map_err(|e| self.write_error(e.into()))?;
        writer.flush().map_err(|e| self.write_error(e))
    }

    fn write_error(&self, source: std::io::Error) -> LedgerError {
        LedgerError::StoreWrite {
            path: self.path.clone(),
            source,
        }
    }
}

/// Ledger view for one session: the store plus who has been marked so far.
#[derive(Debug)]
pub struct AttendanceLedger {
    store: LedgerStore,
    marked: HashSet<String>,
}

impl AttendanceLedger {
    /// Start a run against `store`, creating the file if needed. Nobody is marked yet.
    pub fn open(store: LedgerStore) -> Result<Self, LedgerError> {
        store.initialize()?;
        Ok(Self {
            store,
            marked: HashSet::new(),
        })
    }

    /// Append `(identity, now)` unless `identity` was already marked this run.
    ///
    /// The identity counts as marked even if the append fails.
    pub fn record_if_new(&mut self, identity: &str, now: NaiveDateTime) -> Result<bool, LedgerError> {
        if !self.marked.insert(identity.to_string()) {
            return Ok(false);
        }

        let event = AttendanceEvent {
            name: identity.to_string(),
            timestamp: now,
        };
        self.store.append(&event)?;
        tracing::info!(name = identity, timestamp = %now.format(TIMESTAMP_FORMAT), "attendance marked");
        Ok(true)
    }

    pub fn is_marked(&self, identity: &str) -> bool {
        self.marked.contains(identity)
    }

    pub fn marked_count(&self) -> usize {
        self.marked.len()
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }
}

//! Append-only event log
//!
//! The monitor records membership changes as [`Event`]s through the
//! [`EventLog`] trait. Two implementations are provided: [`MemoryEventLog`]
//! keeps entries in a vector, [`FileEventLog`] writes one JSON object per
//! line.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{FleetError, FleetResult};

/// One event log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Seconds since the epoch
    pub timestamp: f64,
    /// Event name, e.g. `online`
    pub name: String,
    /// Event specific fields
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

impl Event {
    /// Create an event stamped with the current time
    pub fn new(name: impl Into<String>, context: Map<String, Value>) -> Self {
        let now = chrono::Utc::now();
        Self {
            timestamp: now.timestamp_micros() as f64 / 1e6,
            name: name.into(),
            context,
        }
    }

    /// String field from the context
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }
}

/// Whether an appended event must reach stable storage immediately
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Write through
    Commit,
    /// May be held back until the next committed event or flush
    NoCommit,
}

/// Append-only event sink
pub trait EventLog {
    /// Append an event
    fn append(
        &mut self,
        name: &str,
        context: Map<String, Value>,
        durability: Durability,
    ) -> FleetResult<()>;

    /// Write out any events held back
    fn flush(&mut self) -> FleetResult<()> {
        Ok(())
    }
}

/// In-memory event log
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    events: Vec<Event>,
    fail_appends: bool,
}

impl MemoryEventLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// All events appended so far
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Names of all events, in order
    pub fn names(&self) -> Vec<&str> {
        self.events.iter().map(|e| e.name.as_str()).collect()
    }

    /// Make subsequent appends fail (or succeed again)
    pub fn set_fail_appends(&mut self, fail: bool) {
        self.fail_appends = fail;
    }

    /// Forget all recorded events
    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl EventLog for MemoryEventLog {
    fn append(
        &mut self,
        name: &str,
        context: Map<String, Value>,
        _durability: Durability,
    ) -> FleetResult<()> {
        if self.fail_appends {
            return Err(FleetError::EventLog(format!("append of '{}' refused", name)));
        }
        self.events.push(Event::new(name, context));
        Ok(())
    }
}

/// Event log stored as JSON lines in a file
#[derive(Debug)]
pub struct FileEventLog {
    path: PathBuf,
    file: File,
    held: Vec<Event>,
}

impl FileEventLog {
    /// Open `path` for appending, creating it if needed
    pub fn open(path: impl AsRef<Path>) -> FleetResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), "opened event log");
        Ok(Self {
            path,
            file,
            held: Vec::new(),
        })
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of events held back and not yet written
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Read every event from a log file
    pub fn read_events(path: impl AsRef<Path>) -> FleetResult<Vec<Event>> {
        let reader = BufReader::new(File::open(path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }

    /// Write held events in order. Events written before a failure are
    /// dropped from `held`; the rest stay for the next attempt.
    fn write_held(&mut self) -> FleetResult<()> {
        let mut written = 0;
        let result = self.write_events(&mut written);
        self.held.drain(..written);
        result
    }

    fn write_events(&mut self, written: &mut usize) -> FleetResult<()> {
        for event in &self.held {
            let mut line = serde_json::to_string(event)?;
            line.push('\n');
            self.file.write_all(line.as_bytes())?;
            *written += 1;
        }
        self.file.flush()?;
        Ok(())
    }
}

impl EventLog for FileEventLog {
    fn append(
        &mut self,
        name: &str,
        context: Map<String, Value>,
        durability: Durability,
    ) -> FleetResult<()> {
        self.held.try_reserve(1)?;
        self.held.push(Event::new(name, context));
        match durability {
            Durability::Commit => {
                // A failed commit must not resurface on a later flush.
                let result = self.write_held();
                if result.is_err() {
                    self.held.pop();
                }
                result
            }
            Durability::NoCommit => Ok(()),
        }
    }

    fn flush(&mut self) -> FleetResult<()> {
        if self.held.is_empty() {
            return Ok(());
        }
        self.write_held()
    }
}

impl Drop for FileEventLog {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(path = %self.path.display(), error = %e, "event log flush failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_memory_log() {
        let mut log = MemoryEventLog::new();
        log.append("online", ctx(json!({"idset": "0-1"})), Durability::NoCommit)
            .unwrap();
        assert_eq!(log.names(), vec!["online"]);
        assert_eq!(log.events()[0].context_str("idset"), Some("0-1"));

        log.set_fail_appends(true);
        assert!(log.append("offline", Map::new(), Durability::Commit).is_err());
        assert_eq!(log.events().len(), 1);
    }

    #[test]
    fn test_file_log_holds_no_commit_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resource.eventlog");
        let mut log = FileEventLog::open(&path).unwrap();

        log.append("online", ctx(json!({"idset": "0"})), Durability::NoCommit)
            .unwrap();
        assert_eq!(log.held(), 1);
        assert!(FileEventLog::read_events(&path).unwrap().is_empty());

        log.append("drain", Map::new(), Durability::Commit).unwrap();
        let events = FileEventLog::read_events(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, "online");
        assert_eq!(events[1].name, "drain");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_commit_is_not_written_later() {
        let mut log = FileEventLog::open("/dev/full").unwrap();
        log.append("online", ctx(json!({"idset": "0"})), Durability::NoCommit)
            .unwrap();
        assert!(log.append("drain", Map::new(), Durability::Commit).is_err());
        assert_eq!(log.held(), 1);
        assert_eq!(log.held[0].name, "online");

        assert!(log.flush().is_err());
        assert_eq!(log.held(), 1);
        log.held.clear();
    }

    #[test]
    fn test_file_log_flushes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resource.eventlog");
        {
            let mut log = FileEventLog::open(&path).unwrap();
            log.append("restart", ctx(json!({"ranks": "0-3"})), Durability::NoCommit)
                .unwrap();
        }
        let events = FileEventLog::read_events(&path).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].context_str("ranks"), Some("0-3"));
    }
}

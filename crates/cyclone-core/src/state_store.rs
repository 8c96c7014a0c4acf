//! Engine discovery record.
//!
//! A single JSON file at a fixed per-user path names the running engine:
//!
//! ```json
//! {"pid": 4242, "port": 9000, "timestamp": 1700000000000, "version": "0.1.0"}
//! ```
//!
//! Writers replace the file atomically (write a temporary sibling, then
//! rename), so readers see either the old record or the new one. Readers
//! never fail: a missing, unparsable or incomplete file is "no engine".

use crate::error::{Error, Result};
use crate::sys;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// File name of the discovery record inside the cache directory.
pub const STATE_FILE_NAME: &str = "engine-state.json";

/// Where the running engine can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineState {
    pub pid: u32,
    pub port: u16,
    /// Milliseconds since the Unix epoch at write time.
    pub timestamp: u64,
    pub version: String,
}

impl EngineState {
    /// Create a record. The timestamp is assigned by [`StateStore::write`].
    pub fn new(pid: u32, port: u16, version: impl Into<String>) -> Self {
        Self {
            pid,
            port,
            timestamp: 0,
            version: version.into(),
        }
    }

    /// A record is usable only if it names a port and a live process.
    pub fn is_valid(&self) -> bool {
        self.port > 0 && sys::process_alive(self.pid)
    }

    /// True when both records point at the same engine instance.
    pub fn same_endpoint(&self, other: &EngineState) -> bool {
        self.pid == other.pid && self.port == other.port
    }
}

/// Current time in epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Handle to the discovery record.
///
/// Cloning is cheap; clones share the timestamp sequence.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    last_stamp: Arc<AtomicU64>,
    temp_seq: Arc<AtomicU64>,
}

impl StateStore {
    /// Store at the fixed per-user location.
    pub fn new() -> Result<Self> {
        Ok(Self::at(Self::default_path()?))
    }

    /// Store bound to an explicit path for its whole lifetime.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_stamp: Arc::new(AtomicU64::new(0)),
            temp_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The per-user record path (cache directory of the `cyclone` project).
    pub fn default_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = ProjectDirs::from("", "", "cyclone") {
            Ok(proj_dirs.cache_dir().join(STATE_FILE_NAME))
        } else {
            Err(Error::Config("Could not determine cache directory".to_string()))
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `state` with a fresh timestamp and return what was written.
    ///
    /// Timestamps from one store are strictly increasing, so pollers comparing
    /// timestamps never miss two writes landing in the same millisecond.
    pub fn write(&self, state: &EngineState) -> Result<EngineState> {
        let mut record = state.clone();
        record.timestamp = self.next_stamp();

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| STATE_FILE_NAME.to_string());
        let temp_path = dir.join(format!(
            ".{}.{}.{}.tmp",
            file_name,
            std::process::id(),
            self.temp_seq.fetch_add(1, Ordering::Relaxed)
        ));

        let bytes = serde_json::to_vec(&record)?;
        let written = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&temp_path, &self.path)
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        log::debug!(
            "[STATE] Wrote engine record pid={} port={} to {}",
            record.pid,
            record.port,
            self.path.display()
        );
        Ok(record)
    }

    /// The current record if it is complete and names a live engine.
    pub fn read(&self) -> Option<EngineState> {
        let record = self.read_record()?;
        if record.is_valid() {
            Some(record)
        } else {
            log::debug!(
                "[STATE] Ignoring stale engine record pid={} port={}",
                record.pid,
                record.port
            );
            None
        }
    }

    /// The parsed record without the liveness check.
    pub fn read_record(&self) -> Option<EngineState> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::debug!("[STATE] Cannot read {}: {}", self.path.display(), e);
                }
                return None;
            }
        };
        match serde_json::from_str::<EngineState>(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                log::debug!("[STATE] Malformed engine record: {}", e);
                None
            }
        }
    }

    /// Remove the record. Removing a missing record is not an error.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                log::debug!("[STATE] Cleared engine record {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn next_stamp(&self) -> u64 {
        let now = now_ms();
        let mut prev = self.last_stamp.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self.last_stamp.compare_exchange_weak(
                prev,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn temp_store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::at(dir.path().join("cache").join(STATE_FILE_NAME));
        (dir, store)
    }

    #[test]
    fn test_read_missing_is_absent() {
        let (_dir, store) = temp_store();
        assert!(store.read().is_none());
        assert!(store.read_record().is_none());
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, store) = temp_store();
        let written = store
            .write(&EngineState::new(std::process::id(), 9000, "1.2.3"))
            .unwrap();
        assert!(written.timestamp > 0);

        let read = store.read().unwrap();
        assert_eq!(read, written);
        assert_eq!(read.version, "1.2.3");
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let (_dir, store) = temp_store();
        let state = EngineState::new(std::process::id(), 9000, "x");
        let a = store.write(&state).unwrap();
        let b = store.write(&state).unwrap();
        let c = store.clone().write(&state).unwrap();
        assert!(a.timestamp < b.timestamp);
        assert!(b.timestamp < c.timestamp);
    }

    #[test]
    fn test_garbage_and_partial_records_are_absent() {
        let (_dir, store) = temp_store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();

        fs::write(store.path(), "not json").unwrap();
        assert!(store.read().is_none());

        fs::write(store.path(), r#"{"port": 9000, "timestamp": 1, "version": "x"}"#).unwrap();
        assert!(store.read().is_none());

        fs::write(store.path(), r#"{"pid": 1, "timestamp": 1, "version": "x"}"#).unwrap();
        assert!(store.read().is_none());

        fs::write(
            store.path(),
            r#"{"pid": "1234", "port": 9000, "timestamp": 1, "version": "x"}"#,
        )
        .unwrap();
        assert!(store.read().is_none());
    }

    #[test]
    fn test_zero_port_is_invalid() {
        let (_dir, store) = temp_store();
        store
            .write(&EngineState::new(std::process::id(), 0, "x"))
            .unwrap();
        assert!(store.read_record().is_some());
        assert!(store.read().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_pid_is_invalid() {
        let (_dir, store) = temp_store();
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        store.write(&EngineState::new(pid, 9000, "x")).unwrap();
        assert!(store.read().is_none());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let (_dir, store) = temp_store();
        store.clear().unwrap();
        store
            .write(&EngineState::new(std::process::id(), 9000, "x"))
            .unwrap();
        store.clear().unwrap();
        store.clear().unwrap();
        assert!(store.read().is_none());
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let (_dir, store) = temp_store();
        for port in 1..20 {
            store
                .write(&EngineState::new(std::process::id(), port, "x"))
                .unwrap();
        }
        let entries: Vec<_> = fs::read_dir(store.path().parent().unwrap())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec![STATE_FILE_NAME.to_string()]);
    }

    #[test]
    fn test_concurrent_reader_never_sees_torn_record() {
        let (_dir, store) = temp_store();
        let pid = std::process::id();
        store.write(&EngineState::new(pid, 1, "x")).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let reader_store = store.clone();
        let reader_done = done.clone();
        let reader = std::thread::spawn(move || {
            let mut seen = 0usize;
            while !reader_done.load(Ordering::Relaxed) {
                let Ok(raw) = fs::read_to_string(reader_store.path()) else {
                    continue;
                };
                let value: serde_json::Value =
                    serde_json::from_str(&raw).expect("reader observed a partial record");
                let has_port = value.get("port").is_some();
                let has_pid = value.get("pid").is_some();
                assert!(!has_port || has_pid, "port present without pid");
                seen += 1;
            }
            seen
        });

        for port in 1..500u16 {
            store.write(&EngineState::new(pid, port, "x")).unwrap();
        }
        done.store(true, Ordering::Relaxed);
        let seen = reader.join().unwrap();
        assert!(seen > 0);
    }
}

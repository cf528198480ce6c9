//! The State Store (§4.1): a single in-memory snapshot of conversion progress,
//! atomically persisted to disk on every mutation.

use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Disk {
    pub path: String,
    pub progress: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LastMessage {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ThrottlingState {
    pub cpu: Option<String>,
    pub network: Option<String>,
}

/// In-memory-only bookkeeping, stripped before every persist (§3 invariants).
#[derive(Debug, Clone, Default)]
pub struct Internal {
    pub disk_ids: HashMap<String, String>,
    pub display_name: Option<String>,
    pub ports: Vec<String>,
    pub throttling_file: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
    pub v2v_log: Option<PathBuf>,
    pub machine_readable_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StateSnapshot {
    #[serde(default)]
    pub disks: Vec<Disk>,
    #[serde(default)]
    pub disk_count: Option<u32>,
    #[serde(default)]
    pub pid: Option<i32>,
    #[serde(default)]
    pub started: bool,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub return_code: Option<i32>,
    #[serde(default)]
    pub vm_id: Option<String>,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub throttling: ThrottlingState,
}

/// Owns the live snapshot plus the non-persisted bookkeeping, and performs the
/// write-temp-then-rename durable persist. Single-instance in the sense that the
/// Run Controller owns exactly one and threads it explicitly through the monitor
/// loop and the log parser — see DESIGN.md on the "Single-instance State Store" note.
pub struct StateStore {
    snapshot: StateSnapshot,
    pub internal: Internal,
    state_file: PathBuf,
}

impl StateStore {
    pub fn new(state_file: PathBuf) -> Self {
        StateStore {
            snapshot: StateSnapshot::default(),
            internal: Internal {
                state_file: Some(state_file.clone()),
                ..Internal::default()
            },
            state_file,
        }
    }

    pub fn snapshot(&self) -> &StateSnapshot {
        &self.snapshot
    }

    pub fn snapshot_mut(&mut self) -> &mut StateSnapshot {
        &mut self.snapshot
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// Durable persist: serialize the snapshot (never `internal`) to a fresh temp
    /// file in the state file's own directory, then atomically rename it over the
    /// state file. Grounded on the original `State.write()`: temp file created
    /// alongside the target so the rename is same-filesystem and therefore atomic.
    pub fn write(&self) -> Result<()> {
        let dir = self
            .state_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create state directory {}", dir.display()))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".v2v-state-")
            .suffix(".tmp")
            .tempfile_in(dir)
            .context("failed to create temp state file")?;

        let json = serde_json::to_vec_pretty(&self.snapshot).context("failed to serialize state")?;
        tmp.write_all(&json).context("failed to write temp state file")?;
        tmp.flush().context("failed to flush temp state file")?;

        tmp.persist(&self.state_file)
            .map_err(|e| e.error)
            .with_context(|| format!("failed to rename state file into place: {}", self.state_file.display()))?;

        Ok(())
    }

    pub fn read_back(&self) -> Result<StateSnapshot> {
        let file = File::open(&self.state_file)
            .with_context(|| format!("failed to open state file {}", self.state_file.display()))?;
        serde_json::from_reader(file).context("failed to parse state file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_produces_parseable_json_without_internal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v2v-import-tag.state");
        let mut store = StateStore::new(path.clone());
        store.snapshot_mut().disks.push(Disk { path: "/p1".to_string(), progress: 12.5 });
        store.internal.display_name = Some("should-not-appear".to_string());
        store.write().unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("should-not-appear"));
        let read_back = store.read_back().unwrap();
        assert_eq!(read_back.disks[0].progress, 12.5);
    }

    #[test]
    fn test_write_is_idempotent_and_replaces_prior_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v2v-import-tag.state");
        let mut store = StateStore::new(path.clone());
        store.write().unwrap();
        store.snapshot_mut().started = true;
        store.write().unwrap();

        let read_back = store.read_back().unwrap();
        assert!(read_back.started);
    }

    #[test]
    fn test_write_creates_state_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("v2v-import-tag.state");
        let store = StateStore::new(path.clone());
        store.write().unwrap();
        assert!(path.exists());
    }
}

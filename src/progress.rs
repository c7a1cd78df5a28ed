//! Resume history for insert-ignore imports.
//!
//! The history file records a fingerprint of the run configuration plus
//! the input files whose blocks have all settled. A resumed run first
//! verifies the fingerprint (resuming under a different configuration
//! would re-route or re-frame records differently), then skips the files
//! already recorded. Insert-ignore semantics make the replayed remainder
//! idempotent.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{Result, TransferError};

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryRecord {
    fingerprint: String,
    finished_files: Vec<String>,
}

/// On-disk resume journal, one per import run.
#[derive(Debug)]
pub struct ProgressHistory {
    path: PathBuf,
    record: HistoryRecord,
}

impl ProgressHistory {
    /// Stable digest over the parts of the configuration that decide how
    /// records are framed and routed.
    #[must_use]
    pub fn fingerprint(parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Open an existing history (verifying its fingerprint) or start a
    /// fresh one.
    pub fn load_or_create(path: impl Into<PathBuf>, fingerprint: String) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            let text =
                std::fs::read_to_string(&path).map_err(|e| TransferError::io(&path, e))?;
            let record: HistoryRecord = serde_json::from_str(&text).map_err(|e| {
                TransferError::config(format!(
                    "unreadable resume history {}: {e}",
                    path.display()
                ))
            })?;
            if record.fingerprint != fingerprint {
                return Err(TransferError::config(format!(
                    "resume history {} was written by a run with a different configuration",
                    path.display()
                )));
            }
            info!(
                finished = record.finished_files.len(),
                "resuming from history"
            );
            Ok(Self { path, record })
        } else {
            Ok(Self {
                path,
                record: HistoryRecord {
                    fingerprint,
                    finished_files: Vec::new(),
                },
            })
        }
    }

    #[must_use]
    pub fn is_finished(&self, file: &Path) -> bool {
        let name = file.display().to_string();
        self.record.finished_files.iter().any(|f| *f == name)
    }

    /// Record a fully settled file and persist immediately.
    pub fn record_finished(&mut self, file: &Path) -> Result<()> {
        let name = file.display().to_string();
        if !self.record.finished_files.contains(&name) {
            self.record.finished_files.push(name);
            self.persist()?;
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.record)
            .map_err(|e| TransferError::config(format!("serialize resume history: {e}")))?;
        std::fs::write(&self.path, text).map_err(|e| TransferError::io(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_round_trips_finished_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let fp = ProgressHistory::fingerprint(&["users", ","]);

        let mut history = ProgressHistory::load_or_create(&path, fp.clone()).unwrap();
        history.record_finished(Path::new("users_0")).unwrap();
        history.record_finished(Path::new("users_1")).unwrap();

        let reloaded = ProgressHistory::load_or_create(&path, fp).unwrap();
        assert!(reloaded.is_finished(Path::new("users_0")));
        assert!(reloaded.is_finished(Path::new("users_1")));
        assert!(!reloaded.is_finished(Path::new("users_2")));
    }

    #[test]
    fn fingerprint_mismatch_refuses_to_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let mut history =
            ProgressHistory::load_or_create(&path, ProgressHistory::fingerprint(&["a"]))
                .unwrap();
        history.record_finished(Path::new("a_0")).unwrap();

        let err = ProgressHistory::load_or_create(&path, ProgressHistory::fingerprint(&["b"]))
            .unwrap_err();
        assert!(matches!(err, TransferError::Config(_)));
    }

    #[test]
    fn fingerprint_separates_adjacent_parts() {
        assert_ne!(
            ProgressHistory::fingerprint(&["ab", "c"]),
            ProgressHistory::fingerprint(&["a", "bc"])
        );
    }
}

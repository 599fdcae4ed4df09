use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::fingerprint::FileTuple;
use crate::review_schema::{Finding, GeneratedTest};

/// What the last run recorded for one change.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ChangeRecord {
    pub fingerprint: String,
    #[serde(default)]
    pub updated_at: u64,
    #[serde(default)]
    pub files: Vec<FileTuple>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub generated_tests: Vec<GeneratedTest>,
}

impl ChangeRecord {
    pub fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// Key-value store of change records, keyed by change identifier.
///
/// Missing or unreadable entries load as `None`; they are never fatal.
pub trait StateStore: Send + Sync {
    fn load(&self, change_id: &str) -> Option<ChangeRecord>;
    fn save(&self, change_id: &str, record: &ChangeRecord) -> Result<()>;
}

/// Manages local state persisted as one TOML file per change in
/// `.diffsweep/state/`.
pub struct StateManager {
    state_dir: PathBuf,
}

impl StateManager {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    /// Default state directory relative to a repo root.
    pub fn default_dir(repo_root: &Path) -> PathBuf {
        repo_root.join(".diffsweep").join("state")
    }

    fn record_file(&self, change_id: &str) -> PathBuf {
        self.state_dir
            .join(format!("{}.toml", sanitize_change_id(change_id)))
    }
}

impl StateStore for StateManager {
    fn load(&self, change_id: &str) -> Option<ChangeRecord> {
        let path = self.record_file(change_id);
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(&path) {
            Ok(content) => match toml::from_str::<ChangeRecord>(&content) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("corrupted state file {}: {e}, ignoring", path.display());
                    None
                }
            },
            Err(e) => {
                warn!("failed to read state file {}: {e}, ignoring", path.display());
                None
            }
        }
    }

    fn save(&self, change_id: &str, record: &ChangeRecord) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir)
            .map_err(|e| Error::State(format!("failed to create state dir: {e}")))?;

        let content = toml::to_string_pretty(record)
            .map_err(|e| Error::State(format!("failed to serialize state: {e}")))?;

        std::fs::write(self.record_file(change_id), content)
            .map_err(|e| Error::State(format!("failed to write state file: {e}")))?;

        Ok(())
    }
}

/// Map a change id onto a safe file stem.
fn sanitize_change_id(change_id: &str) -> String {
    let cleaned: String = change_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::make_finding;
    use tempfile::TempDir;

    fn test_manager() -> (TempDir, StateManager) {
        let dir = TempDir::new().unwrap();
        let mgr = StateManager::new(dir.path().join("state"));
        (dir, mgr)
    }

    fn sample_record() -> ChangeRecord {
        let mut finding = make_finding("src/main.rs");
        finding.snippet = Some("let x = y.unwrap();".to_string());
        ChangeRecord {
            fingerprint: "ab".repeat(32),
            updated_at: 1700000000,
            files: vec![FileTuple {
                path: "src/main.rs".to_string(),
                additions: 3,
                deletions: 1,
            }],
            findings: vec![finding, make_finding("src/lib.rs")],
            generated_tests: vec![GeneratedTest {
                file: "tests/it.rs".to_string(),
                content: "#[test]\nfn it() {}\n".to_string(),
                description: String::new(),
                scenario: "smoke".to_string(),
                verified: Some(true),
            }],
        }
    }

    #[test]
    fn test_load_missing_returns_none() {
        let (_dir, mgr) = test_manager();
        assert!(mgr.load("pr-1").is_none());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let (_dir, mgr) = test_manager();
        let record = sample_record();
        mgr.save("pr-5", &record).unwrap();
        assert_eq!(mgr.load("pr-5"), Some(record));
    }

    #[test]
    fn test_corrupted_state_returns_none() {
        let (_dir, mgr) = test_manager();
        std::fs::create_dir_all(mgr.state_dir.clone()).unwrap();
        std::fs::write(mgr.record_file("pr-5"), "this is not valid toml [[[").unwrap();
        assert!(mgr.load("pr-5").is_none());
    }

    #[test]
    fn test_records_are_keyed_by_change() {
        let (_dir, mgr) = test_manager();
        mgr.save("pr-1", &sample_record()).unwrap();
        assert!(mgr.load("pr-1").is_some());
        assert!(mgr.load("pr-2").is_none());
    }

    #[test]
    fn test_state_survives_reload() {
        let dir = TempDir::new().unwrap();
        let state_path = dir.path().join("state");

        {
            let mgr = StateManager::new(&state_path);
            mgr.save("owner/repo#10", &sample_record()).unwrap();
        }

        {
            let mgr = StateManager::new(&state_path);
            let record = mgr.load("owner/repo#10").unwrap();
            assert_eq!(record.findings.len(), 2);
        }
    }

    #[test]
    fn test_state_file_is_valid_toml() {
        let (_dir, mgr) = test_manager();
        mgr.save("pr-5", &sample_record()).unwrap();

        let content = std::fs::read_to_string(mgr.record_file("pr-5")).unwrap();
        let _: toml::Value = toml::from_str(&content).unwrap();
    }

    #[test]
    fn test_sanitize_change_id() {
        assert_eq!(sanitize_change_id("owner/repo#12"), "owner_repo_12");
        assert_eq!(sanitize_change_id("../../etc"), "_.._etc");
        assert_eq!(sanitize_change_id(""), "default");
    }
}

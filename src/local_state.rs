use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decision::{SyncActionType, SyncStatus};
use crate::models::{FileMetadata, RelativePath};

/// Per-path record of the last sync outcome. Entries are never removed; a
/// deleted file keeps its entry with `last_synced_metadata = None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStateEntry {
    pub last_synced_metadata: Option<FileMetadata>,
    pub last_status: SyncStatus,
    pub last_action: SyncActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    states: BTreeMap<RelativePath, LocalStateEntry>,
}

/// Durable mapping from relative path to last-synced metadata, owned
/// exclusively by the running sync manager. Every mutation is followed by
/// an atomic rewrite (same-dir temp file + rename).
#[derive(Debug)]
pub struct LocalState {
    path: PathBuf,
    states: BTreeMap<RelativePath, LocalStateEntry>,
}

impl LocalState {
    /// Load the state file, initializing an empty one if it does not exist
    /// yet. A file that exists but fails to parse is a fatal startup error.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }

        let states = if path.exists() {
            let data = fs::read_to_string(path)
                .with_context(|| format!("read local state {}", path.display()))?;
            let persisted: PersistedState = serde_json::from_str(&data)
                .with_context(|| format!("corrupt local state file {}", path.display()))?;
            persisted.states
        } else {
            BTreeMap::new()
        };

        let state = Self {
            path: path.to_path_buf(),
            states,
        };
        if !path.exists() {
            state.save()?;
        }
        Ok(state)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, path: &RelativePath) -> Option<&LocalStateEntry> {
        self.states.get(path)
    }

    pub fn last_synced(&self, path: &RelativePath) -> Option<&FileMetadata> {
        self.states
            .get(path)
            .and_then(|e| e.last_synced_metadata.as_ref())
    }

    pub fn contains(&self, path: &RelativePath) -> bool {
        self.states.contains_key(path)
    }

    pub fn all_paths(&self) -> BTreeSet<RelativePath> {
        self.states.keys().cloned().collect()
    }

    /// Record a successful sync: status Ok, message cleared.
    pub fn insert_synced_file(
        &mut self,
        path: &RelativePath,
        state: Option<FileMetadata>,
        action: SyncActionType,
    ) -> Result<()> {
        self.states.insert(
            path.clone(),
            LocalStateEntry {
                last_synced_metadata: state,
                last_status: SyncStatus::Ok,
                last_action: action,
                last_message: None,
                last_updated: Utc::now(),
            },
        );
        self.save()
    }

    /// Record an outcome without touching the last-synced metadata.
    pub fn insert_status_info(
        &mut self,
        path: &RelativePath,
        status: SyncStatus,
        action: SyncActionType,
        message: Option<String>,
    ) -> Result<()> {
        let previous_metadata = self
            .states
            .get(path)
            .and_then(|e| e.last_synced_metadata.clone());
        self.states.insert(
            path.clone(),
            LocalStateEntry {
                last_synced_metadata: previous_metadata,
                last_status: status,
                last_action: action,
                last_message: message,
                last_updated: Utc::now(),
            },
        );
        self.save()
    }

    fn save(&self) -> Result<()> {
        let persisted = PersistedState {
            states: self.states.clone(),
        };
        let data = serde_json::to_vec_pretty(&persisted).context("serialize local state")?;

        let Some(parent) = self.path.parent() else {
            anyhow::bail!("local state path has no parent: {}", self.path.display());
        };
        let fname = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("local_state.db");
        let tmp = parent.join(format!(".{}.tmp-{}", fname, uuid::Uuid::new_v4()));

        fs::write(&tmp, &data).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn make_temp_dir(prefix: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("{prefix}-{nanos}"));
        fs::create_dir_all(&root).unwrap();
        root
    }

    fn meta(path: &str, hash: &str) -> FileMetadata {
        FileMetadata {
            path: RelativePath::new(path).unwrap(),
            hash: hash.to_string(),
            signature: String::new(),
            size: 1,
            last_modified: Utc::now(),
        }
    }

    #[test]
    fn load_or_init_creates_the_state_file() {
        let root = make_temp_dir("syftbox-sync-state-init");
        let path = root.join("plugins/sync/local_state.db");
        let state = LocalState::load_or_init(&path).unwrap();
        assert!(path.is_file());
        assert!(state.all_paths().is_empty());
    }

    #[test]
    fn mutations_persist_across_reload() {
        let root = make_temp_dir("syftbox-sync-state-persist");
        let path = root.join("local_state.db");
        let rel = RelativePath::new("a@x.com/f.txt").unwrap();

        let mut state = LocalState::load_or_init(&path).unwrap();
        state
            .insert_synced_file(&rel, Some(meta("a@x.com/f.txt", "h1")), SyncActionType::CreateRemote)
            .unwrap();

        let reloaded = LocalState::load_or_init(&path).unwrap();
        let entry = reloaded.get(&rel).unwrap();
        assert_eq!(entry.last_status, SyncStatus::Ok);
        assert_eq!(entry.last_action, SyncActionType::CreateRemote);
        assert_eq!(entry.last_synced_metadata.as_ref().unwrap().hash, "h1");
        assert!(entry.last_message.is_none());
    }

    #[test]
    fn insert_status_keeps_last_synced_metadata() {
        let root = make_temp_dir("syftbox-sync-state-status");
        let path = root.join("local_state.db");
        let rel = RelativePath::new("a@x.com/f.txt").unwrap();

        let mut state = LocalState::load_or_init(&path).unwrap();
        state
            .insert_synced_file(&rel, Some(meta("a@x.com/f.txt", "h1")), SyncActionType::CreateRemote)
            .unwrap();
        state
            .insert_status_info(
                &rel,
                SyncStatus::Error,
                SyncActionType::ModifyRemote,
                Some("connection reset".to_string()),
            )
            .unwrap();

        let entry = state.get(&rel).unwrap();
        assert_eq!(entry.last_status, SyncStatus::Error);
        assert_eq!(entry.last_message.as_deref(), Some("connection reset"));
        // metadata still reflects the last successful sync
        assert_eq!(entry.last_synced_metadata.as_ref().unwrap().hash, "h1");
    }

    #[test]
    fn deleted_entry_keeps_a_tombstone() {
        let root = make_temp_dir("syftbox-sync-state-delete");
        let path = root.join("local_state.db");
        let rel = RelativePath::new("a@x.com/f.txt").unwrap();

        let mut state = LocalState::load_or_init(&path).unwrap();
        state
            .insert_synced_file(&rel, Some(meta("a@x.com/f.txt", "h1")), SyncActionType::CreateRemote)
            .unwrap();
        state
            .insert_synced_file(&rel, None, SyncActionType::DeleteRemote)
            .unwrap();

        let entry = state.get(&rel).unwrap();
        assert!(entry.last_synced_metadata.is_none());
        assert_eq!(entry.last_action, SyncActionType::DeleteRemote);
        assert!(state.contains(&rel));
    }

    #[test]
    fn corrupt_state_file_fails_loudly() {
        let root = make_temp_dir("syftbox-sync-state-corrupt");
        let path = root.join("local_state.db");
        fs::write(&path, b"{ this is not json").unwrap();

        let err = LocalState::load_or_init(&path).unwrap_err();
        assert!(err.to_string().contains("corrupt local state file"));
    }

    #[test]
    fn no_stray_temp_files_after_save() {
        let root = make_temp_dir("syftbox-sync-state-tmp");
        let path = root.join("local_state.db");
        let rel = RelativePath::new("a@x.com/f.txt").unwrap();

        let mut state = LocalState::load_or_init(&path).unwrap();
        for i in 0..5 {
            state
                .insert_synced_file(
                    &rel,
                    Some(meta("a@x.com/f.txt", &format!("h{i}"))),
                    SyncActionType::ModifyRemote,
                )
                .unwrap();
        }

        let leftovers: Vec<_> = fs::read_dir(&root)
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }
}

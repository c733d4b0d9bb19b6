use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::models::{metadata_equal, FileMetadata, RelativePath};
use crate::perms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOperation {
    Noop,
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSide {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncActionType {
    Noop,
    CreateLocal,
    CreateRemote,
    ModifyLocal,
    ModifyRemote,
    DeleteLocal,
    DeleteRemote,
}

impl fmt::Display for SyncActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncActionType::Noop => "NOOP",
            SyncActionType::CreateLocal => "CREATE_LOCAL",
            SyncActionType::CreateRemote => "CREATE_REMOTE",
            SyncActionType::ModifyLocal => "MODIFY_LOCAL",
            SyncActionType::ModifyRemote => "MODIFY_REMOTE",
            SyncActionType::DeleteLocal => "DELETE_LOCAL",
            SyncActionType::DeleteRemote => "DELETE_REMOTE",
        };
        f.write_str(name)
    }
}

/// One side's share of a sync decision. Short-lived: built, validated,
/// executed and recorded within a single queue iteration.
#[derive(Debug, Clone)]
pub struct SyncDecision {
    pub operation: SyncOperation,
    pub side_to_update: SyncSide,
    pub local_state: Option<FileMetadata>,
    pub remote_state: Option<FileMetadata>,
    pub executed: bool,
    pub message: Option<String>,
}

impl SyncDecision {
    pub fn noop(
        local_state: Option<FileMetadata>,
        remote_state: Option<FileMetadata>,
    ) -> Self {
        Self {
            operation: SyncOperation::Noop,
            side_to_update: SyncSide::Local,
            local_state,
            remote_state,
            executed: false,
            message: None,
        }
    }

    /// Assumes at least one of the states is modified. The operation falls
    /// out of which states are absent: deleting when the source of truth is
    /// gone, creating when the side being updated lacks the file, modifying
    /// otherwise.
    pub fn from_modified_states(
        local_state: Option<FileMetadata>,
        remote_state: Option<FileMetadata>,
        side_to_update: SyncSide,
    ) -> Self {
        let delete = match side_to_update {
            SyncSide::Remote => local_state.is_none(),
            SyncSide::Local => remote_state.is_none(),
        };
        let create = match side_to_update {
            SyncSide::Remote => remote_state.is_none(),
            SyncSide::Local => local_state.is_none(),
        };

        let operation = if delete {
            SyncOperation::Delete
        } else if create {
            SyncOperation::Create
        } else {
            SyncOperation::Modify
        };

        Self {
            operation,
            side_to_update,
            local_state,
            remote_state,
            executed: false,
            message: None,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.operation == SyncOperation::Noop
    }

    pub fn action_type(&self) -> SyncActionType {
        match (self.operation, self.side_to_update) {
            (SyncOperation::Noop, _) => SyncActionType::Noop,
            (SyncOperation::Create, SyncSide::Local) => SyncActionType::CreateLocal,
            (SyncOperation::Create, SyncSide::Remote) => SyncActionType::CreateRemote,
            (SyncOperation::Modify, SyncSide::Local) => SyncActionType::ModifyLocal,
            (SyncOperation::Modify, SyncSide::Remote) => SyncActionType::ModifyRemote,
            (SyncOperation::Delete, SyncSide::Local) => SyncActionType::DeleteLocal,
            (SyncOperation::Delete, SyncSide::Remote) => SyncActionType::DeleteRemote,
        }
    }

    pub fn path(&self) -> Option<&RelativePath> {
        self.local_state
            .as_ref()
            .or(self.remote_state.as_ref())
            .map(|m| &m.path)
    }

    /// Validation gates applied before execution. `Err` carries the reason;
    /// invalid decisions are skipped, not failed.
    pub fn check_valid(&self, abs_path: &Path, max_file_size_bytes: u64) -> Result<(), String> {
        if matches!(self.operation, SyncOperation::Noop | SyncOperation::Delete) {
            return Ok(());
        }
        match self.side_to_update {
            SyncSide::Remote => {
                let Some(local) = &self.local_state else {
                    return Err(format!(
                        "attempted to sync {} to remote, but local file data is missing",
                        abs_path.display()
                    ));
                };
                // Never push an invalid permission file; modifications and
                // deletions stay allowed even when the local copy is corrupt.
                if perms::is_permission_file(abs_path) && !perms::is_valid(abs_path) {
                    return Err(format!(
                        "invalid permission file {}, it will not be synced to remote",
                        abs_path.display()
                    ));
                }
                if local.size > max_file_size_bytes {
                    return Err(format!(
                        "file {} is larger than {} bytes, it will not be synced to remote",
                        abs_path.display(),
                        max_file_size_bytes
                    ));
                }
                Ok(())
            }
            SyncSide::Local => {
                let Some(remote) = &self.remote_state else {
                    return Err(format!(
                        "attempted to sync {} to local, but remote file data is missing",
                        abs_path.display()
                    ));
                };
                if remote.size > max_file_size_bytes {
                    return Err(format!(
                        "file {} is larger than {} bytes, it will not be synced to local",
                        abs_path.display(),
                        max_file_size_bytes
                    ));
                }
                Ok(())
            }
        }
    }
}

/// The pair of per-side decisions for one path. At most one side is
/// non-NOOP.
#[derive(Debug, Clone)]
pub struct SyncDecisionPair {
    pub local: SyncDecision,
    pub remote: SyncDecision,
}

impl SyncDecisionPair {
    /// The decision engine. Total over every combination of present/absent
    /// metadata; equality is hash equality.
    pub fn from_states(
        current_local: Option<FileMetadata>,
        previous_local: Option<FileMetadata>,
        current_remote: Option<FileMetadata>,
    ) -> Self {
        let local_modified = !metadata_equal(current_local.as_ref(), previous_local.as_ref());
        let remote_modified = !metadata_equal(previous_local.as_ref(), current_remote.as_ref());
        let in_sync = metadata_equal(current_remote.as_ref(), current_local.as_ref());
        let conflict = local_modified && remote_modified && !in_sync;

        let noop = || SyncDecision::noop(current_local.clone(), current_remote.clone());

        if in_sync {
            return Self {
                local: noop(),
                remote: noop(),
            };
        }

        if conflict {
            // Server wins: its state was written earlier and is globally
            // visible; overwrite local with the remote state.
            return Self {
                remote: noop(),
                local: SyncDecision::from_modified_states(
                    current_local,
                    current_remote,
                    SyncSide::Local,
                ),
            };
        }

        if local_modified {
            Self {
                local: noop(),
                remote: SyncDecision::from_modified_states(
                    current_local,
                    current_remote,
                    SyncSide::Remote,
                ),
            }
        } else {
            Self {
                remote: noop(),
                local: SyncDecision::from_modified_states(
                    current_local,
                    current_remote,
                    SyncSide::Local,
                ),
            }
        }
    }

    pub fn is_noop(&self) -> bool {
        self.local.is_noop() && self.remote.is_noop()
    }

    pub fn is_executed(&self) -> bool {
        self.local.executed && self.remote.executed
    }

    /// Metadata to record as last-synced once both sides executed: the
    /// remote state for any pair that touched something, the unchanged
    /// local state for a local NOOP.
    pub fn result_local_state(&self) -> Option<FileMetadata> {
        if self.local.is_noop() {
            self.local.local_state.clone()
        } else {
            self.local.remote_state.clone()
        }
    }

    /// The action worth recording: the local one unless it is a NOOP.
    pub fn action(&self) -> SyncActionType {
        let local_action = self.local.action_type();
        if local_action != SyncActionType::Noop {
            local_action
        } else {
            self.remote.action_type()
        }
    }

    pub fn path(&self) -> Option<&RelativePath> {
        self.local.path().or_else(|| self.remote.path())
    }

    pub fn info_message(&self) -> String {
        let mut parts = Vec::new();
        for decision in [&self.local, &self.remote] {
            if !decision.is_noop() {
                if let Some(path) = decision.path() {
                    parts.push(format!("syncing {} as {}", path, decision.action_type()));
                }
            }
        }
        if parts.is_empty() {
            "noop".to_string()
        } else {
            parts.join(". ")
        }
    }
}

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use std::fs;

use anyhow::{anyhow, Context, Result};
use thiserror::Error;

use crate::client::{ApiError, SyncClient};
use crate::datasite::DatasiteState;
use crate::decision::{SyncActionType, SyncDecision, SyncDecisionPair, SyncStatus};
use crate::delta;
use crate::filters::SyncIgnoreList;
use crate::hash::{hash_bytes, hash_file, HashError};
use crate::local_state::LocalState;
use crate::models::{FileMetadata, RelativePath};
use crate::queue::{FileChangeInfo, SyncQueue};

/// The only error kind that propagates past the consumer: the sync
/// environment itself is broken and the loop must stop.
#[derive(Debug, Error)]
#[error("sync environment broken: {0}")]
pub struct FatalSyncError(pub String);

/// Executes sync decisions and records their outcomes in the local state.
pub struct SyncConsumer {
    client: SyncClient,
    queue: Arc<SyncQueue>,
    local_state: LocalState,
    datasites_root: PathBuf,
    max_file_size_bytes: u64,
}

impl SyncConsumer {
    pub fn new(
        client: SyncClient,
        queue: Arc<SyncQueue>,
        local_state: LocalState,
        datasites_root: PathBuf,
        max_file_size_bytes: u64,
    ) -> Self {
        Self {
            client,
            queue,
            local_state,
            datasites_root,
            max_file_size_bytes,
        }
    }

    pub fn local_state(&self) -> &LocalState {
        &self.local_state
    }

    /// The datasites root and the state file are owned by this process; if
    /// either disappears, something else is mutating the workspace and
    /// continuing would corrupt it.
    pub fn validate_sync_environment(&self) -> Result<(), FatalSyncError> {
        if !self.datasites_root.is_dir() {
            return Err(FatalSyncError(
                "the datasites folder has been deleted by a different process".to_string(),
            ));
        }
        if !self.local_state.path().is_file() {
            return Err(FatalSyncError(
                "the previous sync state has been deleted by a different process".to_string(),
            ));
        }
        Ok(())
    }

    /// Drain the queue. Per-item failures are logged and retried next tick;
    /// only [`FatalSyncError`] interrupts the drain.
    pub async fn consume_all(&mut self) -> Result<(), FatalSyncError> {
        while !self.queue.is_empty() {
            self.validate_sync_environment()?;
            let item = match self.queue.get(Duration::from_millis(100)) {
                Ok(item) => item,
                Err(_) => break,
            };
            self.process_filechange(&item).await?;
        }
        Ok(())
    }

    pub async fn process_filechange(
        &mut self,
        item: &FileChangeInfo,
    ) -> Result<(), FatalSyncError> {
        let mut pair = match self.get_decisions(item).await {
            Ok(pair) => pair,
            Err(e) => {
                crate::logging::error(format!(
                    "failed to sync {}, it will be retried in the next sync: {e:#}",
                    item.path
                ));
                return Ok(());
            }
        };

        if !pair.is_noop() {
            crate::logging::info(pair.info_message());
        }

        // No changes once the environment is gone.
        self.validate_sync_environment()?;
        self.execute_side(&mut pair, item, true).await;
        self.execute_side(&mut pair, item, false).await;

        self.write_to_local_state(item, &pair)
    }

    async fn execute_side(&self, pair: &mut SyncDecisionPair, item: &FileChangeInfo, local: bool) {
        let decision = if local { &mut pair.local } else { &mut pair.remote };
        match decision.check_valid(&item.local_abs_path, self.max_file_size_bytes) {
            Ok(()) => self.execute_decision(decision).await,
            Err(reason) => {
                crate::logging::warn(&reason);
                decision.message = Some(reason);
            }
        }
    }

    async fn execute_decision(&self, decision: &mut SyncDecision) {
        let result = match decision.action_type() {
            SyncActionType::Noop => Ok(()),
            SyncActionType::CreateRemote => self.create_remote(decision).await,
            SyncActionType::CreateLocal => self.create_local(decision).await,
            SyncActionType::ModifyRemote => self.update_remote(decision).await,
            SyncActionType::ModifyLocal => self.update_local(decision).await,
            SyncActionType::DeleteRemote => self.delete_remote(decision).await,
            SyncActionType::DeleteLocal => self.delete_local(decision),
        };
        match result {
            Ok(()) => decision.executed = true,
            Err(e) => {
                decision.executed = false;
                decision.message = Some(format!("{e:#}"));
                if let Some(path) = decision.path() {
                    crate::logging::error(format!(
                        "failed to sync {path}, it will be retried in the next sync: {e:#}"
                    ));
                }
            }
        }
    }

    async fn create_remote(&self, decision: &SyncDecision) -> Result<()> {
        let local = required(&decision.local_state, "local")?;
        let abs = local.path.to_fs_path(&self.datasites_root);
        let data = fs::read(&abs).with_context(|| format!("read {}", abs.display()))?;
        self.client.create(&local.path, data).await?;
        Ok(())
    }

    async fn create_local(&self, decision: &SyncDecision) -> Result<()> {
        let remote = required(&decision.remote_state, "remote")?;
        let data = self.client.download(&remote.path).await?;
        let abs = remote.path.to_fs_path(&self.datasites_root);
        write_file_atomic(&abs, &data)?;
        Ok(())
    }

    /// Push a local modification: diff against the remote signature, have
    /// the server apply it and verify it lands on the local content hash.
    async fn update_remote(&self, decision: &SyncDecision) -> Result<()> {
        let local = required(&decision.local_state, "local")?;
        let remote = required(&decision.remote_state, "remote")?;
        let abs = local.path.to_fs_path(&self.datasites_root);
        let data = fs::read(&abs).with_context(|| format!("read {}", abs.display()))?;

        let signature = remote.signature_bytes()?;
        let diff = delta::diff(&signature, &data)?;
        let resp = self
            .client
            .apply_diff(&local.path, &diff, &local.hash)
            .await?;
        if resp.current_hash != local.hash {
            return Err(anyhow!(
                "server applied diff to unexpected hash {}",
                resp.current_hash
            ));
        }
        Ok(())
    }

    /// Pull a remote modification: fetch the diff against our signature,
    /// patch the local bytes, verify the server-supplied hash, replace
    /// atomically.
    async fn update_local(&self, decision: &SyncDecision) -> Result<()> {
        let local = required(&decision.local_state, "local")?;
        let resp = self.client.get_diff(&local.path, &local.signature).await?;

        let abs = local.path.to_fs_path(&self.datasites_root);
        let data = fs::read(&abs).with_context(|| format!("read {}", abs.display()))?;
        let new_data = delta::apply(&data, &resp.diff_bytes()?)?;
        let new_hash = hash_bytes(&new_data);
        if new_hash != resp.hash {
            return Err(anyhow!(
                "hash mismatch after applying diff: got {new_hash}, expected {}",
                resp.hash
            ));
        }

        write_file_atomic(&abs, &new_data)?;
        Ok(())
    }

    async fn delete_remote(&self, decision: &SyncDecision) -> Result<()> {
        let remote = required(&decision.remote_state, "remote")?;
        self.client.delete(&remote.path).await?;
        Ok(())
    }

    fn delete_local(&self, decision: &SyncDecision) -> Result<()> {
        let local = required(&decision.local_state, "local")?;
        let abs = local.path.to_fs_path(&self.datasites_root);
        if abs.exists() {
            fs::remove_file(&abs).with_context(|| format!("remove {}", abs.display()))?;
        }
        Ok(())
    }

    /// Batch-download every remote path with no local state entry yet.
    /// Failure is not fatal: the per-path flow picks the files up one by
    /// one on later ticks.
    pub async fn download_all_missing(
        &mut self,
        datasite_states: &[DatasiteState],
        ignore: &SyncIgnoreList,
    ) -> Result<(), FatalSyncError> {
        let mut missing: Vec<RelativePath> = Vec::new();
        for datasite in datasite_states {
            for file in &datasite.remote_state {
                if self.local_state.contains(&file.path) {
                    continue;
                }
                if ignore.should_ignore_rel(Path::new(file.path.as_str()), false) {
                    continue;
                }
                missing.push(file.path.clone());
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        crate::logging::info(format!("downloading {} files in batch", missing.len()));
        let received = match self.create_local_batch(&missing).await {
            Ok(received) => received,
            Err(e) => {
                crate::logging::error(format!(
                    "failed to download missing files, they will be downloaded individually instead: {e:#}"
                ));
                return Ok(());
            }
        };

        for path in received {
            let state = match self.get_current_local_syncstate(&path) {
                Ok(state) => state,
                Err(e) => {
                    crate::logging::error(format!("failed to hash downloaded file {path}: {e:#}"));
                    continue;
                }
            };
            self.local_state
                .insert_synced_file(&path, state, SyncActionType::CreateLocal)
                .map_err(|e| FatalSyncError(format!("persist local state: {e:#}")))?;
        }
        Ok(())
    }

    async fn create_local_batch(&self, paths: &[RelativePath]) -> Result<Vec<RelativePath>> {
        let bytes = self.client.download_bulk(paths).await?;
        extract_zip_archive(&bytes, &self.datasites_root)
    }

    async fn get_decisions(&self, item: &FileChangeInfo) -> Result<SyncDecisionPair> {
        let current_local = self.get_current_local_syncstate(&item.path)?;
        let previous_local = self.local_state.last_synced(&item.path).cloned();
        let current_remote = self.get_current_remote_syncstate(&item.path).await?;

        Ok(SyncDecisionPair::from_states(
            current_local,
            previous_local,
            current_remote,
        ))
    }

    fn get_current_local_syncstate(&self, path: &RelativePath) -> Result<Option<FileMetadata>> {
        let abs = path.to_fs_path(&self.datasites_root);
        match hash_file(&abs, &self.datasites_root) {
            Ok(meta) => Ok(Some(meta)),
            Err(HashError::FileNotFound(_)) | Err(HashError::NotAFile(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// A missing remote path is a remote delete; anything else bubbles up
    /// as a transient error for this path.
    async fn get_current_remote_syncstate(
        &self,
        path: &RelativePath,
    ) -> Result<Option<FileMetadata>> {
        match self.client.get_metadata(path).await {
            Ok(meta) => Ok(Some(meta)),
            Err(ApiError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_to_local_state(
        &mut self,
        item: &FileChangeInfo,
        pair: &SyncDecisionPair,
    ) -> Result<(), FatalSyncError> {
        if pair.is_noop() {
            return Ok(());
        }

        let result = if pair.is_executed() {
            self.local_state
                .insert_synced_file(&item.path, pair.result_local_state(), pair.action())
        } else {
            let decision = if !pair.local.is_noop() {
                &pair.local
            } else {
                &pair.remote
            };
            self.local_state.insert_status_info(
                &item.path,
                SyncStatus::Error,
                decision.action_type(),
                decision.message.clone(),
            )
        };
        result.map_err(|e| FatalSyncError(format!("persist local state: {e:#}")))
    }
}

fn required<'a>(state: &'a Option<FileMetadata>, side: &str) -> Result<&'a FileMetadata> {
    state
        .as_ref()
        .ok_or_else(|| anyhow!("decision is missing {side} metadata"))
}

/// Replace `target` atomically: write a hidden temp file beside it, then
/// rename over the real path.
pub fn write_file_atomic(target: &Path, data: &[u8]) -> Result<()> {
    let Some(parent) = target.parent() else {
        anyhow::bail!("target has no parent: {}", target.display());
    };
    fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;

    let fname = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("download");
    let tmp = parent.join(format!(".{}.tmp-{}", fname, uuid::Uuid::new_v4()));
    fs::write(&tmp, data).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, target)
        .with_context(|| format!("rename {} -> {}", tmp.display(), target.display()))?;
    Ok(())
}

/// Extract a bulk-download archive under `root`, returning the extracted
/// paths. Entries that do not validate as relative paths are skipped.
pub fn extract_zip_archive(bytes: &[u8], root: &Path) -> Result<Vec<RelativePath>> {
    let mut archive =
        zip::ZipArchive::new(std::io::Cursor::new(bytes)).context("open zip archive")?;
    let mut received = Vec::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).context("read zip entry")?;
        if file.is_dir() {
            continue;
        }
        let name = file.name().to_string();
        let Ok(rel) = RelativePath::new(&name) else {
            crate::logging::warn(format!("skipping invalid archive entry {name}"));
            continue;
        };
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)
            .with_context(|| format!("read zip entry {name}"))?;
        write_file_atomic(&rel.to_fs_path(root), &data)?;
        received.push(rel);
    }
    Ok(received)
}

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::filters::SyncIgnoreList;
use crate::hash::hash_file;
use crate::models::{FileMetadata, RelativePath};
use crate::perms;
use crate::queue::{FileChangeInfo, PRIORITY_PERMISSION_FILE, PRIORITY_REGULAR_FILE};

/// One datasite as seen from this client: its owner and the server's
/// metadata snapshot for it.
#[derive(Debug, Clone)]
pub struct DatasiteState {
    pub email: String,
    pub remote_state: Vec<FileMetadata>,
}

#[derive(Clone, Debug)]
struct ScanCacheEntry {
    size: u64,
    mtime_nanos: u128,
    metadata: FileMetadata,
}

/// Walks datasite trees and hashes files, reusing hashes for files whose
/// size and mtime have not changed since the previous scan.
#[derive(Default)]
pub struct LocalScanner {
    last_state: HashMap<RelativePath, ScanCacheEntry>,
}

impl LocalScanner {
    pub fn scan_datasite(
        &mut self,
        datasites_root: &Path,
        email: &str,
        ignore: &SyncIgnoreList,
    ) -> Result<HashMap<RelativePath, FileMetadata>> {
        let mut out = HashMap::new();
        let datasite_root = datasites_root.join(email);
        if !datasite_root.exists() {
            return Ok(out);
        }

        for entry in WalkDir::new(&datasite_root).into_iter().filter_map(|e| e.ok()) {
            let ftype = entry.file_type();
            if ftype.is_dir() || ftype.is_symlink() {
                continue;
            }
            let abs = entry.path();
            let rel = abs
                .strip_prefix(datasites_root)
                .with_context(|| format!("strip prefix {}", abs.display()))?;
            if ignore.should_ignore_rel(rel, false) {
                continue;
            }
            let Ok(rel_path) = RelativePath::new(rel.to_string_lossy().replace('\\', "/")) else {
                continue;
            };

            let fs_meta = entry.metadata()?;
            let size = fs_meta.len();
            let mtime_nanos = fs_meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_nanos())
                .unwrap_or(0);

            let metadata = match self.last_state.get(&rel_path) {
                Some(prev) if prev.size == size && prev.mtime_nanos == mtime_nanos => {
                    prev.metadata.clone()
                }
                _ => match hash_file(abs, datasites_root) {
                    Ok(m) => m,
                    Err(e) => {
                        crate::logging::warn(format!("skipping unreadable file {rel_path}: {e}"));
                        continue;
                    }
                },
            };

            self.last_state.insert(
                rel_path.clone(),
                ScanCacheEntry {
                    size,
                    mtime_nanos,
                    metadata: metadata.clone(),
                },
            );
            out.insert(rel_path, metadata);
        }

        Ok(out)
    }
}

impl DatasiteState {
    pub fn new(email: &str, remote_state: Vec<FileMetadata>) -> Self {
        Self {
            email: email.to_string(),
            remote_state,
        }
    }

    /// Paths whose local content differs from the server snapshot, split
    /// into permission-file changes (processed first) and regular changes.
    pub fn get_out_of_sync_files(
        &self,
        datasites_root: &Path,
        ignore: &SyncIgnoreList,
        scanner: &mut LocalScanner,
    ) -> Result<(Vec<FileChangeInfo>, Vec<FileChangeInfo>)> {
        let local = scanner.scan_datasite(datasites_root, &self.email, ignore)?;

        let mut remote: HashMap<&RelativePath, &FileMetadata> = HashMap::new();
        for meta in &self.remote_state {
            if ignore.should_ignore_rel(Path::new(meta.path.as_str()), false) {
                continue;
            }
            remote.insert(&meta.path, meta);
        }

        let mut all_paths: BTreeSet<&RelativePath> = BTreeSet::new();
        all_paths.extend(local.keys());
        all_paths.extend(remote.keys());

        let mut permission_changes = Vec::new();
        let mut file_changes = Vec::new();
        for path in all_paths {
            let local_hash = local.get(path).map(|m| m.hash.as_str());
            let remote_hash = remote.get(path).map(|m| m.hash.as_str());
            if local_hash == remote_hash {
                continue;
            }

            let is_permission = perms::is_permission_path(path);
            let change = FileChangeInfo {
                path: (*path).clone(),
                local_abs_path: path.to_fs_path(datasites_root),
                priority: if is_permission {
                    PRIORITY_PERMISSION_FILE
                } else {
                    PRIORITY_REGULAR_FILE
                },
            };
            if is_permission {
                permission_changes.push(change);
            } else {
                file_changes.push(change);
            }
        }

        Ok((permission_changes, file_changes))
    }
}

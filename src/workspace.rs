use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::perms::{SyftPermission, PERMISSION_FILENAME};

#[derive(Debug)]
pub struct WorkspaceLockedError;

impl std::fmt::Display for WorkspaceLockedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "workspace locked by another process")
    }
}

impl std::error::Error for WorkspaceLockedError {}

/// Exclusive lock over a workspace. The local state index is owned by a
/// single running sync manager; the lock makes that concrete.
#[derive(Debug)]
pub struct WorkspaceLock {
    #[allow(dead_code)]
    file: fs::File,
    path: PathBuf,
}

/// Create the workspace skeleton: the datasites tree, the caller's own
/// datasite with a public folder, and the sync plugin folder that holds the
/// local state index.
pub fn ensure_workspace_layout(data_dir: &Path, email: &str) -> Result<()> {
    let sync_dir = data_dir.join("plugins").join("sync");
    let datasites_dir = data_dir.join("datasites");
    let root_dir = datasites_dir.join(email);
    let public_dir = root_dir.join("public");

    fs::create_dir_all(&sync_dir).with_context(|| format!("create {}", sync_dir.display()))?;
    fs::create_dir_all(&public_dir)
        .with_context(|| format!("create {}", public_dir.display()))?;

    let public_perm = public_dir.join(PERMISSION_FILENAME);
    if !public_perm.exists() {
        let perm = SyftPermission::mine_with_public_read(email);
        fs::write(&public_perm, perm.to_bytes())
            .with_context(|| format!("write {}", public_perm.display()))?;
    }

    Ok(())
}

impl WorkspaceLock {
    pub fn try_lock(data_dir: &Path) -> Result<Self> {
        let meta_dir = data_dir.join("plugins").join("sync");
        fs::create_dir_all(&meta_dir).with_context(|| format!("create {}", meta_dir.display()))?;
        let lock_path = meta_dir.join("sync.lock");
        let file = open_lock_file(&lock_path)?;
        lock_file(&file).context("lock")?;

        Ok(Self {
            file,
            path: lock_path,
        })
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn lock_file(file: &fs::File) -> Result<()> {
    use std::os::fd::AsRawFd;
    extern "C" {
        fn flock(fd: i32, operation: i32) -> i32;
    }
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;

    let rc = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    let raw = err.raw_os_error();
    // macOS uses EWOULDBLOCK=35; Linux typically uses EWOULDBLOCK/EAGAIN=11.
    if err.kind() == std::io::ErrorKind::WouldBlock || raw == Some(11) || raw == Some(35) {
        return Err(WorkspaceLockedError.into());
    }
    Err(err).context("flock")
}

#[cfg(unix)]
fn unlock_file(file: &fs::File) -> Result<()> {
    use std::os::fd::AsRawFd;
    extern "C" {
        fn flock(fd: i32, operation: i32) -> i32;
    }
    const LOCK_UN: i32 = 8;
    let rc = unsafe { flock(file.as_raw_fd(), LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error()).context("flock unlock")
    }
}

#[cfg(windows)]
fn lock_file(_file: &fs::File) -> Result<()> {
    // open_lock_file() uses create_new so locking is implicit.
    Ok(())
}

#[cfg(windows)]
fn unlock_file(_file: &fs::File) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn open_lock_file(lock_path: &Path) -> Result<fs::File> {
    fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .with_context(|| format!("open {}", lock_path.display()))
}

#[cfg(windows)]
fn open_lock_file(lock_path: &Path) -> Result<fs::File> {
    // Emulate an exclusive lock by atomically creating the file.
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(lock_path);
    match file {
        Ok(f) => Ok(f),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(WorkspaceLockedError.into()),
        Err(e) => Err(e).with_context(|| format!("open {}", lock_path.display())),
    }
}

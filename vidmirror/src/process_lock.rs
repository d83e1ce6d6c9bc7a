//! Process-level locks for the vidmirror binaries.
//!
//! Lock strategy:
//! - `vidmirror-sync.lock` indicates an active sync process.
//! - `vidmirror-reconcile.lock` indicates an active full counter rebuild.
//! - Locks are advisory OS file locks (flock), held for process lifetime.
//!
//! Sync and reconcile may overlap (the rebuild reads only committed
//! mentions); each excludes another instance of itself.

use anyhow::{Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

const SYNC_LOCK_FILE: &str = "vidmirror-sync.lock";
const RECONCILE_LOCK_FILE: &str = "vidmirror-reconcile.lock";

/// Guard held by vidmirror-sync for its process lifetime.
#[allow(dead_code)]
pub struct SyncProcessGuard {
    _lock: ProcessLock,
}

/// Guard held by vidmirror-reconcile for its process lifetime.
#[allow(dead_code)]
pub struct ReconcileProcessGuard {
    _lock: ProcessLock,
}

/// Acquire the sync lock. Fails if another vidmirror-sync instance is
/// already running against the same database.
#[allow(dead_code)]
pub fn acquire_sync_guard(db_path: &Path) -> Result<SyncProcessGuard> {
    let lock = acquire_lock(SYNC_LOCK_FILE, db_path).with_context(|| {
        "failed to start vidmirror-sync: another vidmirror-sync instance appears to be running"
    })?;
    Ok(SyncProcessGuard { _lock: lock })
}

/// Acquire the reconcile lock. Fails if another full rebuild is already
/// running against the same database.
#[allow(dead_code)]
pub fn acquire_reconcile_guard(db_path: &Path) -> Result<ReconcileProcessGuard> {
    let lock = acquire_lock(RECONCILE_LOCK_FILE, db_path).with_context(|| {
        "failed to start vidmirror-reconcile: another rebuild appears to be running"
    })?;
    Ok(ReconcileProcessGuard { _lock: lock })
}

struct ProcessLock {
    file: File,
    path: PathBuf,
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        // Best-effort cleanup of lock file itself (not required for correctness).
        let _ = fs::remove_file(&self.path);
    }
}

fn acquire_lock(filename: &str, db_path: &Path) -> Result<ProcessLock> {
    match try_acquire_lock(filename, db_path)? {
        Some(lock) => Ok(lock),
        None => anyhow::bail!("lock is already held: {}", filename),
    }
}

fn try_acquire_lock(filename: &str, db_path: &Path) -> Result<Option<ProcessLock>> {
    let dir = lock_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create runtime lock directory: {}", dir.display()))?;

    let path = dir.join(scoped_lock_filename(filename, db_path));
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("failed to open lock file: {}", path.display()))?;

    match lock_file_nonblocking(&file) {
        Ok(()) => {
            // Write basic owner info for debugging.
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = file.flush();

            Ok(Some(ProcessLock { file, path }))
        }
        Err(e) if is_lock_busy(&e) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to lock file: {}", path.display())),
    }
}

fn lock_dir() -> PathBuf {
    let mut dir = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => std::env::temp_dir(),
    };
    dir.push("vidmirror");
    dir
}

fn scoped_lock_filename(base_filename: &str, db_path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    db_path.to_string_lossy().hash(&mut hasher);
    let digest = hasher.finish();
    format!("{base_filename}.{digest:016x}")
}

fn is_lock_busy(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::WouldBlock)
        || matches!(error.raw_os_error(), Some(11) | Some(35))
}

#[cfg(unix)]
fn lock_file_nonblocking(file: &File) -> io::Result<()> {
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock_file(file: &File) -> io::Result<()> {
    const LOCK_UN: i32 = 8;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
extern "C" {
    fn flock(fd: i32, operation: i32) -> i32;
}

#[cfg(not(unix))]
compile_error!("vidmirror process locks currently require Unix (macOS/Linux)");

//! Cross-process exclusive lock per lane.
//!
//! At most one process works on a lane at a time. The lock is an advisory
//! `flock` on `<locks_dir>/<lane>.lock`, released when the guard drops.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::debug;

use crate::domain::Lane;

/// Held lock on one lane
#[derive(Debug)]
pub struct LaneLock {
    file: File,
    path: PathBuf,
}

impl LaneLock {
    /// Try to take the lane's lock without waiting.
    ///
    /// `Ok(None)` means another process holds it.
    pub fn try_acquire(locks_dir: &Path, lane: &Lane) -> Result<Option<Self>> {
        std::fs::create_dir_all(locks_dir)
            .with_context(|| format!("Failed to create locks directory: {}", locks_dir.display()))?;

        let path = locks_dir.join(format!("{}.lock", lane.key()));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(lane = %lane, "Lane lock acquired");
                Ok(Some(Self { file, path }))
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to lock {}", path.display())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LaneLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

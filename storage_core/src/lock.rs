//! The advisory, per-resource runtime lock (spec §3 invariants, §5).
//!
//! Ported from the original agent's `RuntimeLock` (`utils.py`), which opens
//! the lock path, takes a non-blocking exclusive `fcntl` lock, and writes its
//! own PID for diagnostics. `fs2::FileExt::try_lock_exclusive` is the
//! idiomatic equivalent, the same crate several repos in the pack
//! (`oddjobs`'s daemon lifecycle module among them) reach for to do the same
//! thing.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::AgentErrorKind;
use crate::Result;

/// A held advisory lock file. Released on `Drop`, which removes the file —
/// matching `RuntimeLock.close()`'s `os.unlink` in the original agent.
#[derive(Debug)]
pub struct RuntimeLock {
    path: PathBuf,
    file: Option<File>,
}

impl RuntimeLock {
    /// Acquire an exclusive, non-blocking lock at `path`, writing our PID
    /// into it. Returns `AgentErrorKind::Busy` if another process holds it.
    pub fn acquire(path: &Path, label: &str) -> Result<RuntimeLock> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(AgentErrorKind::Busy(
                label.to_string(),
                path.display().to_string(),
            )
            .into());
        }

        let mut file = file;
        file.set_len(0)?;
        writeln!(file, "{:>10}", std::process::id())?;
        file.flush()?;

        Ok(RuntimeLock {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RuntimeLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
            drop(file);
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

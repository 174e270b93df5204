//! Advisory lock on the state directory so two orchestrators never share
//! one state file.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{OrchestratorError, Result};

const LOCK_FILE: &str = "orchestrator.lock";

/// Holds an exclusive `flock` on `<state_dir>/orchestrator.lock`; released
/// on drop.
#[derive(Debug)]
pub struct StateDirLock {
    file: File,
    path: PathBuf,
}

impl StateDirLock {
    /// Take the lock without waiting. Fails with `Locked` if another process
    /// (or another handle in this one) holds it.
    pub fn acquire(state_dir: &Path) -> Result<StateDirLock> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            return Err(OrchestratorError::Locked(path.display().to_string()));
        }

        // Owner pid, for operators.
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(StateDirLock { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateDirLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

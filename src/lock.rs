//! Advisory run lock on `<state>/run.lock`.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use fs2::FileExt;

pub const LOCK_FILENAME: &str = "run.lock";

/// Held for the whole invocation; the lock is released when dropped.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the exclusive lock or fail naming the holder.
    pub fn acquire(state_root: &Path) -> Result<Self> {
        fs::create_dir_all(state_root)
            .with_context(|| format!("creating state root '{}'", state_root.display()))?;
        let path = state_root.join(LOCK_FILENAME);

        // The file is never unlinked: removing a locked file would let a second
        // process lock a fresh inode at the same path.
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("opening run lock '{}'", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            let mut holder = String::new();
            let _ = file.read_to_string(&mut holder);
            let holder = holder.trim();
            if holder.is_empty() {
                bail!(
                    "another build is already running against '{}'",
                    state_root.display()
                );
            }
            bail!(
                "another build (pid {holder}) is already running against '{}'",
                state_root.display()
            );
        }

        file.set_len(0)
            .with_context(|| format!("truncating run lock '{}'", path.display()))?;
        file.seek(SeekFrom::Start(0))
            .with_context(|| format!("rewinding run lock '{}'", path.display()))?;
        write!(file, "{}", std::process::id())
            .with_context(|| format!("writing run lock '{}'", path.display()))?;

        log::debug!("[lock] acquired {}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = self.file.unlock();
        log::debug!("[lock] released {}", self.path.display());
    }
}

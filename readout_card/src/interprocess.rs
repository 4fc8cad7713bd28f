// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cross-process channel exclusion.
//!
//! One lock file per `(PCI address, channel)`; holding the lock is a
//! precondition for any register I/O on that channel.

#![cfg(target_os = "linux")]

use crate::error::Error;
use crate::error::Result;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::path::PathBuf;

/// An exclusive, OS-scope lock on a channel. Released on drop, or by the
/// kernel if the holder dies.
pub struct InterprocessLock {
    _file: File,
    path: PathBuf,
}

impl InterprocessLock {
    /// Takes the lock without blocking. Fails with [`Error::Lock`] if another
    /// process holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        let lock_err = |source| Error::Lock {
            path: path.to_owned(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(lock_err)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(lock_err)?;
        // SAFETY: locking a file descriptor we own.
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } < 0 {
            return Err(lock_err(std::io::Error::last_os_error()));
        }
        tracing::debug!(path = %path.display(), "channel lock acquired");
        Ok(Self {
            _file: file,
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Removes a lock file left behind by a dead holder. Only call this when it
/// is certain the current process is not the holder; the benchmark does so
/// once, on operator intent, before retrying.
pub fn remove_stale(path: &Path) -> std::io::Result<()> {
    tracing::warn!(path = %path.display(), "removing stale channel lock");
    std::fs::remove_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_lock_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("readout_card_lock_test_{name}_{}", std::process::id()))
    }

    #[test]
    fn lock_is_exclusive_within_a_process() {
        let path = temp_lock_path("exclusive");
        let first = InterprocessLock::acquire(&path).unwrap();
        assert!(matches!(
            InterprocessLock::acquire(&path),
            Err(Error::Lock { .. })
        ));
        drop(first);
        let _second = InterprocessLock::acquire(&path).unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn stale_lock_can_be_removed_and_retaken() {
        let path = temp_lock_path("stale");
        drop(InterprocessLock::acquire(&path).unwrap());
        remove_stale(&path).unwrap();
        let _lock = InterprocessLock::acquire(&path).unwrap();
        let _ = std::fs::remove_file(&path);
    }
}

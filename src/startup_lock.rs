//! Named inter-process lock ordering master and child startup.
//!
//! The master holds the lock across its listener-bind phase; children block
//! on it before back-connecting, so they only proceed once the master can
//! accept them. flock on a well-known file gives the named-mutex semantics:
//! a child opens its own descriptor, so the lock inherited over fork does not
//! satisfy its wait.

use crate::config::types::{GatewayError, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::time::SystemTime;

/// Owner metadata written into the lock file for debugging stuck startups.
#[derive(Debug, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    created_at: SystemTime,
    version: String,
}

/// Held by the master between pre-spawn and listener readiness.
pub struct StartupLock {
    file: File,
    path: PathBuf,
}

fn lock_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{name}.lock"))
}

fn flock(file: &File, operation: libc::c_int) -> Result<()> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if rc != 0 {
        return Err(GatewayError::Lock(format!(
            "flock failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

impl StartupLock {
    /// Take the named lock, blocking if another master holds it.
    pub fn acquire(name: &str) -> Result<Self> {
        let path = lock_path(name);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        flock(&file, libc::LOCK_EX)?;

        // Best-effort owner record; the flock is the lock, not the contents.
        let owner = LockOwner {
            pid: std::process::id(),
            created_at: SystemTime::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        if let Ok(record) = serde_json::to_string(&owner) {
            let _ = file.seek(SeekFrom::Start(0));
            let _ = file.write_all(record.as_bytes());
            let _ = file.set_len(record.len() as u64);
            let _ = file.flush();
        }

        info!("holding startup lock {}", path.display());
        Ok(Self { file, path })
    }

    /// Release explicitly once the listeners are bound.
    pub fn release(self) {
        info!("releasing startup lock {}", self.path.display());
        // Drop performs the unlock.
    }
}

impl Drop for StartupLock {
    fn drop(&mut self) {
        let _ = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

/// A child's side of the lock. The descriptor is opened before the child
/// enters its jail (the lock file lives in the host's temp dir) and waited on
/// afterwards; a fresh descriptor is required because the one inherited over
/// fork shares the master's lock.
pub struct Waiter {
    file: File,
}

impl Waiter {
    pub fn open(name: &str) -> Result<Self> {
        let path = lock_path(name);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        Ok(Self { file })
    }

    /// Block until the holder releases, then release immediately.
    pub fn wait(self) -> Result<()> {
        flock(&self.file, libc::LOCK_EX)?;
        flock(&self.file, libc::LOCK_UN)
    }
}

/// Convenience for callers with no chroot boundary to straddle.
pub fn wait(name: &str) -> Result<()> {
    Waiter::open(name)?.wait()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn waiters_block_until_the_holder_releases() {
        // Unique name per test run so parallel builds don't contend.
        let name = format!("docgate-lock-test-{}", std::process::id());
        let lock = StartupLock::acquire(&name).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let waiter_name = name.clone();
        let waiter = thread::spawn(move || {
            wait(&waiter_name).unwrap();
            done_tx.send(()).unwrap();
        });

        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
        lock.release();
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        waiter.join().unwrap();
        let _ = std::fs::remove_file(lock_path(&name));
    }

    #[test]
    fn reacquiring_after_release_succeeds() {
        let name = format!("docgate-relock-test-{}", std::process::id());
        StartupLock::acquire(&name).unwrap().release();
        StartupLock::acquire(&name).unwrap().release();
        let _ = std::fs::remove_file(lock_path(&name));
    }
}

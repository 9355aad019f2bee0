//! Per-guest host lock.
//!
//! An advisory `flock(2)` on `<flock_dir>/<guest_id>.flock`. The kernel drops
//! it when the holder exits, so a crashed daemon never strands the lock.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use parking_lot::Mutex;

use guestvisor_shared::{GuestvisorError, GuestvisorResult};

pub struct GuestLock {
    guest_id: String,
    path: PathBuf,
    held: Mutex<Option<Flock<File>>>,
}

impl GuestLock {
    pub fn new(flock_dir: &Path, guest_id: &str) -> Self {
        Self {
            guest_id: guest_id.to_string(),
            path: flock_dir.join(format!("{}.flock", guest_id)),
            held: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock without blocking.
    pub fn try_lock(&self) -> GuestvisorResult<()> {
        let mut held = self.held.lock();
        if held.is_some() {
            return Err(GuestvisorError::Locked(self.guest_id.clone()));
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                *held = Some(lock);
                Ok(())
            }
            Err((_, Errno::EWOULDBLOCK)) => Err(GuestvisorError::Locked(self.guest_id.clone())),
            Err((_, errno)) => Err(GuestvisorError::Io(std::io::Error::from(errno))),
        }
    }

    /// Release the lock if held.
    pub fn unlock(&self) {
        let Some(lock) = self.held.lock().take() else {
            return;
        };
        if let Err((_, errno)) = lock.unlock() {
            tracing::warn!(guest_id = %self.guest_id, error = %errno, "Failed to release guest lock");
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.lock().is_some()
    }
}

impl Drop for GuestLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_holder_is_rejected() {
        let dir = TempDir::new().unwrap();
        let first = GuestLock::new(dir.path(), "g1");
        let second = GuestLock::new(dir.path(), "g1");

        first.try_lock().unwrap();
        let err = second.try_lock().unwrap_err();
        assert!(err.is_locked());
        assert_eq!(err.to_string(), "g1 has been locked");

        first.unlock();
        second.try_lock().unwrap();
        assert!(second.is_held());
    }

    #[test]
    fn test_distinct_guests_do_not_contend() {
        let dir = TempDir::new().unwrap();
        let a = GuestLock::new(dir.path(), "a");
        let b = GuestLock::new(dir.path(), "b");
        a.try_lock().unwrap();
        b.try_lock().unwrap();
    }

    #[test]
    fn test_drop_releases() {
        let dir = TempDir::new().unwrap();
        {
            let lock = GuestLock::new(dir.path(), "g1");
            lock.try_lock().unwrap();
        }
        GuestLock::new(dir.path(), "g1").try_lock().unwrap();
    }
}

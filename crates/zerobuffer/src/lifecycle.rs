// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Naming conventions and creation-race arbitration shared by
//! [`crate::reader::Reader`] construction and buffer teardown.
//!
//! Every buffer is addressed by a short name. A lock file derived from that
//! name arbitrates which of several racing processes gets to create the
//! underlying shared memory segment and semaphores; the loser attaches to
//! what the winner created instead.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, ZeroBufferError};
use crate::platform::{self, LockFile, Segment, Semaphore};

/// How long a creating process waits to confirm no stale resources from a
/// dead prior owner are left behind before giving up.
pub const STALE_RECLAIM_TIMEOUT: Duration = Duration::from_millis(500);

fn runtime_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir);
    }
    std::env::temp_dir()
}

/// Path of the lock file that arbitrates creation of `buffer_name`.
#[must_use]
pub fn lock_file_path(buffer_name: &str) -> PathBuf {
    runtime_dir().join(format!("zerobuffer-{buffer_name}.lock"))
}

/// The full set of platform resource names derived from a buffer name.
pub struct ResourceNames {
    pub buffer_name: String,
    pub write_semaphore: String,
    pub read_semaphore: String,
    pub lock_file: PathBuf,
}

impl ResourceNames {
    pub fn for_buffer(buffer_name: &str) -> Result<Self> {
        platform::validate_buffer_name(buffer_name)?;
        Ok(Self {
            write_semaphore: platform::write_semaphore_name(buffer_name),
            read_semaphore: platform::read_semaphore_name(buffer_name),
            lock_file: lock_file_path(buffer_name),
            buffer_name: buffer_name.to_string(),
        })
    }
}

/// Attempt to reclaim a named segment/semaphore pair left behind by a
/// reader process that is no longer alive.
///
/// The caller must hold the creation lock for `names.buffer_name` before
/// calling this: unlink is only safe once no other process can be mid-way
/// through `Segment::open`.
pub fn reclaim_if_stale(names: &ResourceNames, owner_pid: Option<u32>) -> Result<bool> {
    let Some(pid) = owner_pid else {
        return Ok(false);
    };
    if platform::process_exists(pid) {
        return Ok(false);
    }
    log::warn!(
        "[zerobuffer] reclaiming stale resources for {} (owner pid {pid} is gone)",
        names.buffer_name
    );
    Segment::unlink(&names.buffer_name).ok();
    Semaphore::unlink(&names.write_semaphore).ok();
    Semaphore::unlink(&names.read_semaphore).ok();
    Ok(true)
}

/// Acquire the creation lock for `buffer_name`, retrying briefly against a
/// dying prior owner rather than failing on the first contended attempt.
pub fn acquire_creation_lock(names: &ResourceNames) -> Result<LockFile> {
    let deadline = std::time::Instant::now() + STALE_RECLAIM_TIMEOUT;
    loop {
        if let Some(lock) = LockFile::try_acquire(&names.lock_file)? {
            return Ok(lock);
        }
        if std::time::Instant::now() >= deadline {
            return Err(ZeroBufferError::AlreadyExists(names.buffer_name.clone()));
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_file_path_is_per_buffer() {
        let a = lock_file_path("foo");
        let b = lock_file_path("bar");
        assert_ne!(a, b);
        assert!(a.to_string_lossy().contains("foo"));
    }

    #[test]
    fn resource_names_rejects_invalid_buffer_name() {
        assert!(ResourceNames::for_buffer("bad/name").is_err());
    }

    #[test]
    fn resource_names_derives_semaphore_names() {
        let names = ResourceNames::for_buffer("mychan").unwrap();
        assert_eq!(names.write_semaphore, "sem-w-mychan");
        assert_eq!(names.read_semaphore, "sem-r-mychan");
    }
}

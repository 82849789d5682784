// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX backend: `shm_open`/`mmap` for shared memory, named `sem_open`
//! semaphores, `flock` for the lock file, `kill(pid, 0)` for liveness.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;
use std::time::Duration;

use crate::error::{Result, ZeroBufferError};

use super::WaitOutcome;

/// A mapped POSIX shared memory segment.
///
/// Unmaps on drop. Does not unlink the system-wide name; the reader that
/// created the buffer is responsible for that (see `lifecycle`).
pub struct Segment {
    ptr: *mut u8,
    size: usize,
    name: String,
}

// SAFETY: the mapping is backed by shared memory intended for concurrent
// cross-process access; all structured access to it goes through the
// atomics in `oieb`/`ring`.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    fn shm_path(name: &str) -> io::Result<CString> {
        CString::new(format!("/{name}"))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name contains NUL"))
    }

    /// Create a new segment with exclusive-creation semantics, sized and
    /// zero-filled to exactly `size` bytes.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let c_name = Self::shm_path(name).map_err(ZeroBufferError::Io)?;

        // SAFETY: c_name is a valid NUL-terminated CString; O_CREAT|O_EXCL
        // requires this call to create a brand-new object or fail.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            return Err(ZeroBufferError::SystemResourceExhausted(
                io::Error::last_os_error(),
            ));
        }

        // SAFETY: fd is a valid, just-opened descriptor; size fits off_t on
        // any platform this crate targets.
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(ZeroBufferError::SystemResourceExhausted(err));
        }

        // SAFETY: standard MAP_SHARED mapping of a valid, sized fd.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(ZeroBufferError::SystemResourceExhausted(
                io::Error::last_os_error(),
            ));
        }

        // SAFETY: ptr is a freshly mapped region of exactly `size` bytes.
        unsafe { ptr::write_bytes(ptr as *mut u8, 0, size) };

        log::info!("[zerobuffer] created shared memory segment {name} ({size} bytes)");
        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            name: name.to_string(),
        })
    }

    /// Open an existing segment, mapping exactly `size` bytes.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        let c_name = Self::shm_path(name).map_err(ZeroBufferError::Io)?;

        // SAFETY: c_name is a valid NUL-terminated CString.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(ZeroBufferError::NotFound(name.to_string()));
            }
            return Err(ZeroBufferError::SystemResourceExhausted(err));
        }

        // SAFETY: standard MAP_SHARED mapping of a valid, existing fd.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(ZeroBufferError::SystemResourceExhausted(
                io::Error::last_os_error(),
            ));
        }

        log::info!("[zerobuffer] opened shared memory segment {name} ({size} bytes)");
        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            name: name.to_string(),
        })
    }

    /// Remove the system-wide name. Existing mappings (including this one)
    /// remain valid until unmapped.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = Self::shm_path(name).map_err(ZeroBufferError::Io)?;
        // SAFETY: shm_unlink is safe to call on any name; ENOENT is ignored
        // below to keep cleanup idempotent.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(ZeroBufferError::Io(err));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: self.ptr/self.size come from the successful mmap call
        // that constructed this Segment and have not been unmapped before.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

/// A named POSIX counting semaphore.
pub struct Semaphore {
    handle: *mut libc::sem_t,
    name: String,
}

unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    fn sem_path(name: &str) -> io::Result<CString> {
        CString::new(format!("/{name}"))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name contains NUL"))
    }

    pub fn create(name: &str, initial: u32) -> Result<Self> {
        let c_name = Self::sem_path(name).map_err(ZeroBufferError::Io)?;
        // SAFETY: valid CString, valid mode/value arguments.
        let handle = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600u32,
                initial,
            )
        };
        if handle == libc::SEM_FAILED {
            return Err(ZeroBufferError::SystemResourceExhausted(
                io::Error::last_os_error(),
            ));
        }
        Ok(Self {
            handle,
            name: name.to_string(),
        })
    }

    pub fn open(name: &str) -> Result<Self> {
        let c_name = Self::sem_path(name).map_err(ZeroBufferError::Io)?;
        // SAFETY: valid CString; no O_CREAT so mode/value are ignored.
        let handle = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if handle == libc::SEM_FAILED {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(ZeroBufferError::NotFound(name.to_string()));
            }
            return Err(ZeroBufferError::SystemResourceExhausted(err));
        }
        Ok(Self {
            handle,
            name: name.to_string(),
        })
    }

    pub fn unlink(name: &str) -> Result<()> {
        let c_name = Self::sem_path(name).map_err(ZeroBufferError::Io)?;
        // SAFETY: sem_unlink is safe on any name; ENOENT is ignored.
        let ret = unsafe { libc::sem_unlink(c_name.as_ptr()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(ZeroBufferError::Io(err));
            }
        }
        Ok(())
    }

    /// Wait for the semaphore to be signalled, up to `timeout`.
    #[cfg(target_os = "linux")]
    pub fn wait(&self, timeout: Duration) -> Result<WaitOutcome> {
        let deadline = unsafe {
            let mut now: libc::timespec = std::mem::zeroed();
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
            let nsec = now.tv_nsec + i64::from(timeout.subsec_nanos());
            libc::timespec {
                tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + nsec / 1_000_000_000,
                tv_nsec: nsec % 1_000_000_000,
            }
        };
        // SAFETY: self.handle is a live sem_t* from sem_open; deadline is a
        // valid absolute CLOCK_REALTIME timespec.
        let ret = unsafe { libc::sem_timedwait(self.handle, &deadline) };
        if ret == 0 {
            return Ok(WaitOutcome::Signalled);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::TimedOut || err.raw_os_error() == Some(libc::ETIMEDOUT) {
            return Ok(WaitOutcome::TimedOut);
        }
        Err(ZeroBufferError::Io(err))
    }

    /// Wait for the semaphore to be signalled, up to `timeout`.
    ///
    /// Non-Linux POSIX systems (e.g. macOS) do not implement
    /// `sem_timedwait`; this falls back to a bounded `sem_trywait` poll loop.
    #[cfg(all(unix, not(target_os = "linux")))]
    pub fn wait(&self, timeout: Duration) -> Result<WaitOutcome> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            // SAFETY: self.handle is a live sem_t* from sem_open.
            let ret = unsafe { libc::sem_trywait(self.handle) };
            if ret == 0 {
                return Ok(WaitOutcome::Signalled);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EAGAIN) {
                return Err(ZeroBufferError::Io(err));
            }
            if std::time::Instant::now() >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    /// Increment the semaphore. Never blocks.
    pub fn post(&self) -> Result<()> {
        // SAFETY: self.handle is a live sem_t* from sem_open.
        if unsafe { libc::sem_post(self.handle) } < 0 {
            return Err(ZeroBufferError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: self.handle came from a successful sem_open and has not
        // been closed before.
        unsafe {
            libc::sem_close(self.handle);
        }
    }
}

/// An exclusive, non-blocking `flock` on a regular file used to arbitrate
/// buffer creation.
pub struct LockFile {
    file: File,
    path: std::path::PathBuf,
}

impl LockFile {
    /// Try to take an exclusive lock on `path`, creating the file if
    /// necessary. Returns `Ok(None)` if another live process already holds
    /// the lock.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        // SAFETY: flock is called with a valid, open file descriptor.
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Ok(None);
            }
            return Err(ZeroBufferError::Io(err));
        }

        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        // SAFETY: file.as_raw_fd() is a valid, open descriptor; unlocking a
        // held lock is always safe.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Best-effort check for whether `pid` is a live process, using
/// `kill(pid, 0)`: success or `EPERM` means the process exists; `ESRCH`
/// means it does not.
pub fn process_exists(pid: u32) -> bool {
    // SAFETY: signal 0 performs no action beyond existence/permission
    // checks; pid is a plain integer.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[allow(dead_code)]
fn _assert_os_str_api(p: &Path) -> &[u8] {
    p.as_os_str().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(prefix: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("zb_test_{prefix}_{ts}")
    }

    #[test]
    fn segment_create_open_roundtrip() {
        let name = unique_name("seg");
        let seg1 = Segment::create(&name, 4096).unwrap();
        unsafe {
            *seg1.as_ptr() = 0x42;
        }
        let seg2 = Segment::open(&name, 4096).unwrap();
        unsafe {
            assert_eq!(*seg2.as_ptr(), 0x42);
        }
        drop(seg1);
        drop(seg2);
        Segment::unlink(&name).unwrap();
    }

    #[test]
    fn segment_open_missing_is_not_found() {
        let name = unique_name("missing");
        let result = Segment::open(&name, 4096);
        assert!(matches!(result, Err(ZeroBufferError::NotFound(_))));
    }

    #[test]
    fn semaphore_post_then_wait_signals() {
        let name = unique_name("sem");
        let sem = Semaphore::create(&name, 0).unwrap();
        sem.post().unwrap();
        assert_eq!(sem.wait(Duration::from_secs(1)).unwrap(), WaitOutcome::Signalled);
        Semaphore::unlink(&name).ok();
    }

    #[test]
    fn semaphore_wait_times_out_without_post() {
        let name = unique_name("sem_timeout");
        let sem = Semaphore::create(&name, 0).unwrap();
        assert_eq!(
            sem.wait(Duration::from_millis(50)).unwrap(),
            WaitOutcome::TimedOut
        );
        Semaphore::unlink(&name).ok();
    }

    #[test]
    fn lock_file_excludes_second_acquirer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");
        let first = LockFile::try_acquire(&path).unwrap();
        assert!(first.is_some());
        let second = LockFile::try_acquire(&path).unwrap();
        assert!(second.is_none());
        drop(first);
        let third = LockFile::try_acquire(&path).unwrap();
        assert!(third.is_some());
    }

    #[test]
    fn process_exists_for_self() {
        assert!(process_exists(std::process::id()));
    }
}

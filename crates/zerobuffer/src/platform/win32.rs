// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Win32 backend: `CreateFileMapping`/`MapViewOfFile` for shared memory,
//! named `CreateSemaphore` objects, `LockFileEx` for the lock file,
//! `OpenProcess` for liveness.

use std::ffi::CString;
use std::io;
use std::path::Path;
use std::ptr;
use std::time::Duration;

use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileA, LockFileEx, UnlockFile, FILE_ATTRIBUTE_NORMAL, FILE_SHARE_READ, FILE_SHARE_WRITE,
    LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, OPEN_ALWAYS,
};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingA, MapViewOfFile, OpenFileMappingA, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
    MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
};
use windows_sys::Win32::System::Threading::{OpenProcess, WaitForSingleObject, PROCESS_QUERY_LIMITED_INFORMATION};
use windows_sys::Win32::System::Threading::{CreateSemaphoreA, OpenSemaphoreA, ReleaseSemaphore, SEMAPHORE_ALL_ACCESS};

use crate::error::{Result, ZeroBufferError};

use super::WaitOutcome;

const ERROR_ALREADY_EXISTS: u32 = 183;
const ERROR_FILE_NOT_FOUND: u32 = 2;

fn c_string(s: &str) -> io::Result<CString> {
    CString::new(s).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name contains NUL"))
}

/// A mapped Win32 file mapping object, backed by the system paging file.
///
/// Unmaps and closes the handle on drop. Named kernel objects are
/// reference-counted by the OS: the last handle closing removes the
/// object, mirroring POSIX `shm_unlink` semantics closely enough that no
/// explicit `unlink` call is required here.
pub struct Segment {
    handle: HANDLE,
    ptr: *mut u8,
    size: usize,
    name: String,
}

unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let c_name = c_string(name).map_err(ZeroBufferError::Io)?;
        let mut sa = SECURITY_ATTRIBUTES {
            nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: ptr::null_mut(),
            bInheritHandle: 0,
        };
        // SAFETY: sa is a valid, stack-allocated SECURITY_ATTRIBUTES; size
        // fits the high/low dword split for any realistic buffer capacity.
        let handle = unsafe {
            CreateFileMappingA(
                windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE,
                &mut sa,
                PAGE_READWRITE,
                (size as u64 >> 32) as u32,
                (size as u64 & 0xFFFF_FFFF) as u32,
                c_name.as_ptr() as *const u8,
            )
        };
        if handle.is_null() {
            return Err(ZeroBufferError::SystemResourceExhausted(
                io::Error::last_os_error(),
            ));
        }
        // SAFETY: handle is non-null immediately after CreateFileMappingA.
        let already_existed = unsafe { GetLastError() } == ERROR_ALREADY_EXISTS;
        if already_existed {
            unsafe { CloseHandle(handle) };
            return Err(ZeroBufferError::AlreadyExists(name.to_string()));
        }

        // SAFETY: handle is a valid, freshly created file mapping of at
        // least `size` bytes.
        let view = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, size) };
        if view.Value.is_null() {
            let err = io::Error::last_os_error();
            unsafe { CloseHandle(handle) };
            return Err(ZeroBufferError::SystemResourceExhausted(err));
        }

        log::info!("[zerobuffer] created file mapping {name} ({size} bytes)");
        Ok(Self {
            handle,
            ptr: view.Value as *mut u8,
            size,
            name: name.to_string(),
        })
    }

    pub fn open(name: &str, size: usize) -> Result<Self> {
        let c_name = c_string(name).map_err(ZeroBufferError::Io)?;
        // SAFETY: c_name is a valid NUL-terminated CString.
        let handle = unsafe { OpenFileMappingA(FILE_MAP_ALL_ACCESS, 0, c_name.as_ptr() as *const u8) };
        if handle.is_null() {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(ERROR_FILE_NOT_FOUND as i32) {
                return Err(ZeroBufferError::NotFound(name.to_string()));
            }
            return Err(ZeroBufferError::SystemResourceExhausted(err));
        }

        // SAFETY: handle is a valid, just-opened file mapping.
        let view = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, size) };
        if view.Value.is_null() {
            let err = io::Error::last_os_error();
            unsafe { CloseHandle(handle) };
            return Err(ZeroBufferError::SystemResourceExhausted(err));
        }

        log::info!("[zerobuffer] opened file mapping {name} ({size} bytes)");
        Ok(Self {
            handle,
            ptr: view.Value as *mut u8,
            size,
            name: name.to_string(),
        })
    }

    /// No-op on Windows: named kernel objects are removed automatically
    /// once every handle referencing them is closed.
    pub fn unlink(_name: &str) -> Result<()> {
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
        // SAFETY: self.ptr is the view returned by the MapViewOfFile call
        // that constructed this Segment, not yet unmapped.
        unsafe {
            UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
                Value: self.ptr as _,
            });
            CloseHandle(self.handle);
        }
    }
}

/// A named Win32 counting semaphore.
pub struct Semaphore {
    handle: HANDLE,
    name: String,
}

unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    pub fn create(name: &str, initial: u32) -> Result<Self> {
        let c_name = c_string(name).map_err(ZeroBufferError::Io)?;
        // SAFETY: c_name is a valid NUL-terminated CString; initial <= max.
        let handle = unsafe {
            CreateSemaphoreA(ptr::null(), initial as i32, i32::MAX, c_name.as_ptr() as *const u8)
        };
        if handle.is_null() {
            return Err(ZeroBufferError::SystemResourceExhausted(
                io::Error::last_os_error(),
            ));
        }
        // SAFETY: handle is non-null immediately after CreateSemaphoreA.
        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            unsafe { CloseHandle(handle) };
            return Err(ZeroBufferError::AlreadyExists(name.to_string()));
        }
        Ok(Self {
            handle,
            name: name.to_string(),
        })
    }

    pub fn open(name: &str) -> Result<Self> {
        let c_name = c_string(name).map_err(ZeroBufferError::Io)?;
        // SAFETY: c_name is a valid NUL-terminated CString.
        let handle = unsafe { OpenSemaphoreA(SEMAPHORE_ALL_ACCESS, 0, c_name.as_ptr() as *const u8) };
        if handle.is_null() {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(ERROR_FILE_NOT_FOUND as i32) {
                return Err(ZeroBufferError::NotFound(name.to_string()));
            }
            return Err(ZeroBufferError::SystemResourceExhausted(err));
        }
        Ok(Self {
            handle,
            name: name.to_string(),
        })
    }

    /// No-op on Windows: named kernel objects are removed once every
    /// handle referencing them is closed.
    pub fn unlink(_name: &str) -> Result<()> {
        Ok(())
    }

    pub fn wait(&self, timeout: Duration) -> Result<WaitOutcome> {
        let millis = timeout.as_millis().min(u128::from(u32::MAX)) as u32;
        // SAFETY: self.handle is a live semaphore handle.
        let ret = unsafe { WaitForSingleObject(self.handle, millis) };
        if ret == WAIT_OBJECT_0 {
            return Ok(WaitOutcome::Signalled);
        }
        if ret == WAIT_TIMEOUT {
            return Ok(WaitOutcome::TimedOut);
        }
        Err(ZeroBufferError::Io(io::Error::last_os_error()))
    }

    pub fn post(&self) -> Result<()> {
        // SAFETY: self.handle is a live semaphore handle; previous_count
        // output pointer is optional and may be null.
        let ok = unsafe { ReleaseSemaphore(self.handle, 1, ptr::null_mut()) };
        if ok == 0 {
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
        // SAFETY: self.handle came from a successful Create/OpenSemaphoreA
        // and has not been closed before.
        unsafe {
            CloseHandle(self.handle);
        }
    }
}

/// An exclusive, non-blocking file lock used to arbitrate buffer creation.
pub struct LockFile {
    handle: HANDLE,
    path: std::path::PathBuf,
}

impl LockFile {
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let c_path = c_string(&path.to_string_lossy()).map_err(ZeroBufferError::Io)?;
        // SAFETY: c_path is a valid NUL-terminated CString.
        let handle = unsafe {
            CreateFileA(
                c_path.as_ptr() as *const u8,
                windows_sys::Win32::Storage::FileSystem::FILE_GENERIC_READ
                    | windows_sys::Win32::Storage::FileSystem::FILE_GENERIC_WRITE,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                ptr::null(),
                OPEN_ALWAYS,
                FILE_ATTRIBUTE_NORMAL,
                0,
            )
        };
        if handle == windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE {
            return Err(ZeroBufferError::SystemResourceExhausted(
                io::Error::last_os_error(),
            ));
        }

        let mut overlapped = unsafe { std::mem::zeroed() };
        // SAFETY: handle is valid; overlapped is a zeroed OVERLAPPED
        // structure sufficient for a byte-range lock starting at 0.
        let ok = unsafe {
            LockFileEx(
                handle,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                1,
                0,
                &mut overlapped,
            )
        };
        if ok == 0 {
            unsafe { CloseHandle(handle) };
            return Ok(None);
        }

        Ok(Some(Self {
            handle,
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
        // SAFETY: self.handle is a valid, locked file handle.
        unsafe {
            UnlockFile(self.handle, 0, 0, 1, 0);
            CloseHandle(self.handle);
        }
    }
}

/// Best-effort check for whether `pid` is a live process via `OpenProcess`.
pub fn process_exists(pid: u32) -> bool {
    // SAFETY: pid is a plain integer; a failed OpenProcess call just
    // returns a null handle, which is handled below.
    let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid) };
    if handle.is_null() {
        return false;
    }
    unsafe { CloseHandle(handle) };
    true
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Platform capability layer: named shared memory, named counting
//! semaphores, exclusive file locks, and process-existence probes.
//!
//! One backend module per operating system exposes an identical set of free
//! functions and small RAII types; `Reader`/`Writer`/`lifecycle` code above
//! this module is written against that shared shape and never branches on
//! `cfg` itself.

#[cfg(unix)]
mod posix;
#[cfg(unix)]
pub use posix::{LockFile, Segment, Semaphore};

#[cfg(windows)]
mod win32;
#[cfg(windows)]
pub use win32::{LockFile, Segment, Semaphore};

/// Outcome of a timed semaphore wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signalled,
    TimedOut,
}

/// Validate a buffer name against `[A-Za-z0-9._-]{1,255}`, the convention
/// every platform-specific name (segment, semaphores, lock file) is derived
/// from.
pub fn validate_buffer_name(name: &str) -> crate::error::Result<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(crate::error::ZeroBufferError::InvalidName(format!(
            "buffer name must be 1-255 bytes: {name}"
        )));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
    {
        return Err(crate::error::ZeroBufferError::InvalidName(format!(
            "buffer name contains characters outside [A-Za-z0-9._-]: {name}"
        )));
    }
    Ok(())
}

/// Name of the write semaphore for a given buffer: writer posts, reader
/// waits.
pub fn write_semaphore_name(buffer_name: &str) -> String {
    format!("sem-w-{buffer_name}")
}

/// Name of the read semaphore for a given buffer: reader posts, writer
/// waits.
pub fn read_semaphore_name(buffer_name: &str) -> String {
    format!("sem-r-{buffer_name}")
}

/// Returns whether the process with the given PID currently exists.
/// Best-effort: a `false` negative is possible under PID reuse, but is
/// bounded by the 5-second liveness-probe cadence in practice.
pub fn process_exists(pid: u32) -> bool {
    #[cfg(unix)]
    {
        posix::process_exists(pid)
    }
    #[cfg(windows)]
    {
        win32::process_exists(pid)
    }
}

/// Current process ID.
pub fn current_pid() -> u32 {
    #[cfg(unix)]
    {
        std::process::id()
    }
    #[cfg(windows)]
    {
        std::process::id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_buffer_name_accepts_typical_names() {
        assert!(validate_buffer_name("test-basic").is_ok());
        assert!(validate_buffer_name("duplex_channel.01").is_ok());
    }

    #[test]
    fn validate_buffer_name_rejects_empty_and_slashes() {
        assert!(validate_buffer_name("").is_err());
        assert!(validate_buffer_name("a/b").is_err());
        assert!(validate_buffer_name(&"x".repeat(256)).is_err());
    }

    #[test]
    fn semaphore_names_follow_convention() {
        assert_eq!(write_semaphore_name("foo"), "sem-w-foo");
        assert_eq!(read_semaphore_name("foo"), "sem-r-foo");
    }

    #[test]
    fn current_process_exists() {
        assert!(process_exists(current_pid()));
    }

    #[test]
    fn bogus_pid_does_not_exist() {
        // PID 1 is typically init/systemd and alive; a very large PID is
        // very unlikely to be assigned.
        assert!(!process_exists(u32::MAX - 1));
    }
}

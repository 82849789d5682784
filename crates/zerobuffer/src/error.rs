// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy for zerobuffer operations.

use std::fmt;
use std::io;

/// Errors that can occur while creating, attaching to, or operating on a
/// zerobuffer shared-memory channel.
#[derive(Debug)]
pub enum ZeroBufferError {
    /// Writer attached to a non-existent buffer, or a named semaphore/lock
    /// file that should already exist was missing.
    NotFound(String),

    /// Reader construction found a live reader already holding the name.
    AlreadyExists(String),

    /// A second writer attempted to attach while the first is still alive.
    WriterAlreadyConnected,

    /// The 128-byte OIEB failed validation (wrong `operation_size`, size
    /// mismatch, or an out-of-range position).
    InvalidOieb(String),

    /// A frame header reported a zero payload for a real frame, or a
    /// payload size exceeding the ring's capacity.
    InvalidFrameSize { size: u64, max: u64 },

    /// The requested frame does not fit in the ring even when empty.
    FrameTooLarge { requested: u64, capacity: u64 },

    /// The reader observed a sequence number different from the expected
    /// next value.
    SequenceError { expected: u64, actual: u64 },

    /// The writer peer is no longer a live process.
    WriterDead,

    /// The reader peer is no longer a live process.
    ReaderDead,

    /// Non-blocking write could not find space immediately.
    BufferFull,

    /// Metadata has already been written once; the metadata block is
    /// write-once.
    MetadataAlreadyWritten,

    /// Metadata payload does not fit in the configured metadata block.
    MetadataTooLarge { requested: usize, capacity: u64 },

    /// `metadata_size` was configured as `0`; metadata writes are rejected.
    MetadataNotSupported,

    /// A blocking call exceeded its deadline without the peer being
    /// confirmed dead.
    Timeout,

    /// The operating system refused to create a shared memory segment,
    /// semaphore, or lock file.
    SystemResourceExhausted(io::Error),

    /// Segment name does not follow the `[A-Za-z0-9._-]{1,255}` convention.
    InvalidName(String),

    /// `BufferConfig` fields are out of range, e.g. a `payload_size` too
    /// small to be useful.
    InvalidConfiguration(String),

    /// Low-level I/O failure not covered by a more specific variant.
    Io(io::Error),
}

impl fmt::Display for ZeroBufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(name) => write!(f, "resource not found: {name}"),
            Self::AlreadyExists(name) => write!(f, "buffer already exists and is live: {name}"),
            Self::WriterAlreadyConnected => write!(f, "a writer is already connected"),
            Self::InvalidOieb(reason) => write!(f, "invalid OIEB: {reason}"),
            Self::InvalidFrameSize { size, max } => {
                write!(f, "invalid frame size {size} (max {max})")
            }
            Self::FrameTooLarge { requested, capacity } => write!(
                f,
                "frame of {requested} bytes cannot fit in a ring of {capacity} bytes"
            ),
            Self::SequenceError { expected, actual } => {
                write!(f, "sequence error: expected {expected}, got {actual}")
            }
            Self::WriterDead => write!(f, "writer process is no longer alive"),
            Self::ReaderDead => write!(f, "reader process is no longer alive"),
            Self::BufferFull => write!(f, "ring buffer has no space for a non-blocking write"),
            Self::MetadataAlreadyWritten => write!(f, "metadata has already been written"),
            Self::MetadataTooLarge { requested, capacity } => write!(
                f,
                "metadata of {requested} bytes exceeds block of {capacity} bytes"
            ),
            Self::MetadataNotSupported => write!(f, "buffer was created with metadata_size = 0"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::SystemResourceExhausted(e) => write!(f, "system resource exhausted: {e}"),
            Self::InvalidName(name) => write!(f, "invalid buffer name: {name}"),
            Self::InvalidConfiguration(reason) => write!(f, "invalid buffer configuration: {reason}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ZeroBufferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SystemResourceExhausted(e) | Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ZeroBufferError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Result type for zerobuffer operations.
pub type Result<T> = std::result::Result<T, ZeroBufferError>;

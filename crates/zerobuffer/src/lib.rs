// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # zerobuffer - zero-copy shared memory IPC
//!
//! A single-producer/single-consumer ring buffer over POSIX or Win32 shared
//! memory, with a fixed 128-byte control block and two named semaphores
//! providing the handshake between writer and reader. Frames are copied
//! once, from caller memory straight into the mapped region (or filled
//! in place via [`writer::Writer::reserve_frame`]); there is no
//! intermediate buffering, socket, or serialization layer.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use zerobuffer::{BufferConfig, Reader, Writer};
//!
//! # fn main() -> zerobuffer::Result<()> {
//! let config = BufferConfig::new(1024, 1 << 20)?;
//! let reader = Reader::create("my-channel", config)?;
//!
//! // In another process:
//! let mut writer = Writer::attach("my-channel")?;
//! writer.write_frame(b"hello", Duration::from_secs(1))?;
//!
//! let frame = reader.read_frame(Duration::from_secs(1))?;
//! assert_eq!(frame.payload(), b"hello");
//! reader.release_frame(frame)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +-----------------------------------------------------------------+
//! | OIEB (128 bytes): 16 little-endian u64 counters, release/acquire |
//! +-----------------------------------------------------------------+
//! | metadata block (metadata_size bytes, write-once)                 |
//! +-----------------------------------------------------------------+
//! | payload ring (payload_size bytes): [header][payload][header]...  |
//! +-----------------------------------------------------------------+
//!
//!           sem-w (writer posts, reader waits): "data available"
//!           sem-r (reader posts, writer waits): "space freed"
//! ```
//!
//! Each section starts on a 64-byte boundary from the start of the region
//! and is padded up to one: requesting a 100-byte metadata block actually
//! reserves 128 bytes, and [`reader::BufferConfig`] stores the rounded size
//! (not the requested one) in the OIEB so an attaching [`Writer`] sees the
//! real layout. Frame headers inside the payload ring are packed, not
//! aligned.
//!
//! Each frame is prefixed with a 16-byte header (`payload_size`,
//! `sequence_number`); a header with both fields zero is a wrap marker
//! consumed instead of a real frame whenever the ring wraps around to
//! offset `0`. Sequence numbers are strictly monotonic starting at `1`,
//! letting a reader detect a missed or reordered frame without any
//! additional bookkeeping.
//!
//! ## Key types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Reader`] | Creates a buffer and consumes frames from it |
//! | [`Writer`] | Attaches to a buffer and produces frames into it |
//! | [`BufferConfig`] | Metadata and payload region sizing for a new buffer |
//! | [`FrameGuard`] | A borrowed, in-place view of one consumed frame |
//! | [`duplex::DuplexServer`] / [`duplex::DuplexClient`] | Paired request/response channels |
//!
//! ## Modules overview
//!
//! - [`reader`] / [`writer`] - the two halves of a plain channel
//! - [`duplex`] - request/response channels built from a pair of plain ones
//! - [`oieb`] - the 128-byte control block and its ordering discipline
//! - [`ring`] - free-space accounting and raw frame copies
//! - [`frame`] - the 16-byte frame header and wrap marker
//! - [`platform`] - the POSIX and Win32 shared-memory/semaphore/lock backends
//! - [`lifecycle`] - naming conventions and creation-race arbitration
//! - [`error`] - the error taxonomy shared by every operation
//!
//! ## Non-goals
//!
//! No multiple writers or readers per buffer, no network transport, no
//! encryption, no persistence to disk, and no message routing: a buffer
//! connects exactly one writer to exactly one reader, in one process each.

pub mod duplex;
pub mod error;
pub mod frame;
pub mod lifecycle;
pub mod oieb;
pub mod platform;
pub mod reader;
pub mod ring;
pub mod writer;

pub use duplex::{DuplexClient, DuplexServer, ProcessingMode};
pub use error::{Result, ZeroBufferError};
pub use reader::{BufferConfig, FrameGuard, Reader, ReaderStats};
pub use writer::{WriteReservation, Writer, WriterStats};

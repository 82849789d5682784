// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The reader side of a zerobuffer channel: creates the shared memory
//! segment and both semaphores, owns their names for the lifetime of the
//! buffer, and consumes frames the writer produces.

use std::cell::Cell;
use std::time::{Duration, Instant};

use crate::error::{Result, ZeroBufferError};
use crate::frame::{FrameHeader, HEADER_SIZE};
use crate::lifecycle::{self, ResourceNames};
use crate::oieb::{self, OiebView, OIEB_SIZE};
use crate::platform::{self, Segment, Semaphore, WaitOutcome};
use crate::ring::{self, ReadStep, RingView};

/// Sizing for a freshly created buffer.
///
/// Both fields are the *requested* sizes; the actual metadata block and
/// payload ring are each rounded up to a 64-byte boundary, and the rounded
/// values (not these) are what end up in the OIEB and what a later
/// [`crate::writer::Writer::attach`] observes.
#[derive(Debug, Clone, Copy)]
pub struct BufferConfig {
    pub metadata_size: u64,
    pub payload_size: u64,
}

/// Minimum payload region size: small enough to be a deliberate limit, not
/// an accident of one frame header's size.
pub const MIN_PAYLOAD_SIZE: u64 = 64;

impl BufferConfig {
    pub fn new(metadata_size: u64, payload_size: u64) -> Result<Self> {
        if payload_size < MIN_PAYLOAD_SIZE {
            return Err(ZeroBufferError::InvalidConfiguration(format!(
                "payload_size {payload_size} is below the minimum of {MIN_PAYLOAD_SIZE}"
            )));
        }
        Ok(Self {
            metadata_size,
            payload_size,
        })
    }

    /// Metadata block size after rounding up to [`oieb::SECTION_ALIGNMENT`].
    fn aligned_metadata_size(&self) -> u64 {
        oieb::align_up(self.metadata_size)
    }

    /// Payload ring size after rounding up to [`oieb::SECTION_ALIGNMENT`].
    fn aligned_payload_size(&self) -> u64 {
        oieb::align_up(self.payload_size)
    }

    /// Total shared-region size: the (already 64-byte) OIEB plus the two
    /// sections, each padded up to a 64-byte boundary.
    fn segment_size(&self) -> u64 {
        OIEB_SIZE + self.aligned_metadata_size() + self.aligned_payload_size()
    }
}

/// Point-in-time counters useful for diagnostics and tests.
#[derive(Debug, Clone, Copy)]
pub struct ReaderStats {
    pub payload_free_bytes: u64,
    pub payload_written_count: u64,
    pub payload_read_count: u64,
    pub writer_connected: bool,
}

/// Owns a zerobuffer channel's shared memory and both semaphores.
///
/// Dropping the `Reader` unmaps the segment and closes (but does not
/// unlink) both semaphores; call [`Reader::close`] to additionally remove
/// the system-wide names once no writer can still be attaching.
pub struct Reader {
    segment: Segment,
    oieb: OiebView,
    ring: RingView,
    data_semaphore: Semaphore,
    space_semaphore: Semaphore,
    names: ResourceNames,
    metadata_offset: u64,
    expected_sequence: Cell<u64>,
    outstanding: Cell<bool>,
    closed: Cell<bool>,
}

// SAFETY: every field either owns platform resources that are themselves
// Send + Sync (Segment, Semaphore) or is a Cell used only from the single
// thread that owns this Reader; no type here is shared across threads
// without external synchronization the caller provides.
unsafe impl Send for Reader {}

impl Reader {
    /// Create a brand-new buffer named `name`, sized per `config`.
    ///
    /// Fails with [`ZeroBufferError::AlreadyExists`] if a live reader
    /// already holds the name; a dead prior owner's resources are reclaimed
    /// automatically.
    pub fn create(name: &str, config: BufferConfig) -> Result<Self> {
        let names = ResourceNames::for_buffer(name)?;
        let _lock = lifecycle::acquire_creation_lock(&names)?;

        if let Ok(stale_segment) = Segment::open(&names.buffer_name, OIEB_SIZE as usize) {
            // SAFETY: stale_segment maps at least OIEB_SIZE bytes, enough
            // for a valid OiebView.
            let stale_oieb = unsafe { OiebView::new(stale_segment.as_ptr()) };
            let owner_pid = stale_oieb.reader_pid();
            drop(stale_segment);
            lifecycle::reclaim_if_stale(&names, Some(owner_pid as u32))?;
            if platform::process_exists(owner_pid as u32) {
                return Err(ZeroBufferError::AlreadyExists(names.buffer_name));
            }
        }

        let segment = Segment::create(&names.buffer_name, config.segment_size() as usize)?;
        // SAFETY: segment maps exactly `config.segment_size()` bytes,
        // freshly zeroed by `Segment::create`.
        let oieb = unsafe { OiebView::new(segment.as_ptr()) };
        let metadata_size = config.aligned_metadata_size();
        let payload_size = config.aligned_payload_size();
        oieb.init(metadata_size, payload_size, u64::from(platform::current_pid()));

        let metadata_offset = OIEB_SIZE;
        let payload_offset = OIEB_SIZE + metadata_size;
        // SAFETY: segment.as_ptr() + payload_offset is within the mapped
        // region by construction of `segment_size()`.
        let ring = unsafe { RingView::new(segment.as_ptr().add(payload_offset as usize), payload_size) };

        let data_semaphore = Semaphore::create(&names.write_semaphore, 0)?;
        let space_semaphore = Semaphore::create(&names.read_semaphore, 0)?;

        log::info!(
            "[zerobuffer] reader created buffer '{}' (metadata={} payload={})",
            names.buffer_name,
            metadata_size,
            payload_size
        );

        Ok(Self {
            segment,
            oieb,
            ring,
            data_semaphore,
            space_semaphore,
            names,
            metadata_offset,
            expected_sequence: Cell::new(1),
            outstanding: Cell::new(false),
            closed: Cell::new(false),
        })
    }

    /// Read-only access to the metadata payload written once by the writer
    /// (after its 8-byte length prefix), or `&[]` if none has been written
    /// yet.
    #[must_use]
    pub fn read_metadata(&self) -> &[u8] {
        let written = self.oieb.metadata_written_bytes();
        if written <= 8 {
            return &[];
        }
        // SAFETY: the metadata block is write-once; by the time
        // `metadata_written_bytes` is observed > 8 (an acquire load), the
        // writer's release store of the length prefix and payload has
        // already happened-before this read.
        unsafe {
            std::slice::from_raw_parts(
                self.segment.as_ptr().add(self.metadata_offset as usize + 8),
                (written - 8) as usize,
            )
        }
    }

    /// Block up to `timeout` for the next frame.
    pub fn read_frame(&self, timeout: Duration) -> Result<FrameGuard<'_>> {
        assert!(
            !self.outstanding.get(),
            "zerobuffer: read_frame called while a previous frame is still outstanding"
        );
        let deadline = Instant::now() + timeout;
        loop {
            let snap = self.oieb.acquire_snapshot();
            match ring::plan_read(snap.payload_read_pos, snap.payload_written_count, snap.payload_read_count, self.ring.capacity()) {
                ReadStep::Empty => {
                    if self.writer_is_dead() {
                        self.log_writer_dead();
                        return Err(ZeroBufferError::WriterDead);
                    }
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(ZeroBufferError::Timeout);
                    }
                    match self.data_semaphore.wait(remaining)? {
                        WaitOutcome::Signalled => continue,
                        WaitOutcome::TimedOut => {
                            if self.writer_is_dead() {
                                self.log_writer_dead();
                                return Err(ZeroBufferError::WriterDead);
                            }
                            return Err(ZeroBufferError::Timeout);
                        }
                    }
                }
                ReadStep::ImplicitWrap { wasted } => {
                    self.oieb.commit_wrap_read(wasted);
                    log::debug!(
                        "[zerobuffer] '{}' consumed implicit wrap ({} bytes wasted)",
                        self.names.buffer_name,
                        wasted
                    );
                    continue;
                }
                ReadStep::Frame { offset } => {
                    let header = self.ring.read_header(offset);
                    if header.is_wrap_marker() {
                        let wasted = self.ring.capacity() - offset;
                        self.oieb.commit_wrap_read(wasted);
                        log::debug!(
                            "[zerobuffer] '{}' consumed wrap marker at {} ({} bytes wasted)",
                            self.names.buffer_name,
                            offset,
                            wasted
                        );
                        continue;
                    }
                    let expected = self.expected_sequence.get();
                    if header.sequence_number != expected {
                        return Err(ZeroBufferError::SequenceError {
                            expected,
                            actual: header.sequence_number,
                        });
                    }
                    let max_payload = self.ring.capacity() - HEADER_SIZE;
                    if header.payload_size == 0 || header.payload_size > max_payload {
                        return Err(ZeroBufferError::InvalidFrameSize {
                            size: header.payload_size,
                            max: max_payload,
                        });
                    }
                    // SAFETY: `payload_slice` borrows bytes this reader
                    // will not overwrite until `release_frame` consumes the
                    // guard this call returns; `outstanding` enforces that
                    // no second `read_frame` call can race it.
                    let payload = unsafe { self.ring.payload_slice(offset + HEADER_SIZE, header.payload_size) };
                    self.outstanding.set(true);
                    log::debug!(
                        "[zerobuffer] '{}' read frame seq={} size={}",
                        self.names.buffer_name,
                        header.sequence_number,
                        header.payload_size
                    );
                    return Ok(FrameGuard {
                        payload,
                        sequence: header.sequence_number,
                        offset,
                        frame_total: HEADER_SIZE + header.payload_size,
                    });
                }
            }
        }
    }

    /// Release a frame previously returned by [`Reader::read_frame`],
    /// making its space available to the writer again.
    pub fn release_frame(&self, frame: FrameGuard<'_>) -> Result<()> {
        let new_read_pos = frame.offset + frame.frame_total;
        self.oieb.commit_read(new_read_pos, frame.frame_total);
        self.expected_sequence.set(frame.sequence + 1);
        self.outstanding.set(false);
        self.space_semaphore.post()
    }

    #[must_use]
    pub fn is_writer_connected(&self) -> bool {
        let pid = self.oieb.writer_pid();
        pid != 0 && platform::process_exists(pid as u32)
    }

    /// True once a writer has attached and that writer's process is no
    /// longer alive. A buffer that has never had a writer attach is not
    /// "dead", just not yet connected.
    fn writer_is_dead(&self) -> bool {
        let pid = self.oieb.writer_pid();
        pid != 0 && !platform::process_exists(pid as u32)
    }

    fn log_writer_dead(&self) {
        log::debug!("[zerobuffer] '{}' writer peer is no longer alive", self.names.buffer_name);
    }

    #[must_use]
    pub fn stats(&self) -> ReaderStats {
        let snap = self.oieb.acquire_snapshot();
        ReaderStats {
            payload_free_bytes: snap.payload_free_bytes,
            payload_written_count: snap.payload_written_count,
            payload_read_count: snap.payload_read_count,
            writer_connected: self.is_writer_connected(),
        }
    }

    /// Unlink the segment and both semaphores. Only the reader that created
    /// the buffer should call this, and only once the writer (if any) has
    /// finished.
    pub fn close(self) {
        self.closed.set(true);
        Segment::unlink(&self.names.buffer_name).ok();
        Semaphore::unlink(&self.names.write_semaphore).ok();
        Semaphore::unlink(&self.names.read_semaphore).ok();
        log::info!("[zerobuffer] reader closed and unlinked buffer '{}'", self.names.buffer_name);
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        if !self.closed.get() {
            log::debug!("[zerobuffer] reader for '{}' dropped without close()", self.names.buffer_name);
        }
    }
}

/// A borrowed, in-place view of a single frame's payload.
///
/// Consumed by [`Reader::release_frame`]; dropping it without releasing
/// leaks its space in the ring until the buffer is closed (it does not
/// panic: best effort on drop, explicit method for the common path).
pub struct FrameGuard<'a> {
    payload: &'a [u8],
    sequence: u64,
    offset: u64,
    frame_total: u64,
}

impl<'a> FrameGuard<'a> {
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.payload
    }

    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(prefix: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        format!("zb_rtest_{prefix}_{ts}")
    }

    #[test]
    fn odd_sizes_round_up_to_section_alignment() {
        let name = unique_name("align");
        // 100 and 900 both round up to the next 64-byte multiple; a writer
        // attaching later must see the rounded sizes, not the requested ones.
        let reader = Reader::create(&name, BufferConfig::new(100, 900).unwrap()).unwrap();
        let snap = reader.oieb.acquire_snapshot();
        assert_eq!(snap.metadata_size, 128);
        assert_eq!(snap.payload_size, 960);
        reader.close();
    }

    #[test]
    fn create_then_close_round_trip() {
        let name = unique_name("create");
        let reader = Reader::create(&name, BufferConfig::new(1024, 4096).unwrap()).unwrap();
        assert_eq!(reader.read_metadata(), &[] as &[u8]);
        reader.close();
    }

    #[test]
    fn read_frame_times_out_when_empty() {
        let name = unique_name("timeout");
        let reader = Reader::create(&name, BufferConfig::new(0, 4096).unwrap()).unwrap();
        let result = reader.read_frame(Duration::from_millis(50));
        assert!(matches!(result, Err(ZeroBufferError::Timeout)));
        reader.close();
    }
}

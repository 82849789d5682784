// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The writer side of a zerobuffer channel: attaches to a buffer a reader
//! already created, claims the single-writer slot, and produces frames.

use std::time::{Duration, Instant};

use crate::error::{Result, ZeroBufferError};
use crate::frame::{FrameHeader, HEADER_SIZE};
use crate::lifecycle::ResourceNames;
use crate::oieb::{OiebView, OIEB_SIZE};
use crate::platform::{self, Segment, Semaphore, WaitOutcome};
use crate::ring::{self, RingView};

/// Point-in-time counters useful for diagnostics and tests.
#[derive(Debug, Clone, Copy)]
pub struct WriterStats {
    pub payload_free_bytes: u64,
    pub payload_written_count: u64,
    pub payload_read_count: u64,
    pub reader_connected: bool,
}

/// Attaches to an existing buffer and writes frames into it.
///
/// Exactly one `Writer` may be attached to a buffer at a time; a second
/// attach attempt fails with [`ZeroBufferError::WriterAlreadyConnected`]
/// while the first is still alive.
pub struct Writer {
    segment: Segment,
    oieb: OiebView,
    ring: RingView,
    data_semaphore: Semaphore,
    space_semaphore: Semaphore,
    names: ResourceNames,
    metadata_offset: u64,
    metadata_capacity: u64,
    next_sequence: u64,
}

// SAFETY: Writer is only ever driven by the single process/thread that
// attached it; the fields it owns are themselves Send + Sync.
unsafe impl Send for Writer {}

impl Writer {
    /// Attach to a buffer named `name`, previously created by a `Reader`.
    pub fn attach(name: &str) -> Result<Self> {
        let names = ResourceNames::for_buffer(name)?;

        // SAFETY: a fresh mapping of exactly OIEB_SIZE bytes is enough to
        // read `operation_size`/`metadata_size`/`payload_size` and compute
        // the real segment size.
        let probe = Segment::open(&names.buffer_name, OIEB_SIZE as usize)?;
        let probe_oieb = unsafe { OiebView::new(probe.as_ptr()) };
        let metadata_size = probe_oieb.metadata_size();
        let payload_size = {
            let snap = probe_oieb.acquire_snapshot();
            snap.payload_size
        };
        drop(probe);

        let segment_size = OIEB_SIZE + metadata_size + payload_size;
        let segment = Segment::open(&names.buffer_name, segment_size as usize)?;
        // SAFETY: segment maps `segment_size` bytes, matching the layout
        // the reader initialized.
        let oieb = unsafe { OiebView::new(segment.as_ptr()) };
        oieb.validate(metadata_size, payload_size)?;

        let reader_pid = oieb.reader_pid();
        if reader_pid == 0 || !platform::process_exists(reader_pid as u32) {
            return Err(ZeroBufferError::ReaderDead);
        }

        let pid = u64::from(platform::current_pid());
        if !oieb.claim_writer_pid(pid) {
            // Someone else holds writer_pid. If they're alive, we lose; if
            // they're dead, steal the slot with a CAS from their exact pid
            // so a third racing attacher can't also believe it won.
            loop {
                let existing = oieb.writer_pid();
                if existing != 0 && platform::process_exists(existing as u32) {
                    return Err(ZeroBufferError::WriterAlreadyConnected);
                }
                if oieb.steal_writer_pid(existing, pid) {
                    break;
                }
            }
        }

        let metadata_offset = OIEB_SIZE;
        let payload_offset = OIEB_SIZE + metadata_size;
        // SAFETY: payload_offset + payload_size <= segment_size by
        // construction above.
        let ring = unsafe { RingView::new(segment.as_ptr().add(payload_offset as usize), payload_size) };

        let data_semaphore = Semaphore::open(&names.write_semaphore)?;
        let space_semaphore = Semaphore::open(&names.read_semaphore)?;

        let next_sequence = oieb.acquire_snapshot().payload_written_count + 1;

        log::info!("[zerobuffer] writer attached to buffer '{}'", names.buffer_name);

        Ok(Self {
            segment,
            oieb,
            ring,
            data_semaphore,
            space_semaphore,
            names,
            metadata_offset,
            metadata_capacity: metadata_size,
            next_sequence,
        })
    }

    /// Write the one-time metadata block. Fails if metadata has already
    /// been written, the buffer has `metadata_size == 0`, or the 8-byte
    /// length prefix plus `bytes` does not fit in the configured metadata
    /// block.
    pub fn set_metadata(&mut self, bytes: &[u8]) -> Result<()> {
        if self.metadata_capacity == 0 {
            return Err(ZeroBufferError::MetadataNotSupported);
        }
        if self.oieb.metadata_written_bytes() != 0 {
            return Err(ZeroBufferError::MetadataAlreadyWritten);
        }
        if bytes.len() as u64 + 8 > self.metadata_capacity {
            return Err(ZeroBufferError::MetadataTooLarge {
                requested: bytes.len(),
                capacity: self.metadata_capacity,
            });
        }
        // SAFETY: metadata_offset..+8+bytes.len() is within the segment:
        // bytes.len() + 8 <= metadata_capacity, checked above.
        unsafe {
            let base = self.segment.as_ptr().add(self.metadata_offset as usize);
            std::ptr::copy_nonoverlapping((bytes.len() as u64).to_le_bytes().as_ptr(), base, 8);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(8), bytes.len());
        }
        self.oieb.commit_metadata(8 + bytes.len() as u64);
        Ok(())
    }

    /// Block up to `timeout` for enough free space, then write `payload`.
    pub fn write_frame(&mut self, payload: &[u8], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_write_frame(payload) {
                Err(ZeroBufferError::BufferFull) => {
                    if !self.is_reader_connected() {
                        self.log_reader_dead();
                        return Err(ZeroBufferError::ReaderDead);
                    }
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(ZeroBufferError::Timeout);
                    }
                    match self.space_semaphore.wait(remaining)? {
                        WaitOutcome::Signalled => continue,
                        WaitOutcome::TimedOut => {
                            if !self.is_reader_connected() {
                                self.log_reader_dead();
                                return Err(ZeroBufferError::ReaderDead);
                            }
                            return Err(ZeroBufferError::Timeout);
                        }
                    }
                }
                other => return other,
            }
        }
    }

    /// Block up to `timeout` for enough free space, then write `payload`
    /// tagged with an explicit `sequence` number instead of this writer's
    /// own monotonic counter.
    ///
    /// Used by [`crate::duplex::DuplexServer`] to echo a response frame's
    /// sequence number from the request it answers, so the client can
    /// correlate the two without an extra header field.
    pub fn write_frame_with_sequence(&mut self, payload: &[u8], sequence: u64, timeout: Duration) -> Result<()> {
        self.next_sequence = sequence;
        self.write_frame(payload, timeout)
    }

    /// Write `payload` without blocking. Fails with
    /// [`ZeroBufferError::BufferFull`] if there is not currently enough
    /// contiguous and total free space.
    pub fn try_write_frame(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(ZeroBufferError::InvalidFrameSize { size: 0, max: self.ring.capacity() });
        }
        let capacity = self.ring.capacity();
        let frame_total = HEADER_SIZE + payload.len() as u64;
        if frame_total > capacity {
            return Err(ZeroBufferError::FrameTooLarge {
                requested: payload.len() as u64,
                capacity,
            });
        }
        if !self.is_reader_connected() {
            self.log_reader_dead();
            return Err(ZeroBufferError::ReaderDead);
        }

        let snap = self.oieb.acquire_snapshot();
        let plan = ring::plan_write(
            snap.payload_write_pos,
            snap.payload_read_pos,
            snap.payload_free_bytes,
            capacity,
            payload.len() as u64,
        )
        .ok_or(ZeroBufferError::BufferFull)?;

        if plan.wrapped {
            if plan.marker_written {
                self.ring.write_wrap_marker(snap.payload_write_pos);
            }
            self.oieb.commit_wrap_write(plan.wasted);
            log::debug!(
                "[zerobuffer] '{}' wrap marker at {} ({} bytes wasted)",
                self.names.buffer_name,
                snap.payload_write_pos,
                plan.wasted
            );
        }

        let sequence = self.next_sequence;
        let header = FrameHeader {
            payload_size: payload.len() as u64,
            sequence_number: sequence,
        };
        self.ring.write_frame(plan.offset, header, payload);
        self.oieb.commit_write(plan.offset + plan.frame_total, plan.frame_total);
        self.next_sequence += 1;
        self.data_semaphore.post()?;
        log::debug!(
            "[zerobuffer] '{}' wrote frame seq={} size={}",
            self.names.buffer_name,
            sequence,
            payload.len()
        );
        Ok(())
    }

    /// Reserve space for a `payload_size`-byte frame without blocking,
    /// returning a guard that must be filled and committed. Lets a caller
    /// construct the payload directly in shared memory instead of copying
    /// from an owned buffer.
    pub fn reserve_frame(&mut self, payload_size: u64) -> Result<WriteReservation<'_>> {
        if payload_size == 0 {
            return Err(ZeroBufferError::InvalidFrameSize { size: 0, max: self.ring.capacity() });
        }
        let capacity = self.ring.capacity();
        let frame_total = HEADER_SIZE + payload_size;
        if frame_total > capacity {
            return Err(ZeroBufferError::FrameTooLarge {
                requested: payload_size,
                capacity,
            });
        }
        if !self.is_reader_connected() {
            self.log_reader_dead();
            return Err(ZeroBufferError::ReaderDead);
        }
        let snap = self.oieb.acquire_snapshot();
        let plan = ring::plan_write(
            snap.payload_write_pos,
            snap.payload_read_pos,
            snap.payload_free_bytes,
            capacity,
            payload_size,
        )
        .ok_or(ZeroBufferError::BufferFull)?;

        if plan.wrapped {
            if plan.marker_written {
                self.ring.write_wrap_marker(snap.payload_write_pos);
            }
            self.oieb.commit_wrap_write(plan.wasted);
            log::debug!(
                "[zerobuffer] '{}' wrap marker at {} ({} bytes wasted)",
                self.names.buffer_name,
                snap.payload_write_pos,
                plan.wasted
            );
        }

        Ok(WriteReservation {
            writer: self,
            offset: plan.offset,
            frame_total: plan.frame_total,
            payload_size,
        })
    }

    #[must_use]
    pub fn is_reader_connected(&self) -> bool {
        let pid = self.oieb.reader_pid();
        pid != 0 && platform::process_exists(pid as u32)
    }

    fn log_reader_dead(&self) {
        log::debug!("[zerobuffer] '{}' reader peer is no longer alive", self.names.buffer_name);
    }

    #[must_use]
    pub fn stats(&self) -> WriterStats {
        let snap = self.oieb.acquire_snapshot();
        WriterStats {
            payload_free_bytes: snap.payload_free_bytes,
            payload_written_count: snap.payload_written_count,
            payload_read_count: snap.payload_read_count,
            reader_connected: self.is_reader_connected(),
        }
    }

    /// Release the single-writer claim, leaving the buffer itself intact
    /// for the next writer to attach.
    pub fn close(self) {
        self.oieb.set_writer_pid(0);
        log::info!("[zerobuffer] writer detached from buffer '{}'", self.names.buffer_name);
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.oieb.set_writer_pid(0);
    }
}

/// A reserved, not-yet-published frame slot directly in shared memory.
pub struct WriteReservation<'a> {
    writer: &'a mut Writer,
    offset: u64,
    frame_total: u64,
    payload_size: u64,
}

impl<'a> WriteReservation<'a> {
    /// Mutable access to the reserved payload bytes, to fill in place.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: offset + HEADER_SIZE .. +payload_size was reserved
        // exclusively for this write by `Writer::reserve_frame`, and no
        // other writer can exist concurrently (single-writer claim).
        unsafe { self.writer.ring.payload_mut(self.offset + HEADER_SIZE, self.payload_size) }
    }

    /// Publish the reserved frame, assigning the next sequence number and
    /// making it visible to the reader.
    pub fn commit(self) -> Result<()> {
        let sequence = self.writer.next_sequence;
        let header = FrameHeader {
            payload_size: self.payload_size,
            sequence_number: sequence,
        };
        self.writer.ring.write_header(self.offset, header);
        self.writer.oieb.commit_write(self.offset + self.frame_total, self.frame_total);
        self.writer.next_sequence += 1;
        self.writer.data_semaphore.post()?;
        log::debug!(
            "[zerobuffer] '{}' wrote frame seq={} size={}",
            self.writer.names.buffer_name,
            sequence,
            self.payload_size
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{BufferConfig, Reader};

    fn unique_name(prefix: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        format!("zb_wtest_{prefix}_{ts}")
    }

    #[test]
    fn attach_without_reader_fails() {
        let name = unique_name("noreader");
        assert!(Writer::attach(&name).is_err());
    }

    #[test]
    fn attach_claims_writer_slot_exclusively() {
        let name = unique_name("exclusive");
        let reader = Reader::create(&name, BufferConfig::new(0, 4096).unwrap()).unwrap();
        let _writer = Writer::attach(&name).unwrap();
        let second = Writer::attach(&name);
        assert!(matches!(second, Err(ZeroBufferError::WriterAlreadyConnected)));
        reader.close();
    }

    #[test]
    fn write_then_read_simple_frame() {
        let name = unique_name("simple");
        let reader = Reader::create(&name, BufferConfig::new(0, 4096).unwrap()).unwrap();
        let mut writer = Writer::attach(&name).unwrap();
        writer.try_write_frame(b"hello").unwrap();
        let frame = reader.read_frame(Duration::from_secs(1)).unwrap();
        assert_eq!(frame.payload(), b"hello");
        assert_eq!(frame.sequence(), 1);
        reader.release_frame(frame).unwrap();
        reader.close();
    }
}

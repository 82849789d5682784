// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The Operation Info Exchange Block: a fixed 128-byte header of sixteen
//! little-endian `u64` fields that both peers use to hand off flow-control
//! state across the release/acquire boundary.
//!
//! # Memory ordering
//!
//! After producing data (a frame payload or a metadata block), the
//! producing side performs a *release* store on the counters that advertise
//! the new state so the prior payload writes are visible to anyone who later
//! performs an *acquire* load of those same counters. This is the portable
//! substitute for the `memory_order_release`/`memory_order_acquire` pair the
//! reference implementations use; the semaphore wait/post pair that brackets
//! every transfer provides the same happens-before edge on most platforms,
//! but the ordering here does not depend on that being true everywhere.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, ZeroBufferError};

/// Fixed size of the OIEB, in bytes.
pub const OIEB_SIZE: u64 = 128;

/// Byte boundary every shared-region section (OIEB, metadata block, payload
/// ring) starts on and is padded to.
pub const SECTION_ALIGNMENT: u64 = 64;

/// Round `n` up to the next multiple of [`SECTION_ALIGNMENT`].
#[must_use]
pub fn align_up(n: u64) -> u64 {
    let rem = n % SECTION_ALIGNMENT;
    if rem == 0 {
        n
    } else {
        n + (SECTION_ALIGNMENT - rem)
    }
}

#[repr(C)]
struct OiebFields {
    operation_size: AtomicU64,
    metadata_size: AtomicU64,
    metadata_free_bytes: AtomicU64,
    metadata_written_bytes: AtomicU64,
    payload_size: AtomicU64,
    payload_free_bytes: AtomicU64,
    payload_write_pos: AtomicU64,
    payload_read_pos: AtomicU64,
    payload_written_count: AtomicU64,
    payload_read_count: AtomicU64,
    writer_pid: AtomicU64,
    reader_pid: AtomicU64,
    reserved: [AtomicU64; 4],
}

const _: () = assert!(std::mem::size_of::<OiebFields>() == OIEB_SIZE as usize);

/// A consistent, acquire-loaded snapshot of the fields a write or read
/// decision needs. Plain data; no further synchronization implied.
#[derive(Debug, Clone, Copy)]
pub struct OiebSnapshot {
    pub operation_size: u64,
    pub metadata_size: u64,
    pub metadata_free_bytes: u64,
    pub metadata_written_bytes: u64,
    pub payload_size: u64,
    pub payload_free_bytes: u64,
    pub payload_write_pos: u64,
    pub payload_read_pos: u64,
    pub payload_written_count: u64,
    pub payload_read_count: u64,
    pub writer_pid: u64,
    pub reader_pid: u64,
}

/// A typed, aligned view over the first 128 bytes of the shared region.
///
/// `OiebView` does not own the memory it points at; it borrows the mapping
/// for as long as the owning `Reader`/`Writer` keeps the segment mapped.
#[derive(Clone, Copy)]
pub struct OiebView {
    ptr: *const OiebFields,
}

// SAFETY: all field access goes through atomics at a fixed, shared-memory
// address; the struct itself carries no thread-confined state.
unsafe impl Send for OiebView {}
unsafe impl Sync for OiebView {}

impl OiebView {
    /// Wrap a pointer to the start of a mapped shared-memory region.
    ///
    /// # Safety
    /// `ptr` must be valid, writable, and at least `OIEB_SIZE` bytes, for as
    /// long as the returned view is used, and must be 8-byte aligned (true
    /// of any `mmap`/`CreateFileMapping` base address).
    #[inline]
    pub unsafe fn new(ptr: *mut u8) -> Self {
        Self {
            ptr: ptr as *const OiebFields,
        }
    }

    #[inline]
    fn fields(&self) -> &OiebFields {
        // SAFETY: constructed from a valid, sufficiently sized, aligned
        // pointer in `new`.
        unsafe { &*self.ptr }
    }

    #[inline]
    fn load(field: &AtomicU64, order: Ordering) -> u64 {
        u64::from_le(field.load(order))
    }

    #[inline]
    fn store(field: &AtomicU64, value: u64, order: Ordering) {
        field.store(value.to_le(), order);
    }

    /// Atomically add `delta` to a little-endian-encoded counter via a CAS
    /// loop, so concurrent updates from both sides of the ring (only
    /// `payload_free_bytes` is touched by both writer and reader) cannot
    /// silently drop one side's update the way an independent load-then-store
    /// pair would.
    #[inline]
    fn fetch_add(field: &AtomicU64, delta: u64, order: Ordering) {
        let mut cur_le = field.load(Ordering::Relaxed);
        loop {
            let new = (u64::from_le(cur_le) + delta).to_le();
            match field.compare_exchange_weak(cur_le, new, order, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => cur_le = actual,
            }
        }
    }

    /// Atomically subtract `delta` from a little-endian-encoded counter; see
    /// [`OiebView::fetch_add`].
    #[inline]
    fn fetch_sub(field: &AtomicU64, delta: u64, order: Ordering) {
        let mut cur_le = field.load(Ordering::Relaxed);
        loop {
            let new = (u64::from_le(cur_le) - delta).to_le();
            match field.compare_exchange_weak(cur_le, new, order, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => cur_le = actual,
            }
        }
    }

    /// Zero every field, then write the initial layout for a freshly
    /// created buffer. Only the reader, at construction time, should call
    /// this.
    pub fn init(&self, metadata_size: u64, payload_size: u64, reader_pid: u64) {
        let f = self.fields();
        Self::store(&f.operation_size, OIEB_SIZE, Ordering::Relaxed);
        Self::store(&f.metadata_size, metadata_size, Ordering::Relaxed);
        Self::store(&f.metadata_free_bytes, metadata_size, Ordering::Relaxed);
        Self::store(&f.metadata_written_bytes, 0, Ordering::Relaxed);
        Self::store(&f.payload_size, payload_size, Ordering::Relaxed);
        Self::store(&f.payload_free_bytes, payload_size, Ordering::Relaxed);
        Self::store(&f.payload_write_pos, 0, Ordering::Relaxed);
        Self::store(&f.payload_read_pos, 0, Ordering::Relaxed);
        Self::store(&f.payload_written_count, 0, Ordering::Relaxed);
        Self::store(&f.payload_read_count, 0, Ordering::Relaxed);
        Self::store(&f.writer_pid, 0, Ordering::Relaxed);
        Self::store(&f.reader_pid, reader_pid, Ordering::Release);
    }

    /// Validate `operation_size`, `metadata_size`, and `payload_size` against
    /// what the caller expects for the mapped region.
    pub fn validate(&self, expected_metadata_size: u64, expected_payload_size: u64) -> Result<()> {
        let op_size = Self::load(&self.fields().operation_size, Ordering::Acquire);
        if op_size != OIEB_SIZE {
            return Err(ZeroBufferError::InvalidOieb(format!(
                "operation_size is {op_size}, expected {OIEB_SIZE}"
            )));
        }
        let meta_size = Self::load(&self.fields().metadata_size, Ordering::Acquire);
        if meta_size != expected_metadata_size {
            return Err(ZeroBufferError::InvalidOieb(format!(
                "metadata_size is {meta_size}, expected {expected_metadata_size}"
            )));
        }
        let payload_size = Self::load(&self.fields().payload_size, Ordering::Acquire);
        if payload_size != expected_payload_size {
            return Err(ZeroBufferError::InvalidOieb(format!(
                "payload_size is {payload_size}, expected {expected_payload_size}"
            )));
        }
        let snapshot = self.acquire_snapshot();
        if snapshot.payload_free_bytes > snapshot.payload_size
            || snapshot.payload_write_pos >= snapshot.payload_size
            || snapshot.payload_read_pos >= snapshot.payload_size
            || snapshot.payload_written_count < snapshot.payload_read_count
        {
            return Err(ZeroBufferError::InvalidOieb(
                "positions or counters out of range".to_string(),
            ));
        }
        Ok(())
    }

    /// Acquire-load every counter a write or read decision needs, as one
    /// internally-consistent snapshot.
    ///
    /// `payload_written_count`/`payload_read_count` (and
    /// `metadata_written_bytes`) are each the producing side's single
    /// release-ordered publication flag; they are loaded first so that the
    /// Acquire here actually establishes happens-before with that release
    /// before the guarded `payload_write_pos`/`payload_read_pos`/
    /// `payload_free_bytes` fields are read. Reading those first (as a prior
    /// version of this function did) would let a consumer observe a fresh
    /// count alongside a stale position or free-byte value.
    pub fn acquire_snapshot(&self) -> OiebSnapshot {
        let f = self.fields();
        let payload_written_count = Self::load(&f.payload_written_count, Ordering::Acquire);
        let payload_read_count = Self::load(&f.payload_read_count, Ordering::Acquire);
        let metadata_written_bytes = Self::load(&f.metadata_written_bytes, Ordering::Acquire);
        OiebSnapshot {
            operation_size: Self::load(&f.operation_size, Ordering::Relaxed),
            metadata_size: Self::load(&f.metadata_size, Ordering::Relaxed),
            metadata_free_bytes: Self::load(&f.metadata_free_bytes, Ordering::Acquire),
            metadata_written_bytes,
            payload_size: Self::load(&f.payload_size, Ordering::Relaxed),
            payload_free_bytes: Self::load(&f.payload_free_bytes, Ordering::Acquire),
            payload_write_pos: Self::load(&f.payload_write_pos, Ordering::Acquire),
            payload_read_pos: Self::load(&f.payload_read_pos, Ordering::Acquire),
            payload_written_count,
            payload_read_count,
            writer_pid: Self::load(&f.writer_pid, Ordering::Relaxed),
            reader_pid: Self::load(&f.reader_pid, Ordering::Relaxed),
        }
    }

    /// Release-store the writer-owned counters after a real frame is
    /// written: advance `payload_write_pos`, subtract the frame footprint
    /// from `payload_free_bytes`, increment `payload_written_count`.
    ///
    /// `payload_free_bytes` is updated through [`OiebView::fetch_sub`]
    /// rather than a load-then-store pair: the reader concurrently adds back
    /// to this same field from `commit_read`/`commit_wrap_read`, and a plain
    /// load-then-store would lose whichever side's update landed second.
    pub fn commit_write(&self, new_write_pos: u64, frame_total: u64) {
        let f = self.fields();
        let count = Self::load(&f.payload_written_count, Ordering::Relaxed);
        Self::store(&f.payload_write_pos, new_write_pos, Ordering::Relaxed);
        Self::fetch_sub(&f.payload_free_bytes, frame_total, Ordering::AcqRel);
        Self::store(
            &f.payload_written_count,
            count + 1,
            Ordering::Release,
        );
    }

    /// Release-store a wrap marker placement: reset `payload_write_pos` to
    /// `0` and deduct the wasted tail bytes from `payload_free_bytes`. Does
    /// not touch `payload_written_count` (wrap markers are not frames).
    pub fn commit_wrap_write(&self, wasted: u64) {
        let f = self.fields();
        Self::store(&f.payload_write_pos, 0, Ordering::Relaxed);
        Self::fetch_sub(&f.payload_free_bytes, wasted, Ordering::AcqRel);
    }

    /// Release-store the reader-owned counters after a real frame is
    /// released: advance `payload_read_pos`, add the frame footprint back to
    /// `payload_free_bytes`, increment `payload_read_count`.
    pub fn commit_read(&self, new_read_pos: u64, frame_total: u64) {
        let f = self.fields();
        let count = Self::load(&f.payload_read_count, Ordering::Relaxed);
        Self::store(&f.payload_read_pos, new_read_pos, Ordering::Relaxed);
        Self::fetch_add(&f.payload_free_bytes, frame_total, Ordering::AcqRel);
        Self::store(&f.payload_read_count, count + 1, Ordering::Release);
    }

    /// Release-store a wrap marker consumption: reset `payload_read_pos` to
    /// `0` and reclaim the wasted tail bytes into `payload_free_bytes`.
    pub fn commit_wrap_read(&self, wasted: u64) {
        let f = self.fields();
        Self::store(&f.payload_read_pos, 0, Ordering::Relaxed);
        Self::fetch_add(&f.payload_free_bytes, wasted, Ordering::AcqRel);
    }

    pub fn writer_pid(&self) -> u64 {
        Self::load(&self.fields().writer_pid, Ordering::Acquire)
    }

    pub fn set_writer_pid(&self, pid: u64) {
        Self::store(&self.fields().writer_pid, pid, Ordering::Release);
    }

    pub fn reader_pid(&self) -> u64 {
        Self::load(&self.fields().reader_pid, Ordering::Acquire)
    }

    pub fn set_reader_pid(&self, pid: u64) {
        Self::store(&self.fields().reader_pid, pid, Ordering::Release);
    }

    /// Compare-and-claim `writer_pid`: succeeds only if it currently reads
    /// `0`. Used to arbitrate a single writer attaching.
    pub fn claim_writer_pid(&self, pid: u64) -> bool {
        self.fields()
            .writer_pid
            .compare_exchange(0u64.to_le(), pid.to_le(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Compare-and-claim `writer_pid` away from a specific prior value
    /// (a dead writer's pid) rather than from `0`. Returns `false` on a
    /// lost race, in which case the caller re-reads `writer_pid` and
    /// decides whether to retry or fail.
    pub fn steal_writer_pid(&self, expected: u64, pid: u64) -> bool {
        self.fields()
            .writer_pid
            .compare_exchange(expected.to_le(), pid.to_le(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn metadata_written_bytes(&self) -> u64 {
        Self::load(&self.fields().metadata_written_bytes, Ordering::Acquire)
    }

    pub fn metadata_size(&self) -> u64 {
        Self::load(&self.fields().metadata_size, Ordering::Relaxed)
    }

    /// Release-store the metadata fields after the one-time metadata write.
    pub fn commit_metadata(&self, written_bytes: u64) {
        let f = self.fields();
        Self::store(
            &f.metadata_free_bytes,
            Self::load(&f.metadata_size, Ordering::Relaxed) - written_bytes,
            Ordering::Relaxed,
        );
        Self::store(&f.metadata_written_bytes, written_bytes, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_next_multiple_of_64() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 64);
        assert_eq!(align_up(64), 64);
        assert_eq!(align_up(65), 128);
        assert_eq!(align_up(100), 128);
    }

    fn with_view<F: FnOnce(OiebView)>(f: F) {
        let mut buf = vec![0u8; OIEB_SIZE as usize];
        let view = unsafe { OiebView::new(buf.as_mut_ptr()) };
        f(view);
    }

    #[test]
    fn init_then_validate() {
        with_view(|view| {
            view.init(1024, 4096, 42);
            assert!(view.validate(1024, 4096).is_ok());
            let snap = view.acquire_snapshot();
            assert_eq!(snap.payload_free_bytes, 4096);
            assert_eq!(snap.reader_pid, 42);
        });
    }

    #[test]
    fn validate_rejects_bad_operation_size() {
        with_view(|view| {
            view.init(0, 4096, 1);
            // Corrupt operation_size directly.
            let f = unsafe { &*(view.ptr) };
            f.operation_size.store(64u64.to_le(), Ordering::Relaxed);
            assert!(view.validate(0, 4096).is_err());
        });
    }

    #[test]
    fn claim_writer_pid_is_exclusive() {
        with_view(|view| {
            view.init(0, 4096, 1);
            assert!(view.claim_writer_pid(99));
            assert!(!view.claim_writer_pid(100));
            assert_eq!(view.writer_pid(), 99);
        });
    }

    #[test]
    fn commit_write_and_read_round_trip() {
        with_view(|view| {
            view.init(0, 1024, 1);
            view.commit_write(116, 116);
            let snap = view.acquire_snapshot();
            assert_eq!(snap.payload_write_pos, 116);
            assert_eq!(snap.payload_free_bytes, 1024 - 116);
            assert_eq!(snap.payload_written_count, 1);

            view.commit_read(116, 116);
            let snap = view.acquire_snapshot();
            assert_eq!(snap.payload_read_pos, 116);
            assert_eq!(snap.payload_free_bytes, 1024);
            assert_eq!(snap.payload_read_count, 1);
        });
    }
}

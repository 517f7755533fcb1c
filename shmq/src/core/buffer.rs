//! Circular addressing engine.
//!
//! Translates monotonically increasing logical offsets into wrapped physical
//! offsets inside a fixed byte region and performs split (wraparound-aware)
//! reads, writes, and zeroing. All raw pointer arithmetic in the crate is
//! confined to this module; offsets and lengths are validated against the
//! capacity before any copy.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

use super::FrameHeader;
use crate::errors::QueueError;

pub(crate) struct CircularBuffer {
    base: *mut u8,
    capacity: usize,
}

// The buffer holds a raw pointer into a shared mapping. Concurrent access is
// coordinated by the queue protocol (tail CAS, read lock, frame states), not
// by this type.
unsafe impl Send for CircularBuffer {}
unsafe impl Sync for CircularBuffer {}

impl CircularBuffer {
    pub fn new(base: *mut u8, capacity: usize) -> Result<CircularBuffer, QueueError> {
        if base.is_null() || capacity == 0 {
            return Err(QueueError::InvalidConfiguration(
                "circular buffer requires a non-null region with positive capacity".to_string(),
            ));
        }
        Ok(CircularBuffer { base, capacity })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Physical position of a logical offset. Total for every `i64` value so
    /// that wrapped offset arithmetic can never panic here.
    #[inline]
    pub fn adjust(&self, offset: i64) -> usize {
        (offset as u64 % self.capacity as u64) as usize
    }

    /// Read `length` bytes starting at `adjust(offset)` into a fresh vector,
    /// wrapping past the end of the region.
    pub fn read(&self, offset: i64, length: usize) -> Vec<u8> {
        let mut out = vec![0u8; length.min(self.capacity)];
        self.read_into(offset, &mut out);
        out
    }

    /// Read `dest.len()` bytes starting at `adjust(offset)`. Sizing `dest`
    /// is how callers cap a read; an empty slice touches no memory.
    pub fn read_into(&self, offset: i64, dest: &mut [u8]) {
        let length = dest.len().min(self.capacity);
        if length == 0 {
            return;
        }
        let pos = self.adjust(offset);
        let first = length.min(self.capacity - pos);
        unsafe {
            ptr::copy_nonoverlapping(self.base.add(pos), dest.as_mut_ptr(), first);
            if first < length {
                ptr::copy_nonoverlapping(self.base, dest.as_mut_ptr().add(first), length - first);
            }
        }
    }

    /// Write `src` starting at `adjust(offset)`, wrapping past the end of
    /// the region. Writing zero bytes is a no-op.
    pub fn write(&self, src: &[u8], offset: i64) {
        debug_assert!(src.len() <= self.capacity);
        if src.is_empty() {
            return;
        }
        let pos = self.adjust(offset);
        let first = src.len().min(self.capacity - pos);
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(pos), first);
            if first < src.len() {
                ptr::copy_nonoverlapping(src.as_ptr().add(first), self.base, src.len() - first);
            }
        }
    }

    /// Zero-fill `length` bytes starting at `adjust(offset)`, wrapping past
    /// the end of the region.
    pub fn zero(&self, offset: i64, length: usize) {
        let length = length.min(self.capacity);
        if length == 0 {
            return;
        }
        let pos = self.adjust(offset);
        let first = length.min(self.capacity - pos);
        unsafe {
            ptr::write_bytes(self.base.add(pos), 0, first);
            if first < length {
                ptr::write_bytes(self.base, 0, length - first);
            }
        }
    }

    /// Store a frame header at `adjust(offset)`. The body length lands
    /// first; the state store carries release ordering so a consumer that
    /// observes the state also observes the length and the payload.
    ///
    /// Frame headers never straddle the wrap point: frame offsets and the
    /// capacity are all multiples of 8.
    pub fn write_frame_header(&self, header: FrameHeader, offset: i64) {
        self.atomic_i32(offset + mem::size_of::<i32>() as i64)
            .store(header.body_length, Ordering::Relaxed);
        self.atomic_i32(offset).store(header.state, Ordering::Release);
    }

    /// 4-byte-aligned atomic view of a frame header field, used for the
    /// state transitions and the body-length read.
    #[inline]
    pub fn atomic_i32(&self, offset: i64) -> &AtomicI32 {
        let pos = self.adjust(offset);
        debug_assert!(pos % mem::align_of::<AtomicI32>() == 0);
        debug_assert!(pos + mem::size_of::<AtomicI32>() <= self.capacity);
        unsafe { &*(self.base.add(pos) as *const AtomicI32) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{STATE_READY_TO_BE_CONSUMED, FRAME_HEADER_SIZE};

    fn backing(capacity: usize) -> Vec<u8> {
        vec![0u8; capacity]
    }

    #[test]
    fn rejects_zero_capacity() {
        let mut mem = backing(8);
        assert!(CircularBuffer::new(mem.as_mut_ptr(), 0).is_err());
        assert!(CircularBuffer::new(std::ptr::null_mut(), 8).is_err());
    }

    #[test]
    fn adjust_wraps_logical_offsets() {
        let mut mem = backing(32);
        let buf = CircularBuffer::new(mem.as_mut_ptr(), 32).unwrap();
        assert_eq!(buf.adjust(0), 0);
        assert_eq!(buf.adjust(31), 31);
        assert_eq!(buf.adjust(32), 0);
        assert_eq!(buf.adjust(40), 8);
        assert_eq!(buf.adjust(96), 0);
    }

    #[test]
    fn write_and_read_across_the_wrap_point() {
        let mut mem = backing(16);
        let buf = CircularBuffer::new(mem.as_mut_ptr(), 16).unwrap();
        let payload: Vec<u8> = (1..=10).collect();
        // starts at physical 12, wraps after 4 bytes
        buf.write(&payload, 28);
        assert_eq!(buf.read(28, 10), payload);
        // the split really landed at both ends of the region
        assert_eq!(&mem[12..16], &payload[..4]);
        assert_eq!(&mem[0..6], &payload[4..]);
    }

    #[test]
    fn read_into_caps_at_destination_size() {
        let mut mem = backing(16);
        let buf = CircularBuffer::new(mem.as_mut_ptr(), 16).unwrap();
        buf.write(&[9, 8, 7, 6, 5], 0);
        let mut dest = [0u8; 3];
        buf.read_into(0, &mut dest);
        assert_eq!(dest, [9, 8, 7]);
    }

    #[test]
    fn zero_length_operations_touch_nothing() {
        let mut mem = backing(8);
        mem.fill(0xAA);
        let buf = CircularBuffer::new(mem.as_mut_ptr(), 8).unwrap();
        buf.write(&[], 3);
        buf.zero(3, 0);
        assert!(buf.read(0, 0).is_empty());
        assert!(mem.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn zero_wraps_like_write() {
        let mut mem = backing(16);
        mem.fill(0xFF);
        let buf = CircularBuffer::new(mem.as_mut_ptr(), 16).unwrap();
        buf.zero(12, 8);
        assert_eq!(&mem[12..16], &[0; 4]);
        assert_eq!(&mem[0..4], &[0; 4]);
        assert_eq!(&mem[4..12], &[0xFF; 8]);
    }

    #[test]
    fn frame_header_round_trips_through_the_atomics() {
        let mut mem = backing(32);
        let buf = CircularBuffer::new(mem.as_mut_ptr(), 32).unwrap();
        buf.write_frame_header(
            FrameHeader {
                state: STATE_READY_TO_BE_CONSUMED,
                body_length: 13,
            },
            24,
        );
        assert_eq!(
            buf.atomic_i32(24).load(Ordering::Acquire),
            STATE_READY_TO_BE_CONSUMED
        );
        assert_eq!(buf.atomic_i32(28).load(Ordering::Acquire), 13);
        buf.zero(24, FRAME_HEADER_SIZE);
        assert_eq!(buf.atomic_i32(24).load(Ordering::Acquire), 0);
    }
}

use std::sync::atomic::Ordering;

use ::shared_memory::Shmem;
use tracing::trace;

use crate::core::buffer::CircularBuffer;
use crate::core::{
    queue_context, round_up_8, FailFast, FrameHeader, QueueConfig, QueueHeader,
    FRAME_HEADER_SIZE, HEADER_SIZE, STATE_READY_TO_BE_CONSUMED,
};
use crate::errors::QueueError;
use crate::signal::{self, Releaser};

/// Enqueue side of the queue. Any number of publishers, in any number of
/// processes, may publish concurrently; they serialize on a CAS over the
/// shared tail offset and never block.
pub struct Publisher {
    // keeps the mapping alive for the lifetime of `header` and `buffer`
    _shmem: Shmem,
    header: *const QueueHeader,
    buffer: CircularBuffer,
    releaser: Box<dyn Releaser>,
}

// All shared-memory mutation goes through atomics or CAS-reserved exclusive
// ranges; the mapping itself outlives both fields that point into it.
unsafe impl Send for Publisher {}
unsafe impl Sync for Publisher {}

impl Publisher {
    pub fn new(cfg: &QueueConfig) -> Result<Publisher, QueueError> {
        let shmem = queue_context(cfg)?;
        let base = shmem.as_ptr();
        let header = base as *const QueueHeader;
        let buffer = CircularBuffer::new(unsafe { base.add(HEADER_SIZE) }, cfg.capacity)?;
        let releaser = signal::create_releaser(cfg)?;
        Ok(Publisher {
            _shmem: shmem,
            header,
            buffer,
            releaser,
        })
    }

    #[inline]
    fn header(&self) -> &QueueHeader {
        unsafe { &*self.header }
    }

    /// Publish one message. Returns `false`, with no side effect, when the
    /// padded frame does not fit the free space. Never blocks: the only
    /// contention point is the tail CAS, retried until it lands.
    pub fn publish(&self, message: &[u8]) -> bool {
        if message.len() > i32::MAX as usize {
            return false;
        }
        let frame_length = round_up_8(FRAME_HEADER_SIZE + message.len());
        if frame_length > self.buffer.capacity() {
            return false;
        }
        loop {
            let head = self.header().head_offset.load(Ordering::Acquire);
            let tail = self.header().tail_offset.load(Ordering::Acquire);
            if frame_length > Self::available_capacity(self.buffer.capacity(), head, tail) {
                trace!(
                    head_offset = head,
                    tail_offset = tail,
                    frame_length = frame_length,
                    "publish rejected: insufficient space"
                );
                return false;
            }
            let new_tail = tail.wrapping_add(frame_length as i64);
            if self
                .header()
                .tail_offset
                .compare_exchange(tail, new_tail, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // another publisher advanced the tail first
                continue;
            }

            // The CAS granted exclusive ownership of [tail, new_tail). From
            // here until the frame header lands the slot is reserved but not
            // self-consistent, and no other process can recover it.
            let guard = FailFast::arm("publish reservation left incomplete");
            self.buffer
                .write(message, tail.wrapping_add(FRAME_HEADER_SIZE as i64));
            self.buffer.write_frame_header(
                FrameHeader {
                    state: STATE_READY_TO_BE_CONSUMED,
                    body_length: message.len() as i32,
                },
                tail,
            );
            guard.disarm();

            trace!(
                tail_offset = tail,
                new_tail = new_tail,
                body_length = message.len(),
                "published message"
            );
            self.releaser.release();
            return true;
        }
    }

    /// Free bytes between the tail and the head, going around the ring.
    /// An empty ring (equal logical offsets) has the whole capacity free;
    /// coinciding physical positions with distinct logical offsets mean the
    /// ring is full.
    fn available_capacity(capacity: usize, head_offset: i64, tail_offset: i64) -> usize {
        if head_offset == tail_offset {
            return capacity;
        }
        let head_pos = (head_offset as u64 % capacity as u64) as usize;
        let tail_pos = (tail_offset as u64 % capacity as u64) as usize;
        if tail_pos > head_pos {
            capacity - (tail_pos - head_pos)
        } else if tail_pos < head_pos {
            head_pos - tail_pos
        } else {
            0
        }
    }
}

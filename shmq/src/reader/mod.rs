use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use ::shared_memory::Shmem;
use tracing::{debug, trace};

use crate::core::buffer::CircularBuffer;
use crate::core::{
    fatal, monotonic_ms, queue_context, round_up_8, CancelToken, QueueConfig, QueueHeader,
    FRAME_HEADER_SIZE, HEADER_SIZE, STATE_BEING_CREATED, STATE_LOCKED_TO_BE_CONSUMED,
    STATE_READY_TO_BE_CONSUMED,
};
use crate::errors::QueueError;
use crate::signal::{self, Waiter};

/// A frame stuck in `BeingCreated` longer than this means its publisher
/// died (or worse) mid-write; the region is corrupt.
const BEING_CREATED_TIMEOUT_MS: i64 = 30_000;

/// Slice between re-polls of a blocking consume. Short enough to self-heal
/// from a missed release.
const WAIT_SLICE: Duration = Duration::from_millis(5);

/// Grace delay closing the residual race between the disposed check and the
/// in-flight increment during shutdown.
const DRAIN_GRACE: Duration = Duration::from_millis(10);

/// Dequeue side of the queue. Consumers across all processes serialize on a
/// single time-stamped read lock in the shared header, which a survivor may
/// reclaim once its holder has been silent past the staleness window.
pub struct Subscriber {
    // dropped by close() after in-flight calls drain
    shmem: Option<Shmem>,
    header: *const QueueHeader,
    buffer: CircularBuffer,
    waiter: Box<dyn Waiter>,
    stale_lock_ms: i64,
    disposed: AtomicBool,
    in_flight: AtomicUsize,
    internal_cancel: CancelToken,
}

// Same argument as Publisher: the mapping outlives the pointers into it
// (enforced by the disposed flag before any deref), and shared mutation is
// confined to atomics under the queue protocol.
unsafe impl Send for Subscriber {}
unsafe impl Sync for Subscriber {}

impl Subscriber {
    pub fn new(cfg: &QueueConfig) -> Result<Subscriber, QueueError> {
        let shmem = queue_context(cfg)?;
        let base = shmem.as_ptr();
        let header = base as *const QueueHeader;
        let buffer = CircularBuffer::new(unsafe { base.add(HEADER_SIZE) }, cfg.capacity)?;
        let waiter = signal::create_waiter(cfg)?;
        Ok(Subscriber {
            shmem: Some(shmem),
            header,
            buffer,
            waiter,
            stale_lock_ms: cfg.stale_lock_ms,
            disposed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            internal_cancel: CancelToken::new(),
        })
    }

    #[inline]
    fn header(&self) -> &QueueHeader {
        unsafe { &*self.header }
    }

    /// Dequeue the oldest message, or `None` when the queue is empty. Does
    /// not wait for messages, but does contend for the read lock, so the
    /// token is still consulted between attempts.
    pub fn try_consume(&self, cancel: &CancelToken) -> Result<Option<Vec<u8>>, QueueError> {
        let _call = self.begin_call()?;
        Ok(self.dequeue(None, cancel)?.and_then(|(_, owned)| owned))
    }

    /// Like [`try_consume`](Self::try_consume) but copies into `dest`,
    /// silently truncated to `dest.len()`. Returns the copied length.
    pub fn try_consume_into(
        &self,
        dest: &mut [u8],
        cancel: &CancelToken,
    ) -> Result<Option<usize>, QueueError> {
        let _call = self.begin_call()?;
        Ok(self.dequeue(Some(dest), cancel)?.map(|(len, _)| len))
    }

    /// Block until a message arrives or the token fires. Re-polls on a
    /// short timeout regardless of wake-ups, so a missed release only costs
    /// latency.
    pub fn consume(&self, cancel: &CancelToken) -> Result<Vec<u8>, QueueError> {
        let _call = self.begin_call()?;
        loop {
            if let Some((_, Some(message))) = self.dequeue(None, cancel)? {
                return Ok(message);
            }
            self.waiter.wait(WAIT_SLICE);
            if self.cancelled(cancel) {
                return Err(QueueError::Cancelled);
            }
        }
    }

    /// Blocking variant of [`try_consume_into`](Self::try_consume_into).
    pub fn consume_into(&self, dest: &mut [u8], cancel: &CancelToken) -> Result<usize, QueueError> {
        let _call = self.begin_call()?;
        loop {
            if let Some((len, _)) = self.dequeue(Some(&mut *dest), cancel)? {
                return Ok(len);
            }
            self.waiter.wait(WAIT_SLICE);
            if self.cancelled(cancel) {
                return Err(QueueError::Cancelled);
            }
        }
    }

    /// Begin shutdown: reject new calls, cancel waits, let in-flight calls
    /// drain, then release the mapping. Also runs on drop.
    pub fn close(&mut self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.internal_cancel.cancel();
        while self.in_flight.load(Ordering::SeqCst) != 0 {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(DRAIN_GRACE);
        debug!("subscriber drained, releasing mapping");
        self.shmem.take();
    }

    fn begin_call(&self) -> Result<InFlightGuard<'_>, QueueError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(QueueError::Disposed);
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        // close() may have flipped the flag between the check and the
        // increment; nothing has touched shared memory yet
        if self.disposed.load(Ordering::SeqCst) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::Disposed);
        }
        Ok(InFlightGuard {
            counter: &self.in_flight,
        })
    }

    #[inline]
    fn cancelled(&self, cancel: &CancelToken) -> bool {
        cancel.is_cancelled() || self.internal_cancel.is_cancelled()
    }

    /// One full dequeue attempt: acquire the read lock (reclaiming it if
    /// stale), pull the head frame, zero it, advance the head. Returns the
    /// copied length plus the owned payload when no `dest` was supplied.
    fn dequeue(
        &self,
        mut dest: Option<&mut [u8]>,
        cancel: &CancelToken,
    ) -> Result<Option<(usize, Option<Vec<u8>>)>, QueueError> {
        loop {
            if self.cancelled(cancel) {
                return Err(QueueError::Cancelled);
            }
            let head = self.header().head_offset.load(Ordering::Acquire);
            let tail = self.header().tail_offset.load(Ordering::Acquire);
            if head == tail {
                return Ok(None);
            }

            let observed = self.header().read_lock_timestamp.load(Ordering::Acquire);
            let now = monotonic_ms();
            if observed != 0 && now.saturating_sub(observed) < self.stale_lock_ms {
                // a presumably live consumer holds the lock
                thread::yield_now();
                continue;
            }
            if self
                .header()
                .read_lock_timestamp
                .compare_exchange(observed, now, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // a racing consumer took it first
                thread::yield_now();
                continue;
            }
            let _lock = ReadLockGuard {
                header: self.header(),
            };

            // the queue may have drained between the snapshot and the lock
            let head = self.header().head_offset.load(Ordering::Acquire);
            if head == self.header().tail_offset.load(Ordering::Acquire) {
                return Ok(None);
            }

            let state = self.buffer.atomic_i32(head);
            let spin_start = monotonic_ms();
            loop {
                match state.load(Ordering::Acquire) {
                    STATE_READY_TO_BE_CONSUMED => {
                        // under the queue-wide lock this CAS is a defensive
                        // double-check and should always succeed
                        let _ = state.compare_exchange(
                            STATE_READY_TO_BE_CONSUMED,
                            STATE_LOCKED_TO_BE_CONSUMED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                        break;
                    }
                    // left behind by a lock holder that died mid-dequeue;
                    // the staleness rule made the frame ours
                    STATE_LOCKED_TO_BE_CONSUMED => break,
                    STATE_BEING_CREATED => {
                        if monotonic_ms().saturating_sub(spin_start) > BEING_CREATED_TIMEOUT_MS {
                            fatal("head frame stuck in BeingCreated");
                        }
                        if self.cancelled(cancel) {
                            // the guard releases the read lock
                            return Err(QueueError::Cancelled);
                        }
                        thread::yield_now();
                    }
                    _ => fatal("head frame state is corrupt"),
                }
            }

            let body_length = self
                .buffer
                .atomic_i32(head.wrapping_add(4))
                .load(Ordering::Acquire);
            if body_length < 0 {
                fatal("head frame carries a negative body length");
            }
            let body_length = body_length as usize;
            let frame_length = round_up_8(FRAME_HEADER_SIZE + body_length);
            if frame_length > self.buffer.capacity() {
                fatal("head frame length exceeds the ring capacity");
            }

            let payload_offset = head.wrapping_add(FRAME_HEADER_SIZE as i64);
            let result = match dest.take() {
                Some(buf) => {
                    let len = body_length.min(buf.len());
                    self.buffer.read_into(payload_offset, &mut buf[..len]);
                    (len, None)
                }
                None => {
                    let payload = self.buffer.read(payload_offset, body_length);
                    (body_length, Some(payload))
                }
            };

            // scrubs the payload and resets the slot's state to
            // BeingCreated for its next reuse
            self.buffer.zero(head, frame_length);
            // only the lock holder mutates the head, so a plain store is
            // enough
            self.header()
                .head_offset
                .store(head.wrapping_add(frame_length as i64), Ordering::Release);

            trace!(
                head_offset = head,
                frame_length = frame_length,
                body_length = body_length,
                "consumed message"
            );
            return Ok(Some(result));
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.close();
    }
}

/// Releases the queue-wide read lock on every exit path, including unwinds.
struct ReadLockGuard<'a> {
    header: &'a QueueHeader,
}

impl Drop for ReadLockGuard<'_> {
    fn drop(&mut self) {
        self.header.read_lock_timestamp.store(0, Ordering::Release);
    }
}

struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

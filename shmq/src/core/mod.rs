pub mod buffer;

use std::mem;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use ::shared_memory::{Shmem, ShmemConf, ShmemError};
use once_cell::sync::Lazy;
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::errors::QueueError;

/// Size of the queue header at the start of the shared region.
pub const HEADER_SIZE: usize = mem::size_of::<QueueHeader>();

/// Size of the per-message frame header (`state: i32` + `body_length: i32`).
pub const FRAME_HEADER_SIZE: usize = 8;

// Message frame states. A zeroed (free) slot reads as `BeingCreated`, which
// is how a consumer detects a reserved-but-unwritten frame.
pub(crate) const STATE_BEING_CREATED: i32 = 0;
pub(crate) const STATE_READY_TO_BE_CONSUMED: i32 = 1;
pub(crate) const STATE_LOCKED_TO_BE_CONSUMED: i32 = 2;

static DEFAULT_DATA_DIR: Lazy<PathBuf> = Lazy::new(|| std::env::temp_dir().join("shmq"));

/// Which cross-process notification primitive backs the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    /// Native POSIX named semaphore. Only usable where `sem_timedwait` exists.
    Semaphore,
    /// Unix-domain-socket emulation with directory-based discovery.
    Socket,
}

impl Default for SignalKind {
    fn default() -> SignalKind {
        if cfg!(target_os = "linux") {
            SignalKind::Semaphore
        } else {
            SignalKind::Socket
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Name shared by every process attached to the same queue.
    pub queue_name: String,
    /// Directory holding the backing file and the signal socket directory.
    pub data_dir: String,
    /// Ring capacity in bytes. Positive multiple of 8, larger than the
    /// frame header.
    pub capacity: usize,
    /// Duration after which a held read lock is presumed abandoned.
    #[serde(default = "default_stale_lock_ms")]
    pub stale_lock_ms: i64,
    #[serde(default)]
    pub signal: SignalKind,
}

fn default_stale_lock_ms() -> i64 {
    10_000
}

impl Default for QueueConfig {
    fn default() -> QueueConfig {
        QueueConfig {
            queue_name: "shmq".to_string(),
            data_dir: DEFAULT_DATA_DIR.to_string_lossy().into_owned(),
            capacity: 1 << 20,
            stale_lock_ms: default_stale_lock_ms(),
            signal: SignalKind::default(),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.queue_name.is_empty() {
            return Err(QueueError::InvalidConfiguration(
                "queue_name must not be empty".to_string(),
            ));
        }
        if self.capacity == 0 || self.capacity % 8 != 0 || self.capacity <= FRAME_HEADER_SIZE {
            return Err(QueueError::InvalidConfiguration(format!(
                "capacity must be a positive multiple of 8 exceeding {} bytes, got {}",
                FRAME_HEADER_SIZE, self.capacity
            )));
        }
        if self.stale_lock_ms <= 0 {
            return Err(QueueError::InvalidConfiguration(
                "stale_lock_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn backing_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(format!("{}.shmq", self.queue_name))
    }

    pub(crate) fn signal_dir(&self) -> PathBuf {
        Path::new(&self.data_dir).join(format!("{}.signal", self.queue_name))
    }
}

/// Create or attach the shared region for a queue. The first participant
/// creates it zero-filled; later ones attach to the existing mapping.
pub(crate) fn queue_context(cfg: &QueueConfig) -> Result<Shmem, QueueError> {
    cfg.validate()?;
    std::fs::create_dir_all(&cfg.data_dir)?;
    let size = HEADER_SIZE + cfg.capacity;
    let path = cfg.backing_path();
    let shmem = match ShmemConf::new().size(size).flink(&path).create() {
        Ok(m) => m,
        Err(ShmemError::LinkExists) => ShmemConf::new().flink(&path).open()?,
        Err(e) => return Err(e.into()),
    };
    if shmem.len() < size {
        return Err(QueueError::InvalidConfiguration(format!(
            "existing mapping {} holds {} bytes but capacity {} requires {}; \
             all participants must agree on the capacity",
            path.display(),
            shmem.len(),
            cfg.capacity,
            size
        )));
    }
    debug!(
        queue_name = cfg.queue_name.as_str(),
        capacity = cfg.capacity,
        owner = shmem.is_owner(),
        "attached shared memory region"
    );
    Ok(shmem)
}

/// Queue header at offset 0 of the shared region. Shared by every attached
/// process; mutated only through the atomics.
#[repr(C)]
pub(crate) struct QueueHeader {
    /// Logical offset of the oldest unconsumed message.
    pub head_offset: AtomicI64,
    /// Logical offset just past the newest published message.
    pub tail_offset: AtomicI64,
    /// Monotonic ticks at which the current consumer took the read lock;
    /// 0 means unlocked.
    pub read_lock_timestamp: AtomicI64,
}

/// Fixed-layout frame header stored at the start of every message frame.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHeader {
    pub state: i32,
    pub body_length: i32,
}

#[inline]
pub(crate) const fn round_up_8(n: usize) -> usize {
    (n + 7) & !7
}

/// Monotonic milliseconds. Comparable across processes on the same machine,
/// which is what the read-lock staleness rule relies on.
pub(crate) fn monotonic_ms() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC with a valid timespec cannot fail.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as i64 * 1_000 + ts.tv_nsec as i64 / 1_000_000
}

/// Cooperative cancellation token checked at every retry boundary of a
/// blocking wait.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Terminate the process. Called when the shared region is no longer
/// self-consistent; other attached processes cannot be warned, so continuing
/// would corrupt them too.
pub(crate) fn fatal(context: &str) -> ! {
    error!(context = context, "unrecoverable shared memory state, aborting");
    process::abort();
}

/// Aborts the process when dropped while still armed. Guards the
/// post-reservation write section of a publish, where a partially written
/// frame cannot be recovered by any other process.
pub(crate) struct FailFast {
    armed: bool,
    context: &'static str,
}

impl FailFast {
    pub fn arm(context: &'static str) -> FailFast {
        FailFast {
            armed: true,
            context,
        }
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for FailFast {
    fn drop(&mut self) {
        if self.armed {
            fatal(self.context);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity: usize) -> QueueConfig {
        QueueConfig {
            queue_name: "validation".to_string(),
            data_dir: "/tmp".to_string(),
            capacity,
            ..QueueConfig::default()
        }
    }

    #[test]
    fn capacity_must_be_multiple_of_8() {
        assert!(config(1024).validate().is_ok());
        assert!(config(1021).validate().is_err());
        assert!(config(0).validate().is_err());
        // equal to the frame header is not enough for any payload
        assert!(config(FRAME_HEADER_SIZE).validate().is_err());
    }

    #[test]
    fn queue_name_must_not_be_empty() {
        let mut cfg = config(1024);
        cfg.queue_name.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn round_up_8_pads_to_frame_alignment() {
        assert_eq!(round_up_8(0), 0);
        assert_eq!(round_up_8(1), 8);
        assert_eq!(round_up_8(8), 8);
        assert_eq!(round_up_8(9), 16);
        assert_eq!(round_up_8(FRAME_HEADER_SIZE + 3), 16);
    }

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn header_layout_is_24_bytes() {
        assert_eq!(HEADER_SIZE, 24);
    }
}

//! Cross-process notification primitive.
//!
//! A `Releaser` broadcasts a coalescing "something changed" wake-up; a
//! `Waiter` blocks until released or a timeout elapses. On Linux this wraps
//! a native POSIX named semaphore; elsewhere (and wherever configured) it is
//! emulated over a discoverable set of unix-domain sockets.

#[cfg(target_os = "linux")]
pub mod semaphore;
pub mod socket;

use std::time::Duration;

use crate::core::{QueueConfig, SignalKind};
use crate::errors::QueueError;

#[cfg(target_os = "linux")]
pub use semaphore::{SemaphoreReleaser, SemaphoreWaiter};
pub use socket::{SocketReleaser, SocketWaiter};

/// Wakes blocked waiters. Fire-and-forget: a release is a coalescing signal,
/// not a counted semaphore post, so exact wake counts are not guaranteed.
pub trait Releaser: Send + Sync {
    fn release(&self);
}

/// Blocks until a release arrives. Returns `true` when signaled, `false` on
/// timeout.
pub trait Waiter: Send + Sync {
    fn wait(&self, timeout: Duration) -> bool;
}

pub(crate) fn create_releaser(cfg: &QueueConfig) -> Result<Box<dyn Releaser>, QueueError> {
    match effective(cfg.signal) {
        #[cfg(target_os = "linux")]
        SignalKind::Semaphore => Ok(Box::new(SemaphoreReleaser::open(&cfg.queue_name)?)),
        _ => Ok(Box::new(SocketReleaser::bind(cfg.signal_dir())?)),
    }
}

pub(crate) fn create_waiter(cfg: &QueueConfig) -> Result<Box<dyn Waiter>, QueueError> {
    match effective(cfg.signal) {
        #[cfg(target_os = "linux")]
        SignalKind::Semaphore => Ok(Box::new(SemaphoreWaiter::open(&cfg.queue_name)?)),
        _ => Ok(Box::new(SocketWaiter::watch(cfg.signal_dir())?)),
    }
}

/// Platforms without a usable named-semaphore timed wait always get the
/// socket emulation, whatever the configuration asks for.
fn effective(kind: SignalKind) -> SignalKind {
    if cfg!(target_os = "linux") {
        kind
    } else {
        SignalKind::Socket
    }
}

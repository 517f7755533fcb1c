//! Trivial wrap of a POSIX named counting semaphore. Every process attached
//! to a queue opens the same name; `release` posts, `wait` does a timed
//! decrement. The name is never unlinked so that late attachers always find
//! the same semaphore.

use std::ffi::CString;
use std::io;
use std::time::Duration;

use tracing::warn;

use super::{Releaser, Waiter};
use crate::errors::QueueError;

struct NamedSemaphore {
    sem: *mut libc::sem_t,
}

// sem_post and sem_timedwait are async-signal-safe and thread-safe on the
// same handle.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    fn open(queue_name: &str) -> Result<NamedSemaphore, QueueError> {
        let name = CString::new(format!("/shmq.{}", queue_name)).map_err(|_| {
            QueueError::InvalidConfiguration("queue name contains a NUL byte".to_string())
        })?;
        let sem = unsafe {
            libc::sem_open(
                name.as_ptr(),
                libc::O_CREAT,
                0o644 as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(QueueError::Io(io::Error::last_os_error()));
        }
        Ok(NamedSemaphore { sem })
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

pub struct SemaphoreReleaser {
    sem: NamedSemaphore,
}

impl SemaphoreReleaser {
    pub fn open(queue_name: &str) -> Result<SemaphoreReleaser, QueueError> {
        Ok(SemaphoreReleaser {
            sem: NamedSemaphore::open(queue_name)?,
        })
    }
}

impl Releaser for SemaphoreReleaser {
    fn release(&self) {
        let rc = unsafe { libc::sem_post(self.sem.sem) };
        if rc != 0 {
            // EOVERFLOW when the count is saturated, which still leaves
            // every waiter wakeable
            warn!(error = %io::Error::last_os_error(), "sem_post failed");
        }
    }
}

pub struct SemaphoreWaiter {
    sem: NamedSemaphore,
}

impl SemaphoreWaiter {
    pub fn open(queue_name: &str) -> Result<SemaphoreWaiter, QueueError> {
        Ok(SemaphoreWaiter {
            sem: NamedSemaphore::open(queue_name)?,
        })
    }
}

impl Waiter for SemaphoreWaiter {
    fn wait(&self, timeout: Duration) -> bool {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // sem_timedwait takes an absolute CLOCK_REALTIME deadline
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
        }
        ts.tv_sec += timeout.as_secs() as libc::time_t;
        ts.tv_nsec += timeout.subsec_nanos() as libc::c_long;
        if ts.tv_nsec >= 1_000_000_000 {
            ts.tv_sec += 1;
            ts.tv_nsec -= 1_000_000_000;
        }
        loop {
            let rc = unsafe { libc::sem_timedwait(self.sem.sem, &ts) };
            if rc == 0 {
                return true;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return false,
                _ => {
                    warn!(error = %err, "sem_timedwait failed");
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn unique_name(tag: &str) -> String {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        format!(
            "sem-test-{}-{}-{}",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        )
    }

    #[test]
    fn release_wakes_a_waiter() {
        let name = unique_name("wake");
        let releaser = SemaphoreReleaser::open(&name).unwrap();
        let waiter = SemaphoreWaiter::open(&name).unwrap();
        releaser.release();
        assert!(waiter.wait(Duration::from_secs(2)));
    }

    #[test]
    fn wait_times_out_when_drained() {
        let name = unique_name("timeout");
        let waiter = SemaphoreWaiter::open(&name).unwrap();
        let start = Instant::now();
        assert!(!waiter.wait(Duration::from_millis(100)));
        assert!(start.elapsed() >= Duration::from_millis(90));
    }
}

//! Socket-based emulation of the cross-process signal, for systems without
//! a usable native named semaphore.
//!
//! Every releaser listens on a uniquely named unix socket inside a
//! per-queue directory. Waiters rescan that directory, connect to every
//! endpoint they find, and turn each inbound byte into a post on a local
//! counting semaphore. Any number of releasers and waiters can share one
//! queue name; a waiter notices a new releaser within the discovery window.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, trace, warn};

use super::{Releaser, Waiter};
use crate::core::fatal;
use crate::errors::QueueError;

const ACCEPT_POLL: Duration = Duration::from_millis(10);
const RESCAN_INTERVAL: Duration = Duration::from_millis(25);
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);
const SOCKET_EXTENSION: &str = "sock";
const BIND_ATTEMPTS: usize = 16;

type PeerSnapshot = Arc<Vec<Arc<UnixStream>>>;

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Listens for waiters and fans a 1-byte wake-up out to every connected one.
pub struct SocketReleaser {
    path: PathBuf,
    peers: Arc<Mutex<PeerSnapshot>>,
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl SocketReleaser {
    pub fn bind(dir: PathBuf) -> Result<SocketReleaser, QueueError> {
        fs::create_dir_all(&dir)?;
        let (listener, path) = bind_unique(&dir)?;
        listener.set_nonblocking(true)?;
        let peers: Arc<Mutex<PeerSnapshot>> = Arc::new(Mutex::new(Arc::new(Vec::new())));
        let stop = Arc::new(AtomicBool::new(false));
        let accept_thread = {
            let peers = peers.clone();
            let stop = stop.clone();
            thread::spawn(move || accept_loop(&listener, &peers, &stop))
        };
        debug!(endpoint = %path.display(), "signal releaser listening");
        Ok(SocketReleaser {
            path,
            peers,
            stop,
            accept_thread: Some(accept_thread),
        })
    }

    fn prune(&self, dead: &[Arc<UnixStream>]) {
        let mut guard = lock_unpoisoned(&self.peers);
        let next: Vec<Arc<UnixStream>> = guard
            .iter()
            .filter(|peer| !dead.iter().any(|d| Arc::ptr_eq(peer, d)))
            .cloned()
            .collect();
        debug!(
            removed = dead.len(),
            remaining = next.len(),
            "pruned disconnected signal peers"
        );
        *guard = Arc::new(next);
    }
}

impl Releaser for SocketReleaser {
    fn release(&self) {
        // Only the Arc clone happens under the lock; the accept loop swaps
        // in new snapshots, never mutates one in place.
        let snapshot = lock_unpoisoned(&self.peers).clone();
        if snapshot.is_empty() {
            return;
        }
        let mut dead: Vec<Arc<UnixStream>> = Vec::new();
        for peer in snapshot.iter() {
            let mut stream: &UnixStream = peer.as_ref();
            match stream.write(&[1u8]) {
                Ok(_) => {}
                // the peer's buffer is full of unread wake-ups, which is
                // signal enough
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => dead.push(peer.clone()),
            }
        }
        if !dead.is_empty() {
            self.prune(&dead);
        }
    }
}

impl Drop for SocketReleaser {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        let _ = fs::remove_file(&self.path);
    }
}

/// Bind a listener under a fresh random name, retrying with a new suffix on
/// a collision.
fn bind_unique(dir: &Path) -> Result<(UnixListener, PathBuf), QueueError> {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    for _ in 0..BIND_ATTEMPTS {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let path = dir.join(format!(
            "releaser.{}.{}.{:08x}.{}",
            process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed),
            nanos,
            SOCKET_EXTENSION
        ));
        match UnixListener::bind(&path) {
            Ok(listener) => return Ok((listener, path)),
            Err(e) if e.kind() == ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(QueueError::Io(std::io::Error::new(
        ErrorKind::AddrInUse,
        "could not bind a unique signal endpoint",
    )))
}

fn accept_loop(listener: &UnixListener, peers: &Mutex<PeerSnapshot>, stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(true).is_err() {
                    continue;
                }
                let mut guard = lock_unpoisoned(peers);
                let mut next = Vec::with_capacity(guard.len() + 1);
                next.extend(guard.iter().cloned());
                next.push(Arc::new(stream));
                trace!(peers = next.len(), "signal peer connected");
                *guard = Arc::new(next);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            // the releaser's invariants can no longer be trusted
            Err(_) => fatal("signal accept loop failed"),
        }
    }
}

/// Counting semaphore local to one process; receive loops post it, `wait`
/// decrements it.
#[derive(Default)]
struct LocalSemaphore {
    count: Mutex<u64>,
    cond: Condvar,
}

impl LocalSemaphore {
    fn post(&self) {
        let mut count = lock_unpoisoned(&self.count);
        *count += 1;
        self.cond.notify_one();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = lock_unpoisoned(&self.count);
        while *count == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(count, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            count = guard;
        }
        *count -= 1;
        true
    }
}

/// Discovers releaser endpoints in the queue's signal directory and blocks
/// callers until any of them sends a wake-up.
pub struct SocketWaiter {
    sem: Arc<LocalSemaphore>,
    stop: Arc<AtomicBool>,
    discovery_thread: Option<JoinHandle<()>>,
}

impl SocketWaiter {
    pub fn watch(dir: PathBuf) -> Result<SocketWaiter, QueueError> {
        fs::create_dir_all(&dir)?;
        let sem = Arc::new(LocalSemaphore::default());
        let stop = Arc::new(AtomicBool::new(false));
        let discovery_thread = {
            let sem = sem.clone();
            let stop = stop.clone();
            thread::spawn(move || discovery_loop(&dir, &sem, &stop))
        };
        Ok(SocketWaiter {
            sem,
            stop,
            discovery_thread: Some(discovery_thread),
        })
    }
}

impl Waiter for SocketWaiter {
    fn wait(&self, timeout: Duration) -> bool {
        self.sem.wait(timeout)
    }
}

impl Drop for SocketWaiter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.discovery_thread.take() {
            let _ = handle.join();
        }
        // receive loops notice the stop flag within their read timeout
    }
}

/// Periodic reconciliation of the endpoint directory. A plain rescan both
/// discovers new releasers and re-checks old ones, so no OS file-watching
/// facility needs to be trusted.
fn discovery_loop(dir: &Path, sem: &Arc<LocalSemaphore>, stop: &Arc<AtomicBool>) {
    let mut active: HashMap<PathBuf, Arc<AtomicBool>> = HashMap::new();
    while !stop.load(Ordering::Relaxed) {
        active.retain(|path, alive| {
            let keep = alive.load(Ordering::Relaxed);
            if !keep {
                debug!(endpoint = %path.display(), "signal endpoint dropped");
            }
            keep
        });
        match fs::read_dir(dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().and_then(OsStr::to_str) != Some(SOCKET_EXTENSION) {
                        continue;
                    }
                    if active.contains_key(&path) {
                        continue;
                    }
                    match UnixStream::connect(&path) {
                        Ok(stream) => {
                            let alive = Arc::new(AtomicBool::new(true));
                            active.insert(path.clone(), alive.clone());
                            let sem = sem.clone();
                            let stop = stop.clone();
                            debug!(endpoint = %path.display(), "connected to signal endpoint");
                            thread::spawn(move || receive_loop(&stream, &sem, &stop, &alive));
                        }
                        Err(e) => {
                            // endpoint mid-teardown or not yet accepting;
                            // the next rescan retries
                            trace!(endpoint = %path.display(), error = %e, "signal endpoint not connectable");
                        }
                    }
                }
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "signal directory scan failed");
            }
        }
        thread::sleep(RESCAN_INTERVAL);
    }
}

fn receive_loop(stream: &UnixStream, sem: &LocalSemaphore, stop: &AtomicBool, alive: &AtomicBool) {
    if stream.set_read_timeout(Some(RECEIVE_TIMEOUT)).is_err() {
        alive.store(false, Ordering::Relaxed);
        return;
    }
    let mut buf = [0u8; 32];
    let mut stream = stream;
    while !stop.load(Ordering::Relaxed) {
        match stream.read(&mut buf) {
            // peer closed
            Ok(0) => break,
            Ok(n) => {
                for _ in 0..n {
                    sem.post();
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }
    alive.store(false, Ordering::Relaxed);
}

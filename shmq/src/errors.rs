use std::{fmt, io};

/// Errors surfaced by queue construction and operation.
///
/// Rejected operations (ring full, queue empty) are ordinary return values,
/// not errors. Shared-memory corruption is not represented here at all: it
/// aborts the process, because other attached processes cannot be warned.
#[derive(Debug)]
pub enum QueueError {
    InvalidConfiguration(String),
    SharedMemory(shared_memory::ShmemError),
    Io(io::Error),
    /// A cooperative cancellation token fired mid-wait.
    Cancelled,
    /// The subscriber has begun shutting down; new calls are rejected.
    Disposed,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::InvalidConfiguration(s) => write!(f, "invalid configuration: {}", s),
            QueueError::SharedMemory(e) => write!(f, "shared memory error: {}", e),
            QueueError::Io(e) => write!(f, "I/O error: {}", e),
            QueueError::Cancelled => write!(f, "operation cancelled"),
            QueueError::Disposed => write!(f, "queue is disposed"),
        }
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueueError::SharedMemory(e) => Some(e),
            QueueError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<shared_memory::ShmemError> for QueueError {
    fn from(err: shared_memory::ShmemError) -> Self {
        QueueError::SharedMemory(err)
    }
}

impl From<io::Error> for QueueError {
    fn from(err: io::Error) -> Self {
        QueueError::Io(err)
    }
}

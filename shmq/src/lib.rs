mod core;
mod errors;
pub mod reader;
pub mod signal;
pub mod writer;

pub use crate::core::{CancelToken, QueueConfig, SignalKind, FRAME_HEADER_SIZE, HEADER_SIZE};
pub use crate::errors::QueueError;
pub use crate::reader::Subscriber;
pub use crate::writer::Publisher;

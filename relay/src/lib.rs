//! Background consumer machinery around the transport core.
//!
//! The restricted-context producers live in `commitq`; everything here
//! runs on ordinary threads and is allowed to block: the [`Processor`]
//! drain loop, the [`StreamPump`] that feeds reassembly, and the
//! per-client [`Outboxes`] fan-out.

use thiserror::Error;

pub mod events;
pub mod outbox;
pub mod processor;
pub mod stream;

pub use events::{BlockingActivity, BlockingEvent};
pub use outbox::Outboxes;
pub use processor::{Process, Processor, ProcessorHandle, QueueDrain};
pub use stream::StreamPump;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// Monotonic clock reading, for event timestamps.
pub fn get_timestamp_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

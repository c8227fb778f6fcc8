//! # bytering - Blocking Byte Ring Buffer
//!
//! Fixed-capacity circular byte buffer coordinating one writer thread and
//! one reader thread across backpressure and shutdown. Calls may block and
//! must therefore never be made from a restricted (signal-handler)
//! context; the lock-free end of the pipeline lives in `commitq`.
//!
//! ```rust
//! use bytering::ByteRing;
//!
//! let ring = ByteRing::new(8);
//! assert_eq!(ring.write(b"ABCDE", false), 5);
//!
//! let mut out = [0u8; 3];
//! assert_eq!(ring.read(&mut out, false), 3);
//! assert_eq!(&out, b"ABC");
//! assert_eq!(ring.available(), 2);
//! ```
//!
//! [`ByteRing::readonly`] is the only shutdown primitive: a one-way
//! transition that wakes every blocked reader and writer so they observe
//! end-of-stream instead of hanging. Blocked reads drain whatever is
//! buffered and then return 0.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::trace;

struct RingState {
    buf: Box<[u8]>,
    read_idx: usize,
    write_idx: usize,
    available: usize,
    allow_writes: bool,
}

impl RingState {
    /// Copy in as much of `data` as currently fits, as at most two
    /// contiguous segments around the wrap point.
    fn copy_in(&mut self, data: &[u8]) -> usize {
        let capacity = self.buf.len();
        let count = data.len().min(capacity - self.available);
        if count == 0 {
            return 0;
        }

        let first = count.min(capacity - self.write_idx);
        self.buf[self.write_idx..self.write_idx + first].copy_from_slice(&data[..first]);
        let second = count - first;
        if second > 0 {
            self.buf[..second].copy_from_slice(&data[first..count]);
        }

        self.write_idx = (self.write_idx + count) % capacity;
        self.available += count;
        count
    }

    /// Copy out as much buffered data as fits in `out`, wrap-aware.
    fn copy_out(&mut self, out: &mut [u8]) -> usize {
        let capacity = self.buf.len();
        let count = out.len().min(self.available);
        if count == 0 {
            return 0;
        }

        let first = count.min(capacity - self.read_idx);
        out[..first].copy_from_slice(&self.buf[self.read_idx..self.read_idx + first]);
        let second = count - first;
        if second > 0 {
            out[first..count].copy_from_slice(&self.buf[..second]);
        }

        self.read_idx = (self.read_idx + count) % capacity;
        self.available -= count;
        count
    }
}

/// Blocking byte ring buffer.
///
/// `read_idx == write_idx` is ambiguous between empty and full and is
/// disambiguated solely by `available` being 0 or `capacity`.
pub struct ByteRing {
    state: Mutex<RingState>,
    readable: Condvar,
    writable: Condvar,
    capacity: usize,
}

impl ByteRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        trace!(capacity, "created byte ring");
        ByteRing {
            state: Mutex::new(RingState {
                buf: vec![0u8; capacity].into_boxed_slice(),
                read_idx: 0,
                write_idx: 0,
                available: 0,
                allow_writes: true,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write `data` into the ring, returning how many bytes were accepted.
    ///
    /// With `block` set, waits for space until all of `data` is written or
    /// the ring becomes read-only; otherwise returns immediately with a
    /// possibly short (or zero) count.
    pub fn write(&self, data: &[u8], block: bool) -> usize {
        let mut state = self.lock();
        let mut total = 0;

        while state.allow_writes {
            let written = state.copy_in(&data[total..]);
            total += written;
            trace!(written, total, "ring write");
            if written > 0 {
                self.readable.notify_all();
            }
            if total == data.len() || !block {
                break;
            }
            trace!(
                available = state.available,
                capacity = self.capacity,
                "waiting for ring to become writable"
            );
            state = self
                .writable
                .wait_while(state, |s| s.available == s.buf.len() && s.allow_writes)
                .unwrap_or_else(PoisonError::into_inner);
        }
        total
    }

    /// Read into `out`, returning how many bytes were copied.
    ///
    /// With `block` set, accumulates across wake-ups until `out` is full
    /// or the ring is read-only and drained; end-of-stream reads return 0.
    pub fn read(&self, out: &mut [u8], block: bool) -> usize {
        let mut state = self.lock();
        let mut total = 0;

        loop {
            let read = state.copy_out(&mut out[total..]);
            total += read;
            trace!(read, total, "ring read");
            if read > 0 {
                self.writable.notify_all();
            }
            if total == out.len() || !block {
                break;
            }
            if !state.allow_writes {
                // Read-only and drained: nothing more will ever arrive.
                break;
            }
            trace!(
                available = state.available,
                capacity = self.capacity,
                "waiting for ring to become readable"
            );
            state = self
                .readable
                .wait_while(state, |s| s.available == 0 && s.allow_writes)
                .unwrap_or_else(PoisonError::into_inner);
        }
        total
    }

    /// Block until at least one byte is buffered, then copy out whatever
    /// is available. Returns 0 only at end of stream (read-only and
    /// drained). This is the streaming flavor of [`ByteRing::read`]: it
    /// does not wait for `out` to fill.
    pub fn read_some(&self, out: &mut [u8]) -> usize {
        let mut state = self.lock();
        state = self
            .readable
            .wait_while(state, |s| s.available == 0 && s.allow_writes)
            .unwrap_or_else(PoisonError::into_inner);
        let read = state.copy_out(out);
        if read > 0 {
            self.writable.notify_all();
        }
        trace!(read, "ring read_some");
        read
    }

    /// Discard all buffered data and re-enable writes, returning the
    /// number of bytes thrown away. Intended for use while both sides are
    /// quiescent.
    pub fn reset(&self) -> usize {
        let mut state = self.lock();
        let discarded = state.available;
        state.read_idx = 0;
        state.write_idx = 0;
        state.available = 0;
        state.allow_writes = true;
        self.writable.notify_all();
        trace!(discarded, "ring reset");
        discarded
    }

    /// Disallow further writes. One-way; wakes every blocked reader and
    /// writer so they observe the new state.
    pub fn readonly(&self) {
        let mut state = self.lock();
        state.allow_writes = false;
        self.readable.notify_all();
        self.writable.notify_all();
        trace!("ring switched to read-only");
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Unread bytes currently buffered.
    pub fn available(&self) -> usize {
        self.lock().available
    }

    /// Free space currently in the ring. Only a reliable lower bound for
    /// the single writer thread.
    pub fn free(&self) -> usize {
        let state = self.lock();
        state.buf.len() - state.available
    }

    pub fn writes_allowed(&self) -> bool {
        self.lock().allow_writes
    }
}

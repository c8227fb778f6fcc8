//! # commitq - Lock-Free Handoff Primitives for Restricted Contexts
//!
//! Bounded multi-producer single-consumer commit queue and a lock-free
//! free-list, built for producers that run under severe execution
//! constraints (signal handlers, sampling interrupts). The producer paths
//! never block, never allocate, and never take a lock: atomics only, with
//! bounded execution time.
//!
//! ## Commit Queue
//!
//! Create a queue with [`commit_queue`], which splits it into a cloneable
//! producer handle and a unique consumer handle:
//!
//! ```rust
//! use commitq::commit_queue;
//!
//! let (producer, mut consumer) = commit_queue::<u64>(1024);
//!
//! assert!(producer.push(7));
//! assert_eq!(consumer.pop(), Some(7));
//! assert_eq!(consumer.pop(), None);
//! ```
//!
//! A full queue drops the record and returns `false`; the loss is counted,
//! never blocked on:
//!
//! ```rust
//! use commitq::commit_queue;
//!
//! let (producer, consumer) = commit_queue::<u8>(1);
//! assert!(producer.push(1));
//! assert!(!producer.push(2));
//! assert_eq!(consumer.dropped(), 1);
//! ```
//!
//! ## Free List
//!
//! [`FreeList`] recycles fixed-size entries without allocation. Entries are
//! checked out as [`Lease`]s which return themselves to the list on drop;
//! [`Lease::into_index`] lets the bare index travel through a commit queue
//! instead of the whole payload:
//!
//! ```rust
//! use commitq::FreeList;
//!
//! let pool: FreeList<[u8; 64]> = FreeList::new(16, || [0u8; 64]);
//!
//! let mut lease = pool.acquire().unwrap();
//! lease[0] = 42;
//! drop(lease); // back on the free list
//! ```

pub use freelist::{FreeList, Lease, NIL_INDEX};
pub use queue::{commit_queue, CommitQueue, QueueConsumer, QueueProducer, RecordSink};

pub(crate) mod freelist;
#[cfg(all(test, feature = "loom"))]
pub(crate) mod loom;
pub(crate) mod queue;
pub(crate) mod sync;

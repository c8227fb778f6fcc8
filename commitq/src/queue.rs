use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

use crossbeam::utils::CachePadded;

use crate::sync::{Arc, AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Destination for drained records.
///
/// `record` runs synchronously on the sole consumer thread; while it
/// executes no further records are drained. It must not panic across the
/// call and must not block indefinitely.
pub trait RecordSink<T> {
    fn record(&mut self, record: T);
}

impl<T, F: FnMut(T)> RecordSink<T> for F {
    fn record(&mut self, record: T) {
        self(record)
    }
}

struct Slot<T> {
    committed: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Slot {
            committed: AtomicBool::new(false),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Shared state behind the producer and consumer handles.
///
/// `input` is the next slot to reserve, `output` the next slot to drain,
/// both modulo `slots.len()`. One slot is kept unusable so that
/// `input == output` unambiguously means empty.
pub struct CommitQueue<T> {
    slots: Box<[Slot<T>]>,
    input: CachePadded<AtomicUsize>,
    output: CachePadded<AtomicUsize>,
    dropped: AtomicU64,
}

unsafe impl<T: Send> Send for CommitQueue<T> {}
unsafe impl<T: Send> Sync for CommitQueue<T> {}

impl<T> CommitQueue<T> {
    fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "commit queue capacity must be non-zero");
        let slots = (0..capacity + 1).map(|_| Slot::new()).collect();
        CommitQueue {
            slots,
            input: CachePadded::new(AtomicUsize::new(0)),
            output: CachePadded::new(AtomicUsize::new(0)),
            dropped: AtomicU64::new(0),
        }
    }

    #[inline]
    fn advance(&self, index: usize) -> usize {
        (index + 1) % self.slots.len()
    }

    fn len(&self) -> usize {
        let input = self.input.load(Ordering::Relaxed);
        let output = self.output.load(Ordering::Relaxed);
        if input < output {
            input + self.slots.len() - output
        } else {
            input - output
        }
    }
}

impl<T> Drop for CommitQueue<T> {
    fn drop(&mut self) {
        // Committed but undrained records still own their payloads. An
        // uncommitted reservation is in an unknown state and is leaked.
        let input = self.input.load(Ordering::Relaxed);
        let mut current = self.output.load(Ordering::Relaxed);
        while current != input {
            let slot = &self.slots[current];
            if slot.committed.load(Ordering::Relaxed) {
                unsafe { (*slot.value.get()).assume_init_drop() };
            }
            current = self.advance(current);
        }
    }
}

/// Create a bounded commit queue holding up to `capacity` records.
///
/// The producer handle is cheap to clone and may be used from any number
/// of threads, including signal-handler context. The consumer handle is
/// unique; draining from more than one thread is ruled out by the type.
pub fn commit_queue<T>(capacity: usize) -> (QueueProducer<T>, QueueConsumer<T>) {
    let shared = Arc::new(CommitQueue::with_capacity(capacity));
    (
        QueueProducer {
            shared: shared.clone(),
        },
        QueueConsumer { shared },
    )
}

/// Multi-producer handle. `push` is signal-safe: no locks, no heap
/// operations, no syscalls, bounded execution time.
pub struct QueueProducer<T> {
    shared: Arc<CommitQueue<T>>,
}

impl<T> Clone for QueueProducer<T> {
    fn clone(&self) -> Self {
        QueueProducer {
            shared: self.shared.clone(),
        }
    }
}

impl<T> QueueProducer<T> {
    /// Publish one record. Returns `false` if the queue is full; the
    /// record is dropped and counted, never waited on.
    pub fn push(&self, value: T) -> bool {
        let shared = &*self.shared;
        let mut current = shared.input.load(Ordering::Relaxed);
        let slot_index = loop {
            let next = shared.advance(current);
            // The Acquire load of `output` also synchronizes with the
            // consumer's release of the slot we are about to write.
            if next == shared.output.load(Ordering::Acquire) {
                shared.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            match shared.input.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break current,
                Err(observed) => current = observed,
            }
        };

        // Winning the exchange grants exclusive ownership of the slot
        // until the consumer observes the commit flag.
        let slot = &shared.slots[slot_index];
        unsafe { (*slot.value.get()).write(value) };
        slot.committed.store(true, Ordering::Release);
        true
    }

    /// Records currently buffered. Racy by nature; a hint only.
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len() - 1
    }

    /// Records dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

/// Single-consumer handle. Not cloneable; `pop` never blocks.
pub struct QueueConsumer<T> {
    shared: Arc<CommitQueue<T>>,
}

impl<T> QueueConsumer<T> {
    /// Take the oldest committed record, or `None` if the queue is empty
    /// or the head reservation is still being written. The caller retries
    /// later rather than waiting; a partially written record is never
    /// exposed.
    pub fn pop(&mut self) -> Option<T> {
        let shared = &*self.shared;
        let current = shared.output.load(Ordering::Relaxed);
        if current == shared.input.load(Ordering::Acquire) {
            return None;
        }

        let slot = &shared.slots[current];
        if !slot.committed.load(Ordering::Acquire) {
            return None;
        }

        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.committed.store(false, Ordering::Release);
        shared.output.store(shared.advance(current), Ordering::Release);
        Some(value)
    }

    /// Drain every committed record into `sink`, returning how many were
    /// delivered.
    pub fn drain(&mut self, sink: &mut impl RecordSink<T>) -> usize {
        let mut delivered = 0;
        while let Some(value) = self.pop() {
            sink.record(value);
            delivered += 1;
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len() - 1
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use rstest::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc as StdArc;
    use std::thread;

    #[rstest]
    #[case(1)]
    #[case(4)]
    #[case(128)]
    fn test_fifo_order_single_thread(#[case] capacity: usize) {
        let (producer, mut consumer) = commit_queue::<usize>(capacity);

        let mut next_expected = 0;
        let mut pushed = 0;
        for round in 0..50 {
            for i in 0..capacity {
                assert!(producer.push(pushed + i), "round {} push {}", round, i);
            }
            pushed += capacity;
            while let Some(value) = consumer.pop() {
                assert_eq!(value, next_expected);
                next_expected += 1;
            }
        }

        assert_eq!(next_expected, pushed);
        assert_eq!(consumer.dropped(), 0);
    }

    #[test]
    fn test_full_queue_drops() {
        let (producer, mut consumer) = commit_queue::<u32>(4);

        for i in 0..4 {
            assert!(producer.push(i));
        }
        assert!(!producer.push(99));
        assert_eq!(producer.dropped(), 1);
        assert_eq!(producer.len(), 4);

        assert_eq!(consumer.pop(), Some(0));
        assert!(producer.push(4));
        assert!(!producer.push(100));
        assert_eq!(producer.dropped(), 2);
    }

    #[test]
    fn test_pop_empty() {
        let (_producer, mut consumer) = commit_queue::<u8>(2);
        assert_eq!(consumer.pop(), None);
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_drain_into_sink() {
        let (producer, mut consumer) = commit_queue::<u64>(8);
        for i in 0..5u64 {
            assert!(producer.push(i * 10));
        }

        let mut seen = Vec::new();
        let delivered = consumer.drain(&mut |value: u64| seen.push(value));
        assert_eq!(delivered, 5);
        assert_eq!(seen, vec![0, 10, 20, 30, 40]);
        assert_eq!(consumer.drain(&mut |_: u64| panic!("queue was drained")), 0);
    }

    struct Token {
        live: StdArc<StdAtomicUsize>,
    }

    impl Token {
        fn new(live: &StdArc<StdAtomicUsize>) -> Self {
            live.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Token { live: live.clone() }
        }
    }

    impl Drop for Token {
        fn drop(&mut self) {
            self.live.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn test_undrained_records_dropped_with_queue() {
        let live = StdArc::new(StdAtomicUsize::new(0));
        let (producer, mut consumer) = commit_queue::<Token>(8);

        for _ in 0..6 {
            assert!(producer.push(Token::new(&live)));
        }
        drop(consumer.pop());
        assert_eq!(live.load(std::sync::atomic::Ordering::SeqCst), 5);

        drop(producer);
        drop(consumer);
        assert_eq!(live.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[rstest]
    #[case(2, 2000, 16)]
    #[case(4, 1000, 64)]
    #[case(8, 500, 7)]
    fn test_concurrent_producers_account_for_every_record(
        #[case] producers: usize,
        #[case] per_producer: usize,
        #[case] capacity: usize,
    ) {
        let (producer, mut consumer) = commit_queue::<(usize, usize)>(capacity);

        let handles: Vec<_> = (0..producers)
            .map(|id| {
                let producer = producer.clone();
                thread::spawn(move || {
                    let mut accepted = 0usize;
                    for seq in 0..per_producer {
                        if producer.push((id, seq)) {
                            accepted += 1;
                        }
                    }
                    accepted
                })
            })
            .collect();

        let consumer_handle = thread::spawn(move || {
            let mut seen: HashSet<(usize, usize)> = HashSet::new();
            let mut last_seq = vec![None::<usize>; producers];
            let total = producers * per_producer;
            loop {
                while let Some(record) = consumer.pop() {
                    assert!(seen.insert(record), "record {:?} delivered twice", record);
                    // Slot indices are assigned in reservation order, so a
                    // producer's own records arrive in its program order.
                    let (id, seq) = record;
                    if let Some(last) = last_seq[id] {
                        assert!(seq > last, "producer {} reordered: {} after {}", id, seq, last);
                    }
                    last_seq[id] = Some(seq);
                }
                if seen.len() as u64 + consumer.dropped() >= total as u64 && consumer.is_empty() {
                    break;
                }
                thread::yield_now();
            }
            (seen.len(), consumer.dropped())
        });

        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        let (delivered, dropped) = consumer_handle.join().unwrap();

        assert_eq!(delivered, accepted);
        assert_eq!(
            delivered as u64 + dropped,
            (producers * per_producer) as u64
        );
    }
}

#[cfg(all(test, feature = "loom"))]
mod tests {
    use crate::{commit_queue, FreeList};
    use loom::{model::Builder, thread};

    #[test]
    fn test_racing_producers_never_tear_records() {
        let mut builder = Builder::new();
        if builder.preemption_bound.is_none() {
            builder.preemption_bound = Some(3);
        }

        builder.check(|| {
            let (producer, mut consumer) = commit_queue::<(usize, u64)>(2);

            let mut handles = vec![];
            for id in 0..2 {
                let producer = producer.clone();
                handles.push(thread::spawn(move || {
                    let mut accepted = 0usize;
                    for seq in 0..2u64 {
                        if producer.push((id, seq * 1000 + id as u64)) {
                            accepted += 1;
                        }
                    }
                    accepted
                }));
            }

            let mut delivered = vec![];
            while let Some(record) = consumer.pop() {
                delivered.push(record);
            }

            let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
            while let Some(record) = consumer.pop() {
                delivered.push(record);
            }

            // Every delivered record reads back exactly as its producer
            // wrote it, and nothing is delivered twice.
            for &(id, payload) in &delivered {
                assert_eq!(payload % 1000, id as u64);
            }
            let mut unique = delivered.clone();
            unique.sort_unstable();
            unique.dedup();
            assert_eq!(unique.len(), delivered.len());

            assert_eq!(delivered.len(), accepted);
            assert_eq!(
                delivered.len() as u64 + consumer.dropped(),
                4
            );
        });
    }

    #[test]
    fn test_freelist_single_owner_per_entry() {
        let mut builder = Builder::new();
        if builder.preemption_bound.is_none() {
            builder.preemption_bound = Some(3);
        }

        builder.check(|| {
            let pool = loom::sync::Arc::new(FreeList::new(2, || 0u32));

            let mut handles = vec![];
            for _ in 0..2 {
                let pool = pool.clone();
                handles.push(thread::spawn(move || {
                    for _ in 0..2 {
                        if let Some(mut lease) = pool.acquire() {
                            let before = *lease;
                            *lease = before + 1;
                            assert_eq!(*lease, before + 1);
                        }
                    }
                }));
            }

            for handle in handles {
                handle.join().unwrap();
            }

            let a = pool.acquire().unwrap();
            let b = pool.acquire().unwrap();
            assert_ne!(a.index(), b.index());
            assert!(pool.acquire().is_none());
        });
    }
}

//! The consumer-side processing thread.
//!
//! A [`Processor`] owns one worker thread that repeatedly gives every
//! registered [`Process`] a chance to do some work, then sleeps up to the
//! configured interval. Producers that want a faster drain wake it early
//! through a [`ProcessorHandle`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, trace};

use commitq::{QueueConsumer, RecordSink};

/// A unit of consumer-side work, called periodically from the processing
/// thread. `run` should do a bounded amount of work and return.
pub trait Process: Send {
    fn run(&mut self);

    /// Called once after the final drain pass, before the thread exits.
    fn stop(&mut self) {}
}

struct Shared {
    running: AtomicBool,
    pending: Mutex<bool>,
    wakeup: Condvar,
}

impl Shared {
    fn notify(&self) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !*pending {
            *pending = true;
            self.wakeup.notify_one();
        }
    }
}

/// Wakes the processing thread ahead of its interval. Cheap to clone and
/// safe to call from any ordinary thread (not signal-safe: it takes a
/// lock).
#[derive(Clone)]
pub struct ProcessorHandle {
    shared: Arc<Shared>,
}

impl ProcessorHandle {
    pub fn notify(&self) {
        self.shared.notify();
    }
}

/// Owns the processing thread. Dropping the processor stops it; [`stop`]
/// does the same but surfaces the join.
///
/// [`stop`]: Processor::stop
pub struct Processor {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Processor {
    /// Spawn the processing thread. `run_interval` bounds how long the
    /// thread sleeps between passes; `None` sleeps until notified.
    pub fn start(
        mut processes: Vec<Box<dyn Process>>,
        run_interval: Option<Duration>,
    ) -> std::io::Result<Processor> {
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            pending: Mutex::new(false),
            wakeup: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("relay-processor".to_string())
            .spawn(move || {
                debug!(processes = processes.len(), "processing thread started");
                loop {
                    for process in processes.iter_mut() {
                        process.run();
                    }

                    if !thread_shared.running.load(Ordering::Relaxed) {
                        break;
                    }

                    let guard = thread_shared
                        .pending
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    let mut guard = match run_interval {
                        Some(interval) => {
                            thread_shared
                                .wakeup
                                .wait_timeout_while(guard, interval, |pending| !*pending)
                                .unwrap_or_else(PoisonError::into_inner)
                                .0
                        }
                        None => thread_shared
                            .wakeup
                            .wait_while(guard, |pending| !*pending)
                            .unwrap_or_else(PoisonError::into_inner),
                    };
                    *guard = false;
                    trace!("processing thread woke up");
                }

                // Work may have arrived between the last pass and the stop
                // flag; drain once more before exiting.
                for process in processes.iter_mut() {
                    process.run();
                }
                for process in processes.iter_mut() {
                    process.stop();
                }
                debug!("processing thread exited");
            })?;

        Ok(Processor {
            shared,
            handle: Some(handle),
        })
    }

    pub fn handle(&self) -> ProcessorHandle {
        ProcessorHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    /// Stop and join the processing thread. The thread runs one final
    /// drain pass before exiting.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.shared.running.store(false, Ordering::Relaxed);
            self.shared.notify();
            let _ = handle.join();
        }
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// [`Process`] that drains a commit queue into a [`RecordSink`] until the
/// queue is empty, the way the consumer side of the event pipeline runs.
pub struct QueueDrain<T, S> {
    consumer: QueueConsumer<T>,
    sink: S,
}

impl<T, S: RecordSink<T>> QueueDrain<T, S> {
    pub fn new(consumer: QueueConsumer<T>, sink: S) -> Self {
        QueueDrain { consumer, sink }
    }
}

impl<T: Send, S: RecordSink<T> + Send> Process for QueueDrain<T, S> {
    fn run(&mut self) {
        let delivered = self.consumer.drain(&mut self.sink);
        if delivered > 0 {
            trace!(delivered, "drained commit queue");
        }
    }
}

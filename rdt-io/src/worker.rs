//! Work queue and cooperative worker thread
//!
//! A session runs a processing thread that sleeps on a condition variable
//! until work arrives or its next deadline passes. `WorkQueue` is the shared
//! inbox; `Worker` owns the thread and its shutdown flag.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Multi-producer inbox with a timed blocking drain
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    ready: Condvar,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        WorkQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Append an item and wake the consumer
    ///
    /// Returns `false` if the queue has been closed.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.items.push_back(item);
        drop(state);
        self.ready.notify_one();
        true
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Take everything queued, waiting until `deadline` if nothing is
    ///
    /// Returns an empty vector on timeout or once the queue is closed and empty.
    pub fn wait_drain(&self, deadline: Instant) -> Vec<T> {
        let mut state = self.state.lock();
        while state.items.is_empty() && !state.closed {
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.items.drain(..).collect()
    }

    /// Take everything queued without waiting
    pub fn drain(&self) -> Vec<T> {
        self.state.lock().items.drain(..).collect()
    }

    /// Wake the consumer without queueing anything
    pub fn notify(&self) {
        self.ready.notify_all();
    }

    /// Refuse further pushes and wake the consumer
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Shared stop flag handed to a worker's body
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// A named thread that runs until its stop flag is raised
pub struct Worker {
    name: String,
    stop: StopFlag,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn `body` on a named thread
    ///
    /// The body should poll the flag regularly and return once it is set.
    pub fn spawn<F>(name: &str, body: F) -> io::Result<Self>
    where
        F: FnOnce(StopFlag) + Send + 'static,
    {
        let stop = StopFlag::new();
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(flag))?;
        tracing::debug!("Worker {} started", name);
        Ok(Worker {
            name: name.to_string(),
            stop,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Raise the stop flag and wait for the thread to exit
    pub fn stop(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Worker {} panicked", self.name);
            } else {
                tracing::debug!("Worker {} stopped", self.name);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sleep granularity used by workers that only poll the stop flag
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_drain_returns_in_order() {
        let queue = WorkQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.drain(), vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_wait_drain_times_out() {
        let queue: WorkQueue<u32> = WorkQueue::new();
        let start = Instant::now();
        let items = queue.wait_drain(start + Duration::from_millis(10));
        assert!(items.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_wait_drain_wakes_on_push() {
        let queue = Arc::new(WorkQueue::new());
        let producer = Arc::clone(&queue);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            producer.push(42u32);
        });
        let items = queue.wait_drain(Instant::now() + Duration::from_secs(5));
        assert_eq!(items, vec![42]);
        handle.join().unwrap();
    }

    #[test]
    fn test_closed_queue_rejects_push() {
        let queue = WorkQueue::new();
        queue.push(1);
        queue.close();
        assert!(!queue.push(2));
        assert!(queue.is_closed());
        // Items queued before close are still delivered
        assert_eq!(queue.wait_drain(Instant::now() + Duration::from_secs(1)), vec![1]);
        assert!(queue
            .wait_drain(Instant::now() + Duration::from_secs(1))
            .is_empty());
    }

    #[test]
    fn test_worker_stops() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let mut worker = Worker::spawn("test-worker", move |stop| {
            while !stop.is_stopped() {
                counter.fetch_add(1, Ordering::Relaxed);
                thread::sleep(DEFAULT_POLL_INTERVAL);
            }
        })
        .unwrap();
        assert_eq!(worker.name(), "test-worker");
        thread::sleep(Duration::from_millis(20));
        worker.stop();
        assert!(!worker.is_running());
        assert!(ticks.load(Ordering::Relaxed) > 0);
    }
}

//! A small bounded worker pool shared by every background maintenance task:
//! the append-only log's segment prefetch, the MVCC history's garbage
//! collector, and the skip list's bucket sweeper. Nothing in this crate
//! spawns an ad-hoc thread of its own for recurring work.

use std::collections::HashSet;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct ThreadPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let receiver = Arc::clone(&receiver);
            let handle = std::thread::Builder::new()
                .name(format!("strata-vtm-worker-{id}"))
                .spawn(move || loop {
                    let job = {
                        let rx = receiver.lock().unwrap();
                        rx.recv()
                    };
                    match job {
                        Ok(job) => job(),
                        Err(_) => break, // sender dropped, pool shutting down
                    }
                })
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
        ThreadPool {
            sender: Some(sender),
            workers,
        }
    }

    /// Enqueue `job`. Never blocks the caller past the channel send.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(sender) = &self.sender {
            let _ = sender.send(Box::new(job));
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Tracks which background job keys are currently outstanding so a caller
/// can submit "at most one pending instance" of a recurring task (segment
/// prefetch, GC sweep).
#[derive(Default)]
pub struct PendingKeys<K: Eq + std::hash::Hash + Clone> {
    inner: Mutex<HashSet<K>>,
}

impl<K: Eq + std::hash::Hash + Clone> PendingKeys<K> {
    pub fn new() -> Self {
        PendingKeys {
            inner: Mutex::new(HashSet::new()),
        }
    }

    /// Returns true if `key` was newly marked pending (caller should submit
    /// the job); false if it was already outstanding.
    pub fn try_start(&self, key: K) -> bool {
        self.inner.lock().unwrap().insert(key)
    }

    pub fn finish(&self, key: &K) {
        self.inner.lock().unwrap().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn jobs_run_on_workers() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = mpsc::channel();
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            let done_tx = done_tx.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = done_tx.send(());
            });
        }
        for _ in 0..16 {
            done_rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn pending_keys_dedup() {
        let keys: PendingKeys<u32> = PendingKeys::new();
        assert!(keys.try_start(1));
        assert!(!keys.try_start(1));
        keys.finish(&1);
        assert!(keys.try_start(1));
    }
}

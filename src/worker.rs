//! Fixed-size worker pool and the cancellation token its long-running jobs watch.

use crate::storage::error::{StorageError, StorageResult};
use log::{debug, error};
use parking_lot::{Condvar, Mutex};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Cooperative cancellation flag with an interruptible sleep.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (cancelled, condvar) = &*self.inner;
        *cancelled.lock() = true;
        condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleep for up to `timeout`. Returns true as soon as the token is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (cancelled, condvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut guard = cancelled.lock();
        while !*guard {
            if condvar.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        *guard
    }
}

struct Worker {
    id: usize,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn spawn(id: usize, receiver: Arc<Mutex<Receiver<Job>>>) -> StorageResult<Self> {
        let thread = thread::Builder::new()
            .name(format!("pagedb-worker-{}", id))
            .spawn(move || loop {
                // the lock is released before the job runs
                let job = receiver.lock().recv();
                match job {
                    Ok(job) => job(),
                    Err(_) => break,
                }
            })?;
        Ok(Self {
            id,
            thread: Some(thread),
        })
    }
}

/// Threads pulling boxed jobs from one channel. Closing the channel stops
/// each worker once its current job returns.
pub struct WorkerPool {
    workers: Vec<Worker>,
    sender: Mutex<Option<Sender<Job>>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> StorageResult<Self> {
        if size == 0 {
            return Err(StorageError::Other("worker pool needs at least one thread".into()));
        }
        let (sender, receiver) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..size)
            .map(|id| Worker::spawn(id, Arc::clone(&receiver)))
            .collect::<StorageResult<Vec<_>>>()?;
        debug!("started {} workers", size);
        Ok(Self {
            workers,
            sender: Mutex::new(Some(sender)),
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn execute<F>(&self, f: F) -> StorageResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(StorageError::Shutdown)?;
        sender.send(Box::new(f)).map_err(|_| StorageError::Shutdown)
    }

    /// Close the queue and join every worker. Long-running jobs must be told
    /// to stop (through their `ShutdownToken`) first, or this blocks on them.
    pub fn shutdown(&mut self) {
        self.sender.lock().take();
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    error!("worker {} panicked", worker.id);
                }
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! Worker pool for the non-blocking operation variants
//!
//! Jobs travel over a crossbeam channel to a fixed set of threads; each job
//! reports back through its own single-use channel wrapped in a
//! [`Completion`].

use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;

use crate::error::{EmberError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Result of an operation running on the worker pool
#[derive(Debug)]
pub struct Completion<T> {
    rx: Receiver<Result<T>>,
}

impl<T> Completion<T> {
    /// A completion that is already resolved
    pub fn ready(result: Result<T>) -> Self {
        let (tx, rx) = channel::bounded(1);
        let _ = tx.send(result);
        Self { rx }
    }

    /// Block until the operation finishes
    pub fn wait(self) -> Result<T> {
        self.rx.recv().unwrap_or_else(|_| Err(worker_gone()))
    }

    /// The result if the operation already finished
    pub fn try_wait(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(worker_gone())),
        }
    }

    /// Wait at most `timeout`; `None` if the operation is still running
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(worker_gone())),
        }
    }
}

fn worker_gone() -> EmberError {
    EmberError::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "worker finished without reporting a result",
    ))
}

pub(crate) struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Result<Self> {
        let (sender, receiver) = channel::unbounded::<Job>();
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("ember-worker-{}", i))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })?;
            handles.push(handle);
        }
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
        })
    }

    /// Queue `job`; its result arrives through the returned completion
    pub fn submit<T: Send + 'static>(
        &self,
        job: impl FnOnce() -> Result<T> + Send + 'static,
    ) -> Completion<T> {
        let (tx, rx) = channel::bounded(1);
        let wrapped: Job = Box::new(move || {
            let _ = tx.send(job());
        });

        let sent = match &*self.sender.lock() {
            Some(sender) => sender.send(wrapped).is_ok(),
            None => false,
        };
        if !sent {
            return Completion::ready(Err(EmberError::InvalidArgument(
                "environment is closed".to_string(),
            )));
        }
        Completion { rx }
    }

    /// Stop accepting jobs and join the threads
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let current = thread::current().id();
        for handle in self.handles.lock().drain(..) {
            // A job may drop the last environment handle on a worker thread
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

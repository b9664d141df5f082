//! Asynchronous dispatch to the store.
//!
//! Mutations parsed by a connection are packaged as jobs and executed on a
//! small pool of storage worker threads. A job that expects a reply carries a
//! ticket naming the connection; the worker posts the outcome to the owning
//! reactor's completion queue and wakes its poll loop. Fire-and-forget jobs
//! (noreply) carry no ticket and produce no completion.

use crate::store::{Outcome, Store};
use bytes::Bytes;
use mio::Waker;
use std::collections::VecDeque;
use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// How a storage command treats an existing item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

/// One mutation to execute against the store.
#[derive(Debug)]
pub enum WriteRequest {
    Store {
        mode: StoreMode,
        key: String,
        value: Bytes,
        flags: u32,
        exptime: u64,
    },
    Cas {
        key: String,
        value: Bytes,
        flags: u32,
        exptime: u64,
        cas: u64,
    },
    Delete {
        key: String,
    },
    Incr {
        key: String,
        delta: u64,
    },
    Decr {
        key: String,
        delta: u64,
    },
    FlushAll,
}

/// Execute one request against the store.
pub fn execute(store: &Store, request: WriteRequest) -> Outcome {
    match request {
        WriteRequest::Store {
            mode,
            key,
            value,
            flags,
            exptime,
        } => match mode {
            StoreMode::Set => store.set(&key, value, flags, exptime),
            StoreMode::Add => store.add(&key, value, flags, exptime),
            StoreMode::Replace => store.replace(&key, value, flags, exptime),
            StoreMode::Append => store.append(&key, &value),
            StoreMode::Prepend => store.prepend(&key, &value),
        },
        WriteRequest::Cas {
            key,
            value,
            flags,
            exptime,
            cas,
        } => store.cas(&key, value, flags, exptime, cas),
        WriteRequest::Delete { key } => store.delete(&key),
        WriteRequest::Incr { key, delta } => store.incr(&key, delta),
        WriteRequest::Decr { key, delta } => store.decr(&key, delta),
        WriteRequest::FlushAll => store.flush_all(),
    }
}

/// A finished store operation on its way back to the owning reactor.
#[derive(Debug)]
pub struct Completion {
    pub conn_id: usize,
    pub serial: u64,
    pub outcome: Outcome,
}

/// Per-reactor completion queue plus the waker that interrupts its poll.
#[derive(Clone)]
pub struct CompletionSink {
    queue: Arc<Mutex<VecDeque<Completion>>>,
    waker: Arc<Waker>,
}

impl CompletionSink {
    pub fn new(queue: Arc<Mutex<VecDeque<Completion>>>, waker: Arc<Waker>) -> Self {
        Self { queue, waker }
    }

    fn post(&self, completion: Completion) {
        self.queue.lock().unwrap().push_back(completion);
        if let Err(e) = self.waker.wake() {
            error!(error = %e, "Failed to wake reactor for completion");
        }
    }
}

/// Weak handle to a connection awaiting a completion.
///
/// The serial disambiguates reuse of a slab slot: the reactor drops any
/// completion whose serial no longer matches the connection living under
/// `conn_id`, so completions for torn-down connections are discarded.
#[derive(Clone)]
pub struct Ticket {
    pub conn_id: usize,
    pub serial: u64,
    pub sink: CompletionSink,
}

/// One unit of work for the storage pool.
pub struct Job {
    pub request: WriteRequest,
    pub reply: Option<Ticket>,
}

/// Cloneable handle for submitting jobs to the storage pool.
#[derive(Clone)]
pub struct Backend {
    jobs: Sender<Job>,
}

impl Backend {
    /// Spawn `workers` storage threads draining a shared job queue.
    pub fn spawn(store: Arc<Store>, workers: usize) -> io::Result<(Self, Vec<JoinHandle<()>>)> {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let store = Arc::clone(&store);
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("store-{worker_id}"))
                .spawn(move || worker_loop(worker_id, &store, &rx))?;
            handles.push(handle);
        }

        Ok((Self { jobs: tx }, handles))
    }

    /// Queue a job. Failure means the storage pool is gone, which only
    /// happens during shutdown; the job is dropped.
    pub fn submit(&self, job: Job) {
        if self.jobs.send(job).is_err() {
            debug!("Storage pool is gone; dropping job");
        }
    }

    /// Backend without workers; the test drains the queue itself.
    #[cfg(test)]
    pub(crate) fn with_queue() -> (Self, Receiver<Job>) {
        let (tx, rx) = mpsc::channel();
        (Self { jobs: tx }, rx)
    }
}

fn worker_loop(worker_id: usize, store: &Store, rx: &Mutex<Receiver<Job>>) {
    debug!(worker = worker_id, "Storage worker started");
    loop {
        let job = {
            let rx = rx.lock().unwrap();
            rx.recv()
        };
        let Ok(job) = job else {
            // All senders dropped: the server is shutting down.
            debug!(worker = worker_id, "Storage worker exiting");
            return;
        };

        let outcome = execute(store, job.request);
        if let Some(ticket) = job.reply {
            ticket.sink.post(Completion {
                conn_id: ticket.conn_id,
                serial: ticket.serial,
                outcome,
            });
        }
    }
}

//! Readiness-based reactor.
//!
//! One poll loop per worker thread, each with its own `SO_REUSEPORT`
//! listener so the kernel balances incoming connections. Store completions
//! reach the owning worker through a waker-backed queue.

mod event_loop;

pub use event_loop::worker;

use mio::Waker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Shutdown coordination across workers.
///
/// Any worker observing a shutdown verdict raises the flag and wakes every
/// registered poll loop so the others notice promptly.
pub struct Shared {
    shutdown: AtomicBool,
    wakers: Mutex<Vec<Arc<Waker>>>,
}

impl Shared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shutdown: AtomicBool::new(false),
            wakers: Mutex::new(Vec::new()),
        })
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            for waker in self.wakers.lock().unwrap().iter() {
                let _ = waker.wake();
            }
        }
    }

    fn register_waker(&self, waker: Arc<Waker>) {
        self.wakers.lock().unwrap().push(waker);
    }
}

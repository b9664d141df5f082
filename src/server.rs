//! Server assembly: storage pool, reactor workers, expiry sweep, shutdown.

use crate::backend::Backend;
use crate::config::Config;
use crate::reactor::{self, Shared};
use crate::store::Store;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info};

/// Run the server until a client requests shutdown.
pub fn run(config: Config) -> io::Result<()> {
    let addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let store = Store::new(config.max_memory, config.default_ttl);
    let (backend, store_handles) = Backend::spawn(Arc::clone(&store), config.store_workers)?;
    let shared = Shared::new();

    let sweep_handle = spawn_sweep(
        Arc::clone(&store),
        Arc::clone(&shared),
        config.cleanup_interval,
    )?;

    let num_workers = if config.workers == 0 {
        num_cpus()
    } else {
        config.workers
    };

    info!(
        workers = num_workers,
        addr = %addr,
        store_workers = config.store_workers,
        "Starting reactor workers"
    );

    let mut handles = Vec::with_capacity(num_workers);
    for worker_id in 0..num_workers {
        let config = config.clone();
        let store = Arc::clone(&store);
        let backend = backend.clone();
        let shared = Arc::clone(&shared);

        let handle = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || {
                if let Err(e) = reactor::worker(worker_id, addr, &config, store, backend, shared) {
                    error!(worker = worker_id, error = %e, "Worker failed");
                }
            })?;

        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.join();
    }

    // Workers are gone; stop the sweep and drain the storage pool.
    shared.request_shutdown();
    drop(backend);
    for handle in store_handles {
        let _ = handle.join();
    }
    let _ = sweep_handle.join();

    info!("Server stopped");
    Ok(())
}

/// Background thread removing expired items on a fixed interval.
fn spawn_sweep(
    store: Arc<Store>,
    shared: Arc<Shared>,
    interval_secs: u64,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("sweep".to_string())
        .spawn(move || loop {
            for _ in 0..interval_secs.max(1) {
                if shared.is_shutdown() {
                    return;
                }
                thread::sleep(Duration::from_secs(1));
            }
            store.cleanup_expired();
        })
}

fn num_cpus() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

//! mio event loop.
//!
//! Readiness-based model: poll reports when sockets are ready, then the
//! connection state machine performs non-blocking reads and writes. Poll
//! interest follows the connection's state — writable while a flush is
//! short, nothing at all while a store operation is in flight (unread bytes
//! in the kernel are the per-connection back-pressure), readable otherwise.

use crate::backend::{Backend, Completion, CompletionSink, Ticket};
use crate::config::Config;
use crate::conn::{Conn, Direction, Event, State, Verdict};
use crate::protocol::TextHandler;
use crate::reactor::Shared;
use crate::store::Store;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// One slab slot: the connection plus the serial its completion tickets
/// carry, and the interest currently registered with poll.
struct Entry {
    conn: Conn<TcpStream, TextHandler>,
    serial: u64,
    interest: Option<Interest>,
}

/// Run one worker's event loop until shutdown.
pub fn worker(
    worker_id: usize,
    addr: SocketAddr,
    config: &Config,
    store: Arc<Store>,
    backend: Backend,
    shared: Arc<Shared>,
) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(config.batch_size);

    // Each worker binds its own listener with SO_REUSEPORT for kernel load
    // balancing.
    let listener = create_listener_with_reuseport(addr)?;
    let mut listener = TcpListener::from_std(listener);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
    let completions: Arc<Mutex<VecDeque<Completion>>> = Arc::new(Mutex::new(VecDeque::new()));
    let sink = CompletionSink::new(Arc::clone(&completions), Arc::clone(&waker));
    shared.register_waker(waker);

    let mut connections: Slab<Entry> = Slab::with_capacity(config.max_connections);
    let mut next_serial: u64 = 0;

    info!(
        worker = worker_id,
        buffer_size = config.buffer_size,
        max_connections = config.max_connections,
        "Worker started"
    );

    while !shared.is_shutdown() {
        poll.poll(&mut events, None)?;

        for event in events.iter() {
            match event.token() {
                LISTENER_TOKEN => {
                    accept_connections(
                        &listener,
                        &mut poll,
                        &mut connections,
                        config,
                        worker_id,
                        &store,
                        &backend,
                        &sink,
                        &mut next_serial,
                    )?;
                }
                WAKER_TOKEN => {
                    deliver_completions(&mut poll, &mut connections, &completions, &shared);
                }
                Token(conn_id) => {
                    let dir = direction_of(event);
                    step_connection(
                        &mut poll,
                        &mut connections,
                        conn_id,
                        Event::Socket(dir),
                        &shared,
                    );
                }
            }
        }
    }

    // Tear down remaining connections through the normal shutdown path so
    // buffers release before the sockets close.
    info!(worker = worker_id, "Worker shutting down");
    let ids: Vec<usize> = connections.iter().map(|(id, _)| id).collect();
    for conn_id in ids {
        if let Some(mut entry) = connections.try_remove(conn_id) {
            let _ = entry.conn.step(Event::Shutdown);
            if entry.interest.is_some() {
                let _ = poll.registry().deregister(entry.conn.stream_mut());
            }
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn accept_connections(
    listener: &TcpListener,
    poll: &mut Poll,
    connections: &mut Slab<Entry>,
    config: &Config,
    worker_id: usize,
    store: &Arc<Store>,
    backend: &Backend,
    sink: &CompletionSink,
    next_serial: &mut u64,
) -> io::Result<()> {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if connections.len() >= config.max_connections {
                    warn!("Connection limit reached, dropping connection");
                    continue;
                }

                *next_serial += 1;
                let serial = *next_serial;
                let slot = connections.vacant_entry();
                let conn_id = slot.key();
                let ticket = Ticket {
                    conn_id,
                    serial,
                    sink: sink.clone(),
                };
                let handler = TextHandler::new(Arc::clone(store), backend.clone(), ticket);
                let entry = slot.insert(Entry {
                    conn: Conn::new(stream, handler, config.buffer_size),
                    serial,
                    interest: None,
                });

                poll.registry().register(
                    entry.conn.stream_mut(),
                    Token(conn_id),
                    Interest::READABLE,
                )?;
                entry.interest = Some(Interest::READABLE);

                debug!(
                    worker = worker_id,
                    conn_id,
                    peer = %peer_addr,
                    "Accepted connection"
                );
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                error!("Accept error: {}", e);
                break;
            }
        }
    }
    Ok(())
}

/// Drain the completion queue, validating each serial so completions for
/// torn-down connections (or reused slots) are dropped.
fn deliver_completions(
    poll: &mut Poll,
    connections: &mut Slab<Entry>,
    completions: &Mutex<VecDeque<Completion>>,
    shared: &Shared,
) {
    loop {
        let completion = completions.lock().unwrap().pop_front();
        let Some(Completion {
            conn_id,
            serial,
            outcome,
        }) = completion
        else {
            break;
        };

        match connections.get(conn_id) {
            Some(entry) if entry.serial == serial => {
                step_connection(
                    poll,
                    connections,
                    conn_id,
                    Event::StoreDone(outcome),
                    shared,
                );
            }
            _ => trace!(conn_id, serial, "Dropping completion for dead connection"),
        }
    }
}

fn step_connection(
    poll: &mut Poll,
    connections: &mut Slab<Entry>,
    conn_id: usize,
    event: Event,
    shared: &Shared,
) {
    let Some(entry) = connections.get_mut(conn_id) else {
        return;
    };

    match entry.conn.step(event) {
        Ok(Verdict::Continue | Verdict::Idle) => {
            if let Err(e) = update_interest(poll, entry, conn_id) {
                debug!(conn_id, error = %e, "Interest update failed");
                close_connection(poll, connections, conn_id);
            }
        }
        Ok(Verdict::Quit) => close_connection(poll, connections, conn_id),
        Ok(Verdict::Invalid) => {
            error!(conn_id, "Connection violated its state contract");
            close_connection(poll, connections, conn_id);
        }
        Ok(Verdict::Shutdown) => {
            info!(conn_id, "Shutdown requested");
            close_connection(poll, connections, conn_id);
            shared.request_shutdown();
        }
        Err(e) => {
            debug!(conn_id, error = %e, "Connection error");
            close_connection(poll, connections, conn_id);
        }
    }
}

/// Reconcile poll interest with the connection's state.
fn update_interest(poll: &mut Poll, entry: &mut Entry, conn_id: usize) -> io::Result<()> {
    let desired = match entry.conn.state() {
        State::SendIncomplete => Some(Interest::WRITABLE),
        State::StorePending => None,
        _ => Some(Interest::READABLE),
    };

    match (entry.interest, desired) {
        (Some(current), Some(want)) if current == want => {}
        (Some(_), Some(want)) => {
            poll.registry()
                .reregister(entry.conn.stream_mut(), Token(conn_id), want)?;
        }
        (None, Some(want)) => {
            poll.registry()
                .register(entry.conn.stream_mut(), Token(conn_id), want)?;
        }
        (Some(_), None) => {
            poll.registry().deregister(entry.conn.stream_mut())?;
        }
        (None, None) => {}
    }
    entry.interest = desired;
    Ok(())
}

fn close_connection(poll: &mut Poll, connections: &mut Slab<Entry>, conn_id: usize) {
    if let Some(mut entry) = connections.try_remove(conn_id) {
        if entry.interest.is_some() {
            let _ = poll.registry().deregister(entry.conn.stream_mut());
        }
        debug!(conn_id, "Connection closed");
    }
}

fn direction_of(event: &mio::event::Event) -> Direction {
    match (event.is_readable(), event.is_writable()) {
        (true, true) => Direction::ReadWrite,
        (false, true) => Direction::Write,
        // Hangup and error conditions surface through the next read.
        _ => Direction::Read,
    }
}

/// Create a TCP listener with SO_REUSEPORT for kernel load balancing.
fn create_listener_with_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

//! Listener and session dispatch
//!
//! [`Server::start`] binds the listening socket, spawns the dispatcher
//! thread, and returns a [`ServerHandle`]. The dispatcher accepts
//! connections (nonblocking, polling the shutdown flag between attempts),
//! authenticates the peer, and spawns one session thread per client.
//! Shutdown closes every live session socket, which wakes the blocked
//! session reads; the dispatcher then joins all session threads before it
//! exits.

use crate::engine::{Engine, ServerConfig};
use crate::session::Session;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tessera_core::{Result, TesseraError};

type SessionSockets = Arc<Mutex<HashMap<usize, UnixStream>>>;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Peer check run before a session thread is spawned.
///
/// Authentication is disabled for now: any local peer that can reach the
/// socket path may connect.
fn authenticate(_stream: &UnixStream) -> bool {
    true
}

/// The server entry point.
pub struct Server;

impl Server {
    /// Create the shared segments, recover durable state, bind the socket,
    /// and start accepting sessions.
    pub fn start(config: ServerConfig) -> Result<ServerHandle> {
        let engine = Arc::new(Engine::new(&config)?);

        // A stale socket file from a dead server would fail the bind.
        if config.socket_path.exists() {
            std::fs::remove_file(&config.socket_path)
                .map_err(|e| TesseraError::io("remove stale socket", e))?;
        }
        let listener = UnixListener::bind(&config.socket_path)
            .map_err(|e| TesseraError::io("bind listening socket", e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| TesseraError::io("set listener nonblocking", e))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let active_sessions = Arc::new(AtomicUsize::new(0));
        let session_sockets: SessionSockets = Arc::new(Mutex::new(HashMap::new()));

        let dispatcher = {
            let engine = Arc::clone(&engine);
            let shutdown = Arc::clone(&shutdown);
            let active_sessions = Arc::clone(&active_sessions);
            let session_sockets = Arc::clone(&session_sockets);
            std::thread::spawn(move || {
                dispatch_loop(listener, engine, shutdown, active_sessions, session_sockets);
            })
        };

        tracing::info!(socket = %config.socket_path.display(), "server started");
        Ok(ServerHandle {
            engine,
            shutdown,
            active_sessions,
            session_sockets,
            dispatcher: Some(dispatcher),
            socket_path: config.socket_path,
        })
    }
}

fn dispatch_loop(
    listener: UnixListener,
    engine: Arc<Engine>,
    shutdown: Arc<AtomicBool>,
    active_sessions: Arc<AtomicUsize>,
    session_sockets: SessionSockets,
) {
    let mut session_threads: Vec<JoinHandle<()>> = Vec::new();
    let mut next_session_id = 0usize;
    while !shutdown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                if !authenticate(&stream) {
                    tracing::warn!("rejected unauthenticated peer");
                    continue;
                }
                let session_id = next_session_id;
                next_session_id += 1;
                if let Ok(clone) = stream.try_clone() {
                    session_sockets.lock().insert(session_id, clone);
                }
                let engine = Arc::clone(&engine);
                let shutdown = Arc::clone(&shutdown);
                let active = Arc::clone(&active_sessions);
                let sockets = Arc::clone(&session_sockets);
                active.fetch_add(1, Ordering::AcqRel);
                session_threads.push(std::thread::spawn(move || {
                    Session::new(engine, stream, shutdown).run();
                    sockets.lock().remove(&session_id);
                    active.fetch_sub(1, Ordering::AcqRel);
                }));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                tracing::error!(error = %e, "accept failed; stopping dispatcher");
                break;
            }
        }
    }
    // Wake every session blocked in a read, then wait for them to finish.
    for (_, socket) in session_sockets.lock().drain() {
        let _ = socket.shutdown(Shutdown::Both);
    }
    for thread in session_threads {
        let _ = thread.join();
    }
    tracing::info!("dispatcher stopped");
}

/// A running server. Dropping it shuts the server down.
pub struct ServerHandle {
    engine: Arc<Engine>,
    shutdown: Arc<AtomicBool>,
    active_sessions: Arc<AtomicUsize>,
    session_sockets: SessionSockets,
    dispatcher: Option<JoinHandle<()>>,
    socket_path: PathBuf,
}

impl ServerHandle {
    /// The path clients connect to.
    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    /// The server core, for diagnostics.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Number of currently connected sessions.
    pub fn session_count(&self) -> usize {
        self.active_sessions.load(Ordering::Acquire)
    }

    /// Wipe the database. Refused while any session is connected; the
    /// session registry is the lock authority for whole-database resets.
    pub fn reset(&self) -> Result<()> {
        if self.session_count() > 0 {
            return Err(TesseraError::protocol(
                "cannot reset while sessions are connected",
            ));
        }
        self.engine.reset()
    }

    /// Stop accepting, disconnect every session, and wait for the
    /// dispatcher to finish.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        // The dispatcher notices the flag at its next poll; closing the
        // session sockets here lets sessions start tearing down in
        // parallel with that.
        for socket in self.session_sockets.lock().values() {
            let _ = socket.shutdown(Shutdown::Both);
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.join();
        }
        let _ = std::fs::remove_file(&self.socket_path);
        tracing::info!("server stopped");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

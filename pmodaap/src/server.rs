//! The top-level `Server`: owns the listener, the client registry, the
//! router's shared state, and the optional service advertiser; wires
//! them into an accept loop and a graceful `stop()`.
//!
//! Grounded on `imbolc_net::server::NetServer::bind`/`accept_connections`
//! (nonblocking listener, poll-with-sleep accept loop, a client registry
//! keyed by an incrementing id so a central owner can enumerate
//! connections) and `pmoupnp::ssdp::server`'s `Drop`-triggered
//! unregistration, generalized per SPEC_FULL.md §11's "graceful shutdown"
//! supplement: `stop()` flips the running flag, wakes revision waiters,
//! and force-closes every tracked client socket so `accept`/read loops
//! unwind promptly instead of waiting out an idle keep-alive timeout.

use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::advertiser::{AdvertiserError, ServiceAdvertiser};
use crate::http::serve_connection;
use crate::router::{Router, ServerState};

/// How long the accept loop sleeps between nonblocking `accept()` polls
/// when there is no pending connection.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct Server {
    state: Arc<ServerState>,
    router: Arc<Router>,
    clients: Arc<Mutex<HashMap<u64, TcpStream>>>,
    next_client_id: Arc<AtomicU64>,
    advertiser: Mutex<Option<ServiceAdvertiser>>,
    accept_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Server {
    /// Builds the router over `state` and subscribes to the library
    /// adapter's change notifications so `ServerState::record_library_change`
    /// runs (and bumps the revision) on every library mutation, per
    /// spec.md §4.4/§4.6 — the core never polls the adapter for changes.
    pub fn new(state: Arc<ServerState>) -> Self {
        let change_state = Arc::clone(&state);
        state.library.subscribe_changes(Box::new(move || {
            change_state.record_library_change();
        }));

        Self {
            router: Arc::new(Router::new(Arc::clone(&state))),
            state,
            clients: Arc::new(Mutex::new(HashMap::new())),
            next_client_id: Arc::new(AtomicU64::new(0)),
            advertiser: Mutex::new(None),
            accept_handle: Mutex::new(None),
        }
    }

    /// Binds `addr` and spawns the accept loop on a background thread.
    /// Returns the bound local address (useful when `addr`'s port is 0,
    /// as in tests).
    pub fn listen(&self, addr: SocketAddr) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let state = Arc::clone(&self.state);
        let router = Arc::clone(&self.router);
        let clients = Arc::clone(&self.clients);
        let next_client_id = Arc::clone(&self.next_client_id);

        let handle = thread::spawn(move || {
            accept_loop(listener, state, router, clients, next_client_id);
        });
        *self.accept_handle.lock().unwrap() = Some(handle);
        info!(addr = %local_addr, "DAAP server listening");
        Ok(local_addr)
    }

    /// Registers the service over mDNS. A no-op replacing any previous
    /// advertisement if called more than once (e.g. after a config
    /// reload changes the advertised name).
    pub fn advertise(&self, name: &str, port: u16, machine_id: &str) -> Result<(), AdvertiserError> {
        let advertiser = ServiceAdvertiser::start(name, port, self.state.auth_method, machine_id)?;
        *self.advertiser.lock().unwrap() = Some(advertiser);
        Ok(())
    }

    /// Closes the listener's accept loop, force-closes every tracked
    /// client socket, wakes any `/update` long-poll waiters, and drops
    /// the service advertisement (unregistering it).
    pub fn stop(&self) {
        self.state.stop();

        let clients = self.clients.lock().unwrap();
        for (id, stream) in clients.iter() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                warn!(client_id = id, error = %e, "failed to shut down client socket");
            }
        }
        drop(clients);

        if let Some(handle) = self.accept_handle.lock().unwrap().take() {
            let _ = handle.join();
        }

        *self.advertiser.lock().unwrap() = None;
    }
}

fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    router: Arc<Router>,
    clients: Arc<Mutex<HashMap<u64, TcpStream>>>,
    next_client_id: Arc<AtomicU64>,
) {
    while state.is_running() {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    error!(peer = %peer, error = %e, "failed to set accepted stream to blocking mode");
                    continue;
                }
                let registry_handle = match stream.try_clone() {
                    Ok(s) => s,
                    Err(e) => {
                        error!(peer = %peer, error = %e, "failed to clone accepted stream for the client registry");
                        continue;
                    }
                };

                let client_id = next_client_id.fetch_add(1, Ordering::SeqCst);
                clients.lock().unwrap().insert(client_id, registry_handle);

                let state = Arc::clone(&state);
                let router = Arc::clone(&router);
                let clients = Arc::clone(&clients);
                thread::spawn(move || {
                    let server_name = state.name.clone();
                    serve_connection(stream, peer, &server_name, |req, peer, stream| {
                        router.dispatch(req, peer, stream)
                    });
                    clients.lock().unwrap().remove(&client_id);
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                error!(error = %e, "accept error; accept loop continuing");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

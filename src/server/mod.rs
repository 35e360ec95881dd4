//! Multi-client TCP server.
//!
//! The server owns a nonblocking listener polled by an accept thread, and spawns one
//! [`ConnectionHandler`] thread per accepted socket. Connections become visible in the
//! client [`Registry`] once they log in; broadcast and direct messages are queued onto
//! the matching peers' outboxes and flushed by their own handler threads.
//!
//! # Key Components
//!
//! - [`Server`]: Lifecycle, delivery and administrative views.
//! - [`ConnectionHandler`]: Per-connection request loop and login state machine.
//! - [`Registry`]: Lock-guarded index of live connections.
mod activity;
mod handler;
mod outbox;
mod registry;

use std::{
    io::{self, ErrorKind},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::{
    config::ServerConfig,
    engine::QueryEngine,
    protocol::Message,
    storage::{ClientRecord, QueryRecord, SessionRecord, SessionStore, StoreError},
};

pub use activity::{ACTIVITY_CAPACITY, ActivityEntry, ActivityLog};
pub use handler::{ConnectionHandler, HandlerState, LoginSession};
pub use outbox::Outbox;
pub use registry::{ActiveClient, ConnectionId, Peer, Registry};

const REBIND_BACKOFF: Duration = Duration::from_secs(1);
const JOIN_POLL: Duration = Duration::from_millis(10);
/// POSIX `EBADF` ("bad file descriptor"): the listening socket was closed under the
/// accept loop. `std::io::ErrorKind` has no stable variant for it.
const EBADF: i32 = 9;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server already listening on {0}")]
    AlreadyRunning(SocketAddr),
    #[error("server has been stopped")]
    Stopped,
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("Server IO Error: {0}")]
    Io(#[from] io::Error),
}

/// Result of queueing a server-initiated message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for this many connections.
    Queued(usize),
    NoRecipients,
}

/// Usage count of a query type, with the engine's description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTypeStat {
    pub query_type: String,
    pub description: String,
    pub count: i64,
}

/// State shared by the server and every handler thread.
pub(crate) struct Shared {
    /// Authenticated connections.
    pub(crate) clients: Registry,
    /// Every live connection, logged in or not.
    pub(crate) connections: Registry,
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) engine: Arc<dyn QueryEngine>,
    pub(crate) activity: ActivityLog,
    pub(crate) config: ServerConfig,
}

impl Shared {
    pub(crate) fn new(
        config: ServerConfig,
        store: Arc<dyn SessionStore>,
        engine: Arc<dyn QueryEngine>,
    ) -> Self {
        Self {
            clients: Registry::new(),
            connections: Registry::new(),
            store,
            engine,
            activity: ActivityLog::default(),
            config,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Server {
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    stopped: AtomicBool,
    next_id: Arc<AtomicU64>,
    accept: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    started_at: Mutex<Option<Instant>>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn SessionStore>,
        engine: Arc<dyn QueryEngine>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::new(config, store, engine)),
            running: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
            next_id: Arc::new(AtomicU64::new(1)),
            accept: Mutex::new(None),
            local_addr: Mutex::new(None),
            started_at: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Binds `host:port` and starts accepting on a background thread.
    ///
    /// Port 0 picks a free port; the bound address is returned.
    pub fn start(&self, host: &str, port: u16) -> Result<SocketAddr, ServerError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ServerError::Stopped);
        }
        let mut accept = lock(&self.accept);
        if accept.is_some() {
            let address = lock(&self.local_addr).unwrap_or_else(|| SocketAddr::from(([0; 4], 0)));
            return Err(ServerError::AlreadyRunning(address));
        }

        let address = format!("{host}:{port}");
        let listener = TcpListener::bind(&address).map_err(|source| ServerError::Bind {
            address: address.clone(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;

        self.running.store(true, Ordering::SeqCst);
        let context = AcceptContext {
            shared: Arc::clone(&self.shared),
            running: Arc::clone(&self.running),
            next_id: Arc::clone(&self.next_id),
            address: local,
        };
        let spawned = thread::Builder::new()
            .name("sift-accept".to_string())
            .spawn(move || accept_loop(listener, context));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        *accept = Some(handle);
        *lock(&self.local_addr) = Some(local);
        *lock(&self.started_at) = Some(Instant::now());

        info!("listening at {local}");
        self.shared
            .activity
            .record(format!("Server started on {local}"));
        Ok(local)
    }

    /// Stops accepting, stops every connection and shuts the store down. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(false, Ordering::SeqCst);

        // The accept thread owns the listener; once joined no new peer can appear.
        if let Some(handle) = lock(&self.accept).take()
            && handle.join().is_err()
        {
            error!("accept thread panicked");
        }

        let mut peers = self.shared.clients.drain();
        for peer in self.shared.connections.drain() {
            if !peers.iter().any(|p| p.id() == peer.id()) {
                peers.push(peer);
            }
        }
        if !peers.is_empty() {
            info!("stopping {} connection(s)", peers.len());
        }

        for peer in &peers {
            peer.request_stop();
        }
        let deadline = Instant::now() + self.shared.config.join_timeout();
        for peer in &peers {
            if let Some(handle) = peer.take_thread() {
                join_until(handle, deadline, peer.address());
            }
        }

        self.shared.store.shutdown();
        self.shared.activity.record("Server stopped");
        info!("server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    /// Time since `start`, if the server was started.
    pub fn uptime(&self) -> Option<Duration> {
        lock(&self.started_at).map(|started| started.elapsed())
    }

    /// The registry of authenticated connections.
    pub fn registry(&self) -> &Registry {
        &self.shared.clients
    }

    /// Adds a peer to the authenticated registry. Registering twice is a no-op.
    pub fn register(&self, peer: &Arc<Peer>) -> bool {
        self.shared.clients.register(peer)
    }

    /// Removes a peer from the authenticated registry. Removing an absent peer is a no-op.
    pub fn deregister(&self, id: ConnectionId) -> bool {
        self.shared.clients.deregister(id)
    }

    /// Queues `message` for every authenticated connection.
    pub fn broadcast(&self, message: &Message) -> Delivery {
        let peers = self.shared.clients.snapshot();
        deliver(&peers, message)
    }

    /// Queues `message` for every connection logged in as `client_id`.
    pub fn send_to(&self, client_id: i64, message: &Message) -> Delivery {
        deliver(&self.peers_of(client_id), message)
    }

    /// Broadcasts a SERVER_MESSAGE and records it for each recipient.
    pub fn broadcast_text(&self, text: &str) -> Delivery {
        let peers = self.shared.clients.snapshot();
        self.persist_for(&peers, text);
        let delivery = deliver(&peers, &Message::server_notice(text));
        if let Delivery::Queued(n) = delivery {
            self.shared
                .activity
                .record(format!("Broadcast to {n} client(s): {text}"));
        }
        delivery
    }

    /// Sends a SERVER_MESSAGE to one client and records it.
    pub fn send_text_to(&self, client_id: i64, text: &str) -> Delivery {
        let peers = self.peers_of(client_id);
        if !peers.is_empty()
            && let Err(e) = self.shared.store.add_message(client_id, text)
        {
            warn!("could not record message for client {client_id}: {e}");
        }
        let delivery = deliver(&peers, &Message::server_notice(text));
        if delivery != Delivery::NoRecipients {
            self.shared
                .activity
                .record(format!("Message to client {client_id}: {text}"));
        }
        delivery
    }

    fn peers_of(&self, client_id: i64) -> Vec<Arc<Peer>> {
        self.shared
            .clients
            .snapshot()
            .into_iter()
            .filter(|peer| peer.client().is_some_and(|c| c.client_id == client_id))
            .collect()
    }

    fn persist_for(&self, peers: &[Arc<Peer>], text: &str) {
        let mut recipients: Vec<i64> = peers
            .iter()
            .filter_map(|peer| peer.client().map(|c| c.client_id))
            .collect();
        recipients.sort_unstable();
        recipients.dedup();

        for client_id in recipients {
            if let Err(e) = self.shared.store.add_message(client_id, text) {
                warn!("could not record message for client {client_id}: {e}");
            }
        }
    }

    pub fn active_clients(&self) -> Vec<ActiveClient> {
        self.shared.clients.active_clients()
    }

    /// Live connections, logged in or not.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    pub fn client_info(&self, client_id: i64) -> Result<Option<ClientRecord>, StoreError> {
        self.shared.store.client(client_id)
    }

    pub fn all_clients(&self) -> Result<Vec<ClientRecord>, StoreError> {
        self.shared.store.clients()
    }

    pub fn client_queries(&self, client_id: i64) -> Result<Vec<QueryRecord>, StoreError> {
        self.shared.store.client_queries(client_id)
    }

    pub fn query_stats(&self) -> Result<Vec<QueryTypeStat>, StoreError> {
        Ok(self
            .shared
            .store
            .query_stats()?
            .into_iter()
            .map(|stat| QueryTypeStat {
                description: self
                    .shared
                    .engine
                    .describe(&stat.query_type)
                    .unwrap_or_else(|| "Unknown query type".to_string()),
                query_type: stat.query_type,
                count: stat.count,
            })
            .collect())
    }

    /// Sessions the store still considers open.
    pub fn active_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.shared.store.open_sessions()
    }

    /// Recent server events, oldest first.
    pub fn activity(&self) -> Vec<ActivityEntry> {
        self.shared.activity.entries()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn deliver(peers: &[Arc<Peer>], message: &Message) -> Delivery {
    if peers.is_empty() {
        debug!("no recipients for {}", message.kind());
        return Delivery::NoRecipients;
    }
    for peer in peers {
        peer.enqueue(message.clone());
    }
    Delivery::Queued(peers.len())
}

fn join_until(handle: JoinHandle<()>, deadline: Instant, address: SocketAddr) {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("handler for {address} did not exit in time, detaching");
            return;
        }
        thread::sleep(JOIN_POLL);
    }
    if handle.join().is_err() {
        error!("handler for {address} panicked");
    }
}

struct AcceptContext {
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
    address: SocketAddr,
}

fn accept_loop(mut listener: TcpListener, context: AcceptContext) {
    let poll = context.shared.config.accept_poll();

    while context.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, address)) => spawn_handler(&context, stream, address),
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(poll),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if listener_invalidated(&e) => {
                error!("listener on {} failed: {e}", context.address);
                match rebind(context.address) {
                    Ok(fresh) => {
                        info!("listener rebound on {}", context.address);
                        listener = fresh;
                        continue;
                    }
                    Err(e) => error!("rebind of {} failed: {e}", context.address),
                }
                backoff(&context.running, REBIND_BACKOFF, poll);
            }
            Err(e) => {
                warn!("broken connection: {e:?}");
                thread::sleep(poll);
            }
        }
    }
    debug!("accept loop on {} exiting", context.address);
}

fn listener_invalidated(err: &io::Error) -> bool {
    let bad_descriptor = cfg!(unix) && err.raw_os_error() == Some(EBADF);
    bad_descriptor || matches!(err.kind(), ErrorKind::InvalidInput | ErrorKind::NotConnected)
}

fn rebind(address: SocketAddr) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(address)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Sleeps up to `total`, returning early once `running` clears.
fn backoff(running: &AtomicBool, total: Duration, step: Duration) {
    let until = Instant::now() + total;
    while running.load(Ordering::SeqCst) && Instant::now() < until {
        thread::sleep(step);
    }
}

fn spawn_handler(context: &AcceptContext, stream: TcpStream, address: SocketAddr) {
    if let Err(e) = stream.set_nonblocking(false) {
        warn!("dropping connection from {address}: {e}");
        return;
    }

    let id = context.next_id.fetch_add(1, Ordering::SeqCst);
    let socket = match stream.try_clone() {
        Ok(socket) => Some(socket),
        Err(e) => {
            warn!("cannot clone socket of {address}, stop will wait for its read timeout: {e}");
            None
        }
    };
    let peer = Arc::new(Peer::new(
        id,
        address,
        socket,
        context.shared.config.outbox_capacity,
    ));

    let shared = Arc::clone(&context.shared);
    let handler = match ConnectionHandler::new(stream, Arc::clone(&peer), shared) {
        Ok(handler) => handler,
        Err(e) => {
            warn!("dropping connection from {address}: {e}");
            return;
        }
    };
    context.shared.connections.register(&peer);

    let spawned = thread::Builder::new()
        .name(format!("sift-client-{id}"))
        .spawn(move || handler.run());
    match spawned {
        Ok(handle) => peer.attach_thread(handle),
        Err(e) => error!("failed to spawn handler for {address}: {e}"),
    }
}

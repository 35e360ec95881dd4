use std::{
    collections::BTreeMap,
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};

use chrono::{DateTime, Local};
use log::{debug, warn};

use super::outbox::Outbox;
use crate::protocol::Message;

pub type ConnectionId = u64;

/// Registry view of an authenticated connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveClient {
    pub client_id: i64,
    pub name: String,
    pub nickname: String,
    pub email: String,
    pub session_id: i64,
    pub address: SocketAddr,
    pub connected_at: DateTime<Local>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The part of a connection shared with other threads.
///
/// The handler thread owns the socket and session state; everyone else holding a
/// `Peer` can only queue messages, read the login identity, or ask it to stop.
pub struct Peer {
    id: ConnectionId,
    address: SocketAddr,
    connected_at: DateTime<Local>,
    outbox: Outbox,
    stop: AtomicBool,
    socket: Option<TcpStream>,
    client: Mutex<Option<ActiveClient>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    /// `socket` is a clone of the handler's stream, used only to force it closed.
    pub fn new(
        id: ConnectionId,
        address: SocketAddr,
        socket: Option<TcpStream>,
        outbox_capacity: usize,
    ) -> Self {
        Self {
            id,
            address,
            connected_at: Local::now(),
            outbox: Outbox::new(outbox_capacity),
            stop: AtomicBool::new(false),
            socket,
            client: Mutex::new(None),
            thread: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn connected_at(&self) -> DateTime<Local> {
        self.connected_at
    }

    /// Queues a message for the handler to send on its next drain.
    pub fn enqueue(&self, message: Message) {
        if let Some(evicted) = self.outbox.push(message) {
            warn!(
                "outbound queue for {} full, dropped queued {}",
                self.address,
                evicted.kind()
            );
        }
    }

    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    /// Signals the handler to stop and shuts the socket down so a blocked read returns.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(socket) = &self.socket
            && let Err(e) = socket.shutdown(Shutdown::Both)
        {
            debug!("shutdown of {} socket: {e}", self.address);
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn client(&self) -> Option<ActiveClient> {
        lock(&self.client).clone()
    }

    pub(crate) fn set_client(&self, client: Option<ActiveClient>) {
        *lock(&self.client) = client;
    }

    pub(crate) fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub(crate) fn attach_thread(&self, handle: JoinHandle<()>) {
        *lock(&self.thread) = Some(handle);
    }

    pub(crate) fn take_thread(&self) -> Option<JoinHandle<()>> {
        lock(&self.thread).take()
    }
}

/// Index of live connections keyed by connection id, guarded by a single lock.
///
/// Callers take a snapshot and act on it after the lock is released; nothing in here
/// performs I/O or touches a peer's own locks while holding the registry lock.
#[derive(Default)]
pub struct Registry {
    peers: Mutex<BTreeMap<ConnectionId, Arc<Peer>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `peer`. Returns `false` if it was already present.
    pub fn register(&self, peer: &Arc<Peer>) -> bool {
        let mut peers = lock(&self.peers);
        if peers.contains_key(&peer.id()) {
            return false;
        }
        peers.insert(peer.id(), Arc::clone(peer));
        true
    }

    /// Removes the peer with `id`. Returns `false` if it was absent.
    pub fn deregister(&self, id: ConnectionId) -> bool {
        lock(&self.peers).remove(&id).is_some()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        lock(&self.peers).contains_key(&id)
    }

    pub fn len(&self) -> usize {
        lock(&self.peers).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.peers).is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        lock(&self.peers).values().cloned().collect()
    }

    /// Empties the registry, returning what it held.
    pub fn drain(&self) -> Vec<Arc<Peer>> {
        std::mem::take(&mut *lock(&self.peers))
            .into_values()
            .collect()
    }

    /// Login identities of the registered peers.
    pub fn active_clients(&self) -> Vec<ActiveClient> {
        self.snapshot()
            .iter()
            .filter_map(|peer| peer.client())
            .collect()
    }
}

use std::{
    io,
    mem,
    net::{Shutdown, TcpStream},
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};

use super::{
    Shared,
    registry::{ActiveClient, Peer},
};
use crate::{
    engine::QueryOutcome,
    protocol::{
        Message, MessageKind, Payload, ProtocolTransport, Received, STATUS_OK, TransportError,
        Value,
    },
    storage::{ClientRecord, Registration},
};

const WELCOME: &str = "Connection accepted.";
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity of a logged in connection.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginSession {
    pub client: ClientRecord,
    pub session_id: i64,
}

/// Connected --login--> Authenticated --logout--> Connected;
/// any --failure/stop--> Closing --> Closed.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerState {
    Connected,
    Authenticated(LoginSession),
    Closing,
    Closed,
}

/// Serves one accepted socket on its own thread.
pub struct ConnectionHandler {
    peer: Arc<Peer>,
    transport: ProtocolTransport<TcpStream>,
    shared: Arc<Shared>,
    state: HandlerState,
    ever_authenticated: bool,
    connection_lost: bool,
}

impl ConnectionHandler {
    pub(crate) fn new(stream: TcpStream, peer: Arc<Peer>, shared: Arc<Shared>) -> io::Result<Self> {
        stream.set_read_timeout(Some(shared.config.poll_interval()))?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        let transport =
            ProtocolTransport::with_max_message_size(stream, shared.config.max_message_size);

        Ok(Self {
            peer,
            transport,
            shared,
            state: HandlerState::Connected,
            ever_authenticated: false,
            connection_lost: false,
        })
    }

    pub fn state(&self) -> &HandlerState {
        &self.state
    }

    pub fn run(mut self) {
        info!("accepted connection from {}", self.peer.address());

        match self.transport.write_message(&Message::server_notice(WELCOME)) {
            Ok(()) => self.serve(),
            Err(e) => {
                error!("failed to greet {}: {e}", self.peer.address());
                self.connection_lost = true;
            }
        }

        self.cleanup();
    }

    fn serve(&mut self) {
        let drain_interval = self.shared.config.drain_interval();
        let mut last_drain = Instant::now();

        while !self.peer.stop_requested() {
            match self.transport.read_message() {
                Ok(Received::Message(message)) => {
                    debug!("{} from {}", message.kind(), self.peer.address());
                    if let Some(reply) = self.dispatch(message)
                        && !self.reply(&reply)
                    {
                        return;
                    }
                }
                Ok(Received::Idle) => {}
                Ok(Received::Closed) => {
                    info!("{} disconnected", self.peer.address());
                    self.connection_lost = true;
                    return;
                }
                Err(_) if self.peer.stop_requested() => break,
                Err(e) => {
                    error!("connection with {} failed: {e}", self.peer.address());
                    self.connection_lost =
                        matches!(e, TransportError::Io(_) | TransportError::Truncated { .. });
                    return;
                }
            }

            if last_drain.elapsed() >= drain_interval {
                if !self.drain_outbox() {
                    self.connection_lost = true;
                    return;
                }
                last_drain = Instant::now();
            }
        }

        debug!("handler for {} stopping on request", self.peer.address());
        self.connection_lost = true;
    }

    /// Sends a reply. A reply too large for the wire is replaced by an ERROR.
    fn reply(&mut self, reply: &Message) -> bool {
        let result = match self.transport.write_message(reply) {
            Err(TransportError::TooLarge { len, max }) => {
                warn!(
                    "{} reply to {} is {len} bytes, limit is {max}",
                    reply.kind(),
                    self.peer.address()
                );
                let mut error = Message::error("Response exceeds the maximum message size");
                if let Some(id) = reply.get("request_id") {
                    error = error.with("request_id", id.clone());
                }
                self.transport.write_message(&error)
            }
            other => other,
        };

        if let Err(e) = result {
            error!("failed to send to {}: {e}", self.peer.address());
            self.connection_lost = true;
            return false;
        }
        true
    }

    fn drain_outbox(&mut self) -> bool {
        for message in self.peer.outbox().pop_batch(self.shared.config.drain_batch) {
            if let Err(e) = self.transport.write_message(&message) {
                error!(
                    "failed to deliver queued {} to {}: {e}",
                    message.kind(),
                    self.peer.address()
                );
                return false;
            }
        }
        true
    }

    /// Handles one request. `None` means the message is ignored.
    pub(crate) fn dispatch(&mut self, message: Message) -> Option<Message> {
        let reply = match message.kind() {
            MessageKind::Register => self.handle_register(&message),
            MessageKind::Login => self.handle_login(&message),
            MessageKind::Logout => self.handle_logout(),
            MessageKind::Query => self.handle_query(&message),
            MessageKind::GetMetadata => self.handle_metadata(&message),
            other => {
                warn!(
                    "ignoring unexpected {other} message from {}",
                    self.peer.address()
                );
                return None;
            }
        };

        Some(match message.get("request_id") {
            Some(id) => reply.with("request_id", id.clone()),
            None => reply,
        })
    }

    fn handle_register(&self, message: &Message) -> Message {
        let fields = ["name", "nickname", "email", "password"].map(|key| message.text(key));
        let [Some(name), Some(nickname), Some(email), Some(password)] = fields else {
            return Message::error("Registration failed: missing required fields");
        };
        if !valid_email(email) {
            return Message::error("Registration failed: invalid email format");
        }

        let registration = Registration {
            name: name.to_string(),
            nickname: nickname.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        };
        match self.shared.store.register_client(&registration) {
            Ok(true) => {
                info!("registered {nickname} <{email}>");
                self.shared
                    .activity
                    .record(format!("New client registered: {nickname}"));
                Message::new(MessageKind::Register)
                    .with("status", STATUS_OK)
                    .with("message", "Registration successful")
            }
            Ok(false) => Message::error("Registration failed: nickname or email already in use"),
            Err(e) => {
                warn!("registration of {email} failed: {e}");
                Message::error(format!("Registration failed: {e}"))
            }
        }
    }

    fn handle_login(&mut self, message: &Message) -> Message {
        if let HandlerState::Authenticated(session) = &self.state {
            warn!(
                "{} sent LOGIN while logged in as {}",
                self.peer.address(),
                session.client.nickname
            );
            return Message::error("Login failed: already logged in");
        }

        let (Some(email), Some(password)) = (message.text("email"), message.text("password"))
        else {
            return Message::error("Login failed: missing email or password");
        };

        let client = match self.shared.store.check_login(email, password) {
            Ok(Some(client)) => client,
            Ok(None) => {
                info!("rejected login for {email} from {}", self.peer.address());
                return Message::error("Login failed: invalid credentials");
            }
            Err(e) => {
                warn!("login lookup for {email} failed: {e}");
                return Message::error(format!("Login failed: {e}"));
            }
        };

        let address = self.peer.address();
        let session = match self.shared.store.start_session(client.id, &address.to_string()) {
            Ok(session) => session,
            Err(e) => {
                warn!("could not open a session for {}: {e}", client.nickname);
                return Message::error(format!("Login failed: {e}"));
            }
        };

        self.peer.set_client(Some(ActiveClient {
            client_id: client.id,
            name: client.name.clone(),
            nickname: client.nickname.clone(),
            email: client.email.clone(),
            session_id: session.id,
            address,
            connected_at: self.peer.connected_at(),
        }));
        self.shared.clients.register(&self.peer);
        self.ever_authenticated = true;

        info!(
            "{} logged in from {address} (session {})",
            client.nickname, session.id
        );
        self.shared
            .activity
            .record(format!("Client logged in: {} ({address})", client.nickname));

        let reply = Message::new(MessageKind::Login)
            .with("status", STATUS_OK)
            .with("message", "Login successful")
            .with("client_info", client.to_value())
            .with("session_id", session.id);
        self.state = HandlerState::Authenticated(LoginSession {
            client,
            session_id: session.id,
        });
        reply
    }

    fn handle_logout(&mut self) -> Message {
        let session = match mem::replace(&mut self.state, HandlerState::Connected) {
            HandlerState::Authenticated(session) => session,
            other => {
                self.state = other;
                return Message::error("Logout failed: not logged in");
            }
        };

        // Stay logged in on failure so cleanup retries the end time.
        if let Err(e) = self.shared.store.end_session(session.session_id) {
            warn!("could not end session {}: {e}", session.session_id);
            self.state = HandlerState::Authenticated(session);
            return Message::error(format!("Logout failed: {e}"));
        }

        self.shared.clients.deregister(self.peer.id());
        self.peer.set_client(None);

        info!("{} logged out", session.client.nickname);
        self.shared
            .activity
            .record(format!("Client logged out: {}", session.client.nickname));

        Message::new(MessageKind::Logout)
            .with("status", STATUS_OK)
            .with("message", "Logout successful")
    }

    fn handle_query(&self, message: &Message) -> Message {
        let HandlerState::Authenticated(session) = &self.state else {
            return Message::error("Query failed: not logged in");
        };
        let Some(query_type) = message.text("query_type") else {
            return Message::error("Query failed: missing query type identifier");
        };

        let parameters: Payload = message
            .payload()
            .iter()
            .filter(|(key, _)| !matches!(key.as_str(), "query_type" | "request_id"))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let query_id = match self.shared.store.log_query(
            session.client.id,
            session.session_id,
            query_type,
            &parameters,
        ) {
            Ok(id) => id,
            Err(e) => {
                warn!("could not log {query_type} query: {e}");
                return Message::error(format!("Query failed: {e}"));
            }
        };
        debug!(
            "query {query_id} ({query_type}) from {}",
            session.client.nickname
        );

        match self.shared.engine.process(query_type, &parameters) {
            QueryOutcome::Error(reason) => {
                info!("query {query_id} ({query_type}) failed: {reason}");
                Message::error(format!("Query failed: {reason}"))
            }
            QueryOutcome::Ok(result) => {
                let title = result
                    .title
                    .unwrap_or_else(|| format!("{query_type} Results"));
                let mut reply = Message::new(MessageKind::QueryResult)
                    .with("status", STATUS_OK)
                    .with("query_id", query_id)
                    .with("query_type", query_type)
                    .with("title", title)
                    .with("message", "Query successful");
                if let Some(data) = result.data {
                    reply = reply.with("data", data);
                }
                if let Some(headers) = result.headers {
                    let headers: Vec<Value> = headers.into_iter().map(Value::from).collect();
                    reply = reply.with("headers", headers);
                }
                if let Some(plot) = result.plot {
                    reply = reply.with("plot", plot);
                }
                reply
            }
        }
    }

    fn handle_metadata(&self, message: &Message) -> Message {
        if !matches!(self.state, HandlerState::Authenticated(_)) {
            return Message::error("Metadata request failed: not logged in");
        }
        let Some(kind) = message.text("type") else {
            return Message::error("Metadata request failed: missing metadata type");
        };

        match self.shared.engine.metadata(kind) {
            QueryOutcome::Ok(result) => Message::new(MessageKind::QueryResult)
                .with("status", STATUS_OK)
                .with("metadata_type", kind)
                .with("data", result.data.unwrap_or(Value::Null)),
            QueryOutcome::Error(reason) => {
                Message::error(format!("Metadata request failed: {reason}"))
            }
        }
    }

    /// Releases everything the connection holds. Only the first call has any effect.
    pub(crate) fn cleanup(&mut self) {
        if matches!(self.state, HandlerState::Closing | HandlerState::Closed) {
            return;
        }
        let previous = mem::replace(&mut self.state, HandlerState::Closing);

        if let HandlerState::Authenticated(session) = previous {
            if let Err(e) = self.shared.store.end_session(session.session_id) {
                error!("could not end session {}: {e}", session.session_id);
            }
            self.shared.activity.record(format!(
                "Client disconnected: {} ({})",
                session.client.nickname,
                self.peer.address()
            ));
        }
        if self.ever_authenticated {
            self.shared.clients.deregister(self.peer.id());
            self.peer.set_client(None);
        }
        self.shared.connections.deregister(self.peer.id());

        if !self.connection_lost
            && let Err(e) = self.transport.get_ref().shutdown(Shutdown::Both)
        {
            debug!("closing {}: {e}", self.peer.address());
        }

        self.state = HandlerState::Closed;
        debug!("connection {} closed", self.peer.address());
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Accepts `local@domain.tld` shapes.
fn valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !email.contains(char::is_whitespace)
        && domain
            .rsplit_once('.')
            .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty())
}

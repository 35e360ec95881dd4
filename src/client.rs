//! Blocking client for the sift wire protocol.
//!
//! Requests are tagged with a `request_id` and [`Client::request`] waits for the reply
//! carrying the same id. Server pushes that arrive in between are kept aside and handed
//! out by [`Client::take_notices`].
use std::{
    collections::VecDeque,
    io,
    net::{Shutdown, TcpStream, ToSocketAddrs},
    time::{Duration, Instant},
};

use log::debug;
use thiserror::Error;

use crate::protocol::{
    Message, MessageKind, Payload, ProtocolTransport, Received, TransportError, Value,
};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Client IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("server closed the connection")]
    Closed,
}

pub struct Client {
    transport: ProtocolTransport<TcpStream>,
    timeout: Duration,
    next_request: i64,
    notices: VecDeque<Message>,
}

impl Client {
    pub fn connect(address: impl ToSocketAddrs) -> Result<Self, ClientError> {
        Self::connect_with_timeout(address, DEFAULT_TIMEOUT)
    }

    /// Connects and waits at most `timeout` for each reply.
    pub fn connect_with_timeout(
        address: impl ToSocketAddrs,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(address)?;
        stream.set_read_timeout(Some(POLL_INTERVAL))?;
        Ok(Self {
            transport: ProtocolTransport::new(stream),
            timeout,
            next_request: 1,
            notices: VecDeque::new(),
        })
    }

    pub fn send(&mut self, message: &Message) -> Result<(), ClientError> {
        self.transport.write_message(message)?;
        Ok(())
    }

    /// Next message from the server, waiting up to `timeout`.
    pub fn recv(&mut self, timeout: Duration) -> Result<Message, ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.transport.read_message()? {
                Received::Message(message) => return Ok(message),
                Received::Closed => return Err(ClientError::Closed),
                Received::Idle if Instant::now() >= deadline => {
                    return Err(ClientError::Timeout(timeout));
                }
                Received::Idle => {}
            }
        }
    }

    /// Sends `message` tagged with a fresh request id and returns the matching reply.
    pub fn request(&mut self, message: Message) -> Result<Message, ClientError> {
        let id = self.next_request;
        self.next_request += 1;
        self.send(&message.with("request_id", id))?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let reply = self.recv(remaining)?;
            if reply.get("request_id") == Some(&Value::Int(id)) {
                return Ok(reply);
            }
            debug!("holding {} received while waiting for {id}", reply.kind());
            self.notices.push_back(reply);
        }
    }

    /// Collects any pushes the server sends within `wait`.
    pub fn poll(&mut self, wait: Duration) -> Result<Vec<Message>, ClientError> {
        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            match self.transport.read_message()? {
                Received::Message(message) => self.notices.push_back(message),
                Received::Closed => return Err(ClientError::Closed),
                Received::Idle => {}
            }
        }
        Ok(self.take_notices())
    }

    /// Messages received outside of a request, oldest first.
    pub fn take_notices(&mut self) -> Vec<Message> {
        self.notices.drain(..).collect()
    }

    pub fn register(
        &mut self,
        name: &str,
        nickname: &str,
        email: &str,
        password: &str,
    ) -> Result<Message, ClientError> {
        self.request(
            Message::new(MessageKind::Register)
                .with("name", name)
                .with("nickname", nickname)
                .with("email", email)
                .with("password", password),
        )
    }

    pub fn login(&mut self, email: &str, password: &str) -> Result<Message, ClientError> {
        self.request(
            Message::new(MessageKind::Login)
                .with("email", email)
                .with("password", password),
        )
    }

    pub fn logout(&mut self) -> Result<Message, ClientError> {
        self.request(Message::new(MessageKind::Logout))
    }

    pub fn query(&mut self, query_type: &str, parameters: Payload) -> Result<Message, ClientError> {
        self.request(
            Message::with_payload(MessageKind::Query, parameters).with("query_type", query_type),
        )
    }

    pub fn metadata(&mut self, kind: &str) -> Result<Message, ClientError> {
        self.request(Message::new(MessageKind::GetMetadata).with("type", kind))
    }

    pub fn close(self) -> Result<(), ClientError> {
        self.transport.get_ref().shutdown(Shutdown::Both)?;
        Ok(())
    }
}

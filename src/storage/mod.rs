//! Durable bookkeeping of clients, login sessions and logged queries.
//!
//! Connection handlers never touch storage directly: every operation goes through a
//! [`SessionStore`], and the SQLite implementation reaches the database only through
//! its bounded connection [`pool`].
//!
//! # Key Components
//!
//! - [`SessionStore`]: Operations consumed by the server and its handlers.
//! - [`SqliteStore`]: SQLite-backed store over a [`pool::Pool`] of connections.
//! - [`MemoryStore`]: Process-local store for ephemeral servers and tests.
pub mod memory;
pub mod pool;
pub mod sqlite;

use thiserror::Error;

use crate::protocol::{Payload, Value};

pub use memory::MemoryStore;
pub use pool::{Pool, PoolError, Pooled};
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("failed to encode query parameters: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown client {0}")]
    UnknownClient(i64),
    #[error("unknown session {0}")]
    UnknownSession(i64),
}

/// Fields supplied by a REGISTER request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub name: String,
    pub nickname: String,
    pub email: String,
    pub password: String,
}

/// A registered client, without credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub id: i64,
    pub name: String,
    pub nickname: String,
    pub email: String,
    pub registration_date: String,
}

impl ClientRecord {
    pub fn to_value(&self) -> Value {
        let mut map = Payload::new();
        map.insert("id".to_string(), Value::Int(self.id));
        map.insert("name".to_string(), self.name.as_str().into());
        map.insert("nickname".to_string(), self.nickname.as_str().into());
        map.insert("email".to_string(), self.email.as_str().into());
        map.insert(
            "registration_date".to_string(),
            self.registration_date.as_str().into(),
        );
        Value::Map(map)
    }
}

/// One login session. `end_time` is written once, on logout or disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: i64,
    pub client_id: i64,
    pub address: String,
    pub start_time: String,
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRecord {
    pub id: i64,
    pub client_id: i64,
    pub session_id: i64,
    pub query_type: String,
    /// JSON rendering of the request payload, if it had any fields.
    pub parameters: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryStat {
    pub query_type: String,
    pub count: i64,
}

/// Storage operations backing the server.
///
/// Credentials are compared as stored; substituting a salted hash belongs behind this
/// trait and does not affect callers.
pub trait SessionStore: Send + Sync {
    /// Returns `false` when the nickname or email is already taken.
    fn register_client(&self, registration: &Registration) -> Result<bool, StoreError>;

    fn check_login(&self, email: &str, password: &str)
    -> Result<Option<ClientRecord>, StoreError>;

    fn start_session(&self, client_id: i64, address: &str) -> Result<SessionRecord, StoreError>;

    /// Stamps the end time. A session that already ended keeps its first end time.
    fn end_session(&self, session_id: i64) -> Result<(), StoreError>;

    /// Records a query and returns its id.
    fn log_query(
        &self,
        client_id: i64,
        session_id: i64,
        query_type: &str,
        parameters: &Payload,
    ) -> Result<i64, StoreError>;

    /// Records a server-originated message delivered to `recipient_id`.
    fn add_message(&self, recipient_id: i64, text: &str) -> Result<i64, StoreError>;

    fn client(&self, client_id: i64) -> Result<Option<ClientRecord>, StoreError>;

    /// All registered clients, most recent first.
    fn clients(&self) -> Result<Vec<ClientRecord>, StoreError>;

    /// Queries logged by a client, most recent first.
    fn client_queries(&self, client_id: i64) -> Result<Vec<QueryRecord>, StoreError>;

    /// Query counts per type, most frequent first.
    fn query_stats(&self) -> Result<Vec<QueryStat>, StoreError>;

    /// Sessions without an end time.
    fn open_sessions(&self) -> Result<Vec<SessionRecord>, StoreError>;

    /// Releases backing resources. Later calls may fail.
    fn shutdown(&self) {}
}

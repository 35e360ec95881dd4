//! SQLite-backed session store.
//!
//! Each operation checks a connection out of the pool for the duration of one
//! statement (or one short read) and returns it immediately.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use log::{debug, info};
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, Row, params};

use super::{
    ClientRecord, Pool, Pooled, QueryRecord, QueryStat, Registration, SessionRecord,
    SessionStore, StoreError,
};
use crate::protocol::{Payload, payload_to_json};

const BUSY_TIMEOUT_MS: u64 = 1_000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS clients (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    nickname TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL UNIQUE,
    password TEXT NOT NULL,
    registration_date TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id INTEGER NOT NULL,
    address TEXT NOT NULL,
    start_time TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    end_time TIMESTAMP,
    FOREIGN KEY (client_id) REFERENCES clients (id)
);
CREATE TABLE IF NOT EXISTS queries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id INTEGER NOT NULL,
    session_id INTEGER NOT NULL,
    query_type TEXT NOT NULL,
    parameters TEXT,
    timestamp TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (client_id) REFERENCES clients (id),
    FOREIGN KEY (session_id) REFERENCES sessions (id)
);
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender_type TEXT NOT NULL,
    sender_id INTEGER NOT NULL,
    recipient_type TEXT NOT NULL,
    recipient_id INTEGER NOT NULL,
    message TEXT NOT NULL,
    timestamp TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    read INTEGER DEFAULT 0
);
";

/// One open database connection.
pub struct SqliteConn {
    conn: Connection,
}

impl SqliteConn {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

pub fn sqlite_pool(path: &Path, pool_size: usize) -> Arc<Pool<SqliteConn>> {
    let path = path.to_path_buf();
    Pool::new(pool_size, move || SqliteConn::open(&path))
}

pub struct SqliteStore {
    path: PathBuf,
    pool: Arc<Pool<SqliteConn>>,
    acquire_timeout: Duration,
}

fn client_from_row(row: &Row<'_>) -> rusqlite::Result<ClientRecord> {
    Ok(ClientRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        nickname: row.get(2)?,
        email: row.get(3)?,
        registration_date: row.get(4)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        client_id: row.get(1)?,
        address: row.get(2)?,
        start_time: row.get(3)?,
        end_time: row.get(4)?,
    })
}

fn query_from_row(row: &Row<'_>) -> rusqlite::Result<QueryRecord> {
    Ok(QueryRecord {
        id: row.get(0)?,
        client_id: row.get(1)?,
        session_id: row.get(2)?,
        query_type: row.get(3)?,
        parameters: row.get(4)?,
        timestamp: row.get(5)?,
    })
}

const CLIENT_COLUMNS: &str = "id, name, nickname, email, registration_date";
const SESSION_COLUMNS: &str = "id, client_id, address, start_time, end_time";

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` behind a pool of
    /// `pool_size` connections.
    pub fn open(
        path: impl AsRef<Path>,
        pool_size: usize,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let store = Self {
            pool: sqlite_pool(&path, pool_size),
            path,
            acquire_timeout,
        };

        store.conn()?.connection().execute_batch(SCHEMA)?;
        info!(
            "session store ready at {} ({pool_size} connections)",
            store.path.display()
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &Arc<Pool<SqliteConn>> {
        &self.pool
    }

    fn conn(&self) -> Result<Pooled<SqliteConn>, StoreError> {
        Ok(self.pool.acquire(self.acquire_timeout)?)
    }

    fn session_by_id(
        conn: &Connection,
        session_id: i64,
    ) -> Result<Option<SessionRecord>, StoreError> {
        Ok(conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![session_id],
                session_from_row,
            )
            .optional()?)
    }
}

impl SessionStore for SqliteStore {
    fn register_client(&self, registration: &Registration) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let inserted = conn.connection().execute(
            "INSERT INTO clients (name, nickname, email, password) VALUES (?1, ?2, ?3, ?4)",
            params![
                registration.name,
                registration.nickname,
                registration.email,
                registration.password
            ],
        );

        match inserted {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                debug!("registration conflict for {}", registration.nickname);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn check_login(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<ClientRecord>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .connection()
            .query_row(
                &format!(
                    "SELECT {CLIENT_COLUMNS} FROM clients WHERE email = ?1 AND password = ?2"
                ),
                params![email, password],
                client_from_row,
            )
            .optional()?)
    }

    fn start_session(&self, client_id: i64, address: &str) -> Result<SessionRecord, StoreError> {
        let conn = self.conn()?;
        let inserted = conn.connection().execute(
            "INSERT INTO sessions (client_id, address) VALUES (?1, ?2)",
            params![client_id, address],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                return Err(StoreError::UnknownClient(client_id));
            }
            Err(e) => return Err(e.into()),
        }

        let id = conn.connection().last_insert_rowid();
        Self::session_by_id(conn.connection(), id)?.ok_or(StoreError::UnknownSession(id))
    }

    fn end_session(&self, session_id: i64) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn.connection().execute(
            "UPDATE sessions SET end_time = CURRENT_TIMESTAMP WHERE id = ?1 AND end_time IS NULL",
            params![session_id],
        )?;
        if changed == 0 && Self::session_by_id(conn.connection(), session_id)?.is_none() {
            return Err(StoreError::UnknownSession(session_id));
        }
        Ok(())
    }

    fn log_query(
        &self,
        client_id: i64,
        session_id: i64,
        query_type: &str,
        parameters: &Payload,
    ) -> Result<i64, StoreError> {
        let parameters = if parameters.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&payload_to_json(parameters))?)
        };

        let conn = self.conn()?;
        conn.connection().execute(
            "INSERT INTO queries (client_id, session_id, query_type, parameters)
             VALUES (?1, ?2, ?3, ?4)",
            params![client_id, session_id, query_type, parameters],
        )?;
        Ok(conn.connection().last_insert_rowid())
    }

    fn add_message(&self, recipient_id: i64, text: &str) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.connection().execute(
            "INSERT INTO messages (sender_type, sender_id, recipient_type, recipient_id, message)
             VALUES ('server', 0, 'client', ?1, ?2)",
            params![recipient_id, text],
        )?;
        Ok(conn.connection().last_insert_rowid())
    }

    fn client(&self, client_id: i64) -> Result<Option<ClientRecord>, StoreError> {
        let conn = self.conn()?;
        Ok(conn
            .connection()
            .query_row(
                &format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE id = ?1"),
                params![client_id],
                client_from_row,
            )
            .optional()?)
    }

    fn clients(&self) -> Result<Vec<ClientRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.connection().prepare(&format!(
            "SELECT {CLIENT_COLUMNS} FROM clients ORDER BY registration_date DESC, id DESC"
        ))?;
        let rows = stmt.query_map([], client_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn client_queries(&self, client_id: i64) -> Result<Vec<QueryRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.connection().prepare(
            "SELECT id, client_id, session_id, query_type, parameters, timestamp
             FROM queries WHERE client_id = ?1 ORDER BY timestamp DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![client_id], query_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn query_stats(&self) -> Result<Vec<QueryStat>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.connection().prepare(
            "SELECT query_type, COUNT(*) AS count FROM queries
             GROUP BY query_type ORDER BY count DESC, query_type ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(QueryStat {
                query_type: row.get(0)?,
                count: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn open_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.connection().prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE end_time IS NULL ORDER BY id"
        ))?;
        let rows = stmt.query_map([], session_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn shutdown(&self) {
        self.pool.shutdown();
    }
}

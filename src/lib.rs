pub mod cli;
pub mod client;
pub mod config;
pub mod engine;
pub mod protocol;
pub mod server;
pub mod storage;

pub use cli::{Command, prompt};
pub use client::{Client, ClientError};
pub use config::ServerConfig;
pub use engine::{Catalog, QueryEngine, QueryOutcome, QueryResult};
pub use server::{Delivery, Server, ServerError};
pub use storage::{MemoryStore, SessionStore, SqliteStore};

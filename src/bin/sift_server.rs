use std::{
    error::Error,
    path::PathBuf,
    sync::{Arc, mpsc},
};

use chrono::Local;
use clap::Parser;
use log::info;
use sift::{
    Catalog, MemoryStore, QueryOutcome, Server, ServerConfig, SessionStore, SqliteStore,
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a configuration file
    #[arg(short, long)]
    config: Option<String>,
    /// Listen on this host
    #[arg(long)]
    host: Option<String>,
    /// Listen on this port
    #[arg(short, long)]
    port: Option<u16>,
    /// Database connections kept in the pool
    #[arg(long)]
    pool_size: Option<usize>,
    /// SQLite database file
    #[arg(long)]
    database: Option<PathBuf>,
    /// Keep clients and sessions in memory only
    #[arg(long)]
    ephemeral: bool,
}

fn catalog() -> Catalog {
    Catalog::new()
        .with_query("echo", "Returns the query parameters", |params| {
            QueryOutcome::data(params.clone())
        })
        .with_query("server_time", "Current server time", |_| {
            QueryOutcome::data(Local::now().to_rfc3339())
        })
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = ServerConfig::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(pool_size) = cli.pool_size {
        config.pool_size = pool_size;
    }
    if let Some(database) = cli.database {
        config.database = database;
    }
    config.validate()?;

    let store: Arc<dyn SessionStore> = if cli.ephemeral {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(SqliteStore::open(
            &config.database,
            config.pool_size,
            config.acquire_timeout(),
        )?)
    };

    let server = Server::new(config.clone(), store, Arc::new(catalog()));
    let address = server.start(&config.host, config.port)?;
    info!("sift server ready on {address}, press Ctrl-C to stop");

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    rx.recv()?;

    info!("shutting down");
    server.stop();
    Ok(())
}

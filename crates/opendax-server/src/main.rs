// SPDX-License-Identifier: MIT

//! OpenDAX tag server daemon.
//!
//! Starts a [`opendax_core::runtime::Runtime`] listening on a Unix-domain
//! socket and/or a TCP port, backed by a [`opendax_core::store::TagServer`]
//! whose RETAIN-flagged tags are persisted through one of the backends in
//! `opendax-persistence`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use opendax_core::dispatch::Dispatcher;
use opendax_core::retention::RetentionStore;
use opendax_core::runtime::{ListenConfig, Runtime};
use opendax_core::store::TagServer;
use opendax_persistence::{FlatFileStore, SqliteStore};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum RetentionBackend {
    /// No persistence; RETAIN-flagged writes are simply dropped.
    None,
    /// The original bit-exact record-file format.
    FlatFile,
    /// A SQLite database, for deployments that want SQL access to retained tags.
    Sqlite,
}

/// OpenDAX tag server - a typed tag store reachable over Unix-domain and TCP sockets.
#[derive(Parser, Debug)]
#[command(name = "opendaxd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP address to listen on, e.g. 0.0.0.0:7777. Omit to disable TCP.
    #[arg(long, default_value = "0.0.0.0:7777")]
    tcp_addr: Option<SocketAddr>,

    /// Unix-domain socket path to listen on. Omit to disable it.
    #[cfg(unix)]
    #[arg(long, default_value = "/tmp/opendax")]
    unix_socket: Option<PathBuf>,

    /// Retention backend for RETAIN-flagged tags.
    #[arg(long, value_enum, default_value_t = RetentionBackend::FlatFile)]
    retention: RetentionBackend,

    /// Path to the retention file or database. Ignored when --retention=none.
    #[arg(long, default_value = "/tmp/opendax.dax")]
    retention_path: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let start_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before the Unix epoch")?
        .as_secs();

    let mut server = match args.retention {
        RetentionBackend::None => TagServer::new(start_time),
        RetentionBackend::FlatFile => {
            let store = FlatFileStore::open(&args.retention_path)
                .context("opening flat-file retention store")?;
            TagServer::with_retention(start_time, Box::new(store) as Box<dyn RetentionStore>)
        }
        RetentionBackend::Sqlite => {
            let store =
                SqliteStore::open(&args.retention_path).context("opening SQLite retention store")?;
            TagServer::with_retention(start_time, Box::new(store) as Box<dyn RetentionStore>)
        }
    };

    if args.retention != RetentionBackend::None {
        server
            .retention_load()
            .context("loading retained tags and types")?;
    }

    let config = ListenConfig {
        tcp_addr: args.tcp_addr,
        #[cfg(unix)]
        unix_path: args.unix_socket.clone(),
        #[cfg(not(unix))]
        unix_path: None,
    };

    log::info!("opendaxd starting");
    if let Some(addr) = config.tcp_addr {
        log::info!("listening on tcp://{addr}");
    }
    #[cfg(unix)]
    if let Some(path) = &config.unix_path {
        log::info!("listening on unix://{}", path.display());
    }

    let dispatcher = Dispatcher::new(server);
    let mut runtime = Runtime::new(dispatcher, config).context("binding listeners")?;

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = running.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received");
        handler_flag.store(false, Ordering::SeqCst);
    })
    .context("installing signal handler")?;

    runtime
        .run(|| !running.load(Ordering::SeqCst))
        .context("connection loop")?;

    log::info!("opendaxd stopped");
    Ok(())
}

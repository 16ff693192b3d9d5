#![feature(type_alias_impl_trait)]
#![feature(impl_trait_in_assoc_type)]

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::Parser;
use containerd_snapshots::server;
use log::{error, info, warn};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;

mod cache;
mod config;
mod error;
mod fs;
mod remote;
mod snapshotter;
mod stargz;
mod store;
mod task;
#[cfg(test)]
mod testutil;

use config::Config;
use error::SnapshotError;
use fs::{FileSystem, StargzFs};
use snapshotter::RemoteSnapshotter;

#[derive(Parser, Debug)]
struct Args {
    /// Root directory where snapshotter state is stored.
    root: PathBuf,

    /// Unix socket to listen on.
    socket: String,

    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
pub async fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load configuration {path:?}: {e}");
                process::exit(1);
            }
        },
        None => Config::default(),
    };

    let snapshotter = match build_snapshotter(&args.root, &config) {
        Ok(snapshotter) => snapshotter,
        Err(e) => {
            error!("failed to configure snapshotter: {e}");
            process::exit(1);
        }
    };

    let listener = match listen_on(&args.socket) {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to listen on {}: {e}", args.socket);
            process::exit(1);
        }
    };

    info!("snapshotter listening on {}", args.socket);
    if let Err(e) = Server::builder()
        .add_service(server(Arc::new(snapshotter)))
        .serve_with_incoming(UnixListenerStream::new(listener))
        .await
    {
        error!("snapshotter server failed: {e:?}");
        process::exit(1);
    }
}

/// Wires the filesystem plugin chain and the snapshotter together.
/// Snapshot state (metadata.db, snapshots/) lives at the root; the
/// chunk caches live under `<root>/stargz`.
fn build_snapshotter(root: &Path, config: &Config) -> error::Result<RemoteSnapshotter> {
    let stargz: Arc<dyn FileSystem> = Arc::new(StargzFs::new(&root.join("stargz"), config)?);

    let mut available: HashMap<&str, Arc<dyn FileSystem>> = HashMap::new();
    available.insert("stargz", stargz);

    let ids: Vec<String> = if config.filesystems.is_empty() {
        vec!["stargz".to_string()]
    } else {
        config.filesystems.clone()
    };
    let mut chain = Vec::new();
    for (priority, id) in ids.iter().enumerate() {
        let plugin = available.get(id.as_str()).ok_or_else(|| {
            SnapshotError::InvalidArgument(format!("required filesystem {id:?} not found"))
        })?;
        info!("registering filesystem plugin {id:?} with priority {priority}");
        chain.push(Arc::clone(plugin));
    }

    RemoteSnapshotter::new(root, chain, false)
}

/// Binds the listening socket. A crashed instance can leave its socket
/// file behind; when the address is taken, unlink it and claim it again.
fn listen_on(path: &str) -> io::Result<UnixListener> {
    match UnixListener::bind(path) {
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            warn!("socket {path} is already present, replacing it");
            std::fs::remove_file(path)?;
            UnixListener::bind(path)
        }
        result => result,
    }
}

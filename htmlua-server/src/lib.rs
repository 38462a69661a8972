#![warn(clippy::pedantic)]

pub mod health;
pub mod worker;

use std::{net::SocketAddr, sync::Arc, sync::mpsc::Sender, thread::JoinHandle};

use anyhow::{Result, anyhow};
use htmlua_dispatch::{Config, SessionStore};
use tracing::info;

use crate::{health::handle_admin, worker::Worker};

/// Handles to a started worker and its admin listener.
pub struct RunningServer {
    pub addr: SocketAddr,
    pub admin_addr: SocketAddr,
    handles: Vec<JoinHandle<()>>,
    stoppers: Vec<Sender<()>>,
}

impl RunningServer {
    /// Blocks until both listeners exit.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }

    pub fn stop(self) {
        for stop in &self.stoppers {
            let _ = stop.send(());
        }
        self.join();
    }
}

/// Binds the worker and admin listeners and starts serving in the background.
pub fn start(config: Config) -> Result<RunningServer> {
    config.validate()?;
    let config = Arc::new(config);
    let sessions = SessionStore::from_config(&config.worker);

    let bind = format!("{}:{}", config.server.host, config.server.port);
    let worker = Worker::new(config.clone(), sessions);
    let server = rouille::Server::new(&bind, move |request| worker.handle(request))
        .map_err(|e| anyhow!("Failed to bind worker listener {bind}: {e}"))?
        .pool_size(config.server.workers.max(1));
    let addr = server.server_addr();

    let admin_bind = format!("{}:{}", config.server.host, config.server.admin_port);
    let document_root = config.paths.document_root.clone();
    let admin = rouille::Server::new(&admin_bind, move |request| handle_admin(request, &document_root))
        .map_err(|e| anyhow!("Failed to bind admin listener {admin_bind}: {e}"))?
        .pool_size(1);
    let admin_addr = admin.server_addr();

    info!(
        %addr,
        %admin_addr,
        document_root = %config.paths.document_root.display(),
        workers = config.server.workers,
        debug = config.worker.debug,
        "htmlua worker listening"
    );

    let (handle, stop) = server.stoppable();
    let (admin_handle, admin_stop) = admin.stoppable();
    Ok(RunningServer {
        addr,
        admin_addr,
        handles: vec![handle, admin_handle],
        stoppers: vec![stop, admin_stop],
    })
}

pub fn run(config: Config) -> Result<()> {
    start(config)?.join();
    Ok(())
}

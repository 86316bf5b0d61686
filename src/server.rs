//! TCP accept loop binding admission to session spawn, plus sweeper
//! startup.
//!
//! Grounded on the teacher's `socket/server.rs::accept_loop` shape: bind,
//! then `loop { listener.accept().await ... tokio::spawn(...) }`, logging
//! and continuing past individual accept errors rather than tearing down
//! the whole server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::admission;
use crate::config::Config;
use crate::directory::Directory;
use crate::history::{PrivateHistory, PublicHistory};
use crate::session::{self, SessionContext};
use crate::sweeper;

/// Bind `config.port`, start the inactivity sweeper, and run the accept
/// loop until the process is terminated. Never returns under normal
/// operation.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn run(config: Config) -> Result<()> {
    let directory = Arc::new(Directory::new());
    let ctx = Arc::new(SessionContext {
        directory: Arc::clone(&directory),
        public_history: Arc::new(PublicHistory::new(config.public_history_path())),
        private_history: Arc::new(PrivateHistory::new(config.private_history_dir())),
    });

    let _sweeper = sweeper::spawn(
        Arc::clone(&directory),
        Duration::from_secs(config.sweep_interval_secs),
        Duration::from_secs(config.inactivity_threshold_secs),
    );

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding to port {}", config.port))?;
    log::info!("yappuchino listening on port {}", config.port);

    accept_loop(listener, ctx, directory).await;
    Ok(())
}

async fn accept_loop(listener: TcpListener, ctx: Arc<SessionContext>, directory: Arc<Directory>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("accept error: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let ctx = Arc::clone(&ctx);
        let directory = Arc::clone(&directory);
        tokio::spawn(async move {
            match admission::handle_connection(stream, directory).await {
                Ok(Some((ws_stream, name))) => {
                    log::info!("{name} connected from {peer_addr}");
                    session::spawn(ctx, ws_stream, name, peer_addr.to_string());
                }
                Ok(None) => {
                    // Pre-flight request or rejected admission; already
                    // fully handled on the wire.
                }
                Err(e) => log::warn!("connection from {peer_addr} failed during admission: {e}"),
            }
        });
    }
}

use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::connection::handle_connection;
use crate::context::Context;

/// How long shutdown waits for in-flight handlers to finish before
/// aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Accept connections until the shutdown signal fires, one handler task per
/// connection. A handler panic is absorbed by the join set and never takes
/// the accept loop down.
pub async fn run(
    listener: TcpListener,
    ctx: Context,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("client accepted: {}", addr);
                    handlers.spawn(handle_connection(stream, ctx.clone()));
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                }
            },
            _ = shutdown.recv() => break,
        }
    }

    // Stop accepting (the listener drops with this function), notify every
    // connection, then drain with a bounded grace period.
    info!("shutting down, draining {} handler(s)", handlers.len());
    ctx.registry.close_all().await;

    let drain = async {
        while handlers.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("drain timed out after {:?}, aborting remaining handlers", SHUTDOWN_GRACE);
        handlers.shutdown().await;
    }

    Ok(())
}

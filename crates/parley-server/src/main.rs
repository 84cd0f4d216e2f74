use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::info;

use parley_gateway::{Context, DevicePolicy, listener};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug".into()),
        )
        .init();

    // Config
    let host = std::env::var("PARLEY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("PARLEY_PORT")
        .unwrap_or_else(|_| "5001".into())
        .parse()?;
    let db_path = std::env::var("PARLEY_DB_PATH").unwrap_or_else(|_| "parley.db".into());
    let policy = match std::env::var("PARLEY_DEVICE_POLICY").as_deref() {
        Ok("single") => DevicePolicy::Single,
        _ => DevicePolicy::Multi,
    };

    // Init database and shared services
    let db = Arc::new(parley_db::Database::open(&PathBuf::from(&db_path))?);
    let ctx = Context::new(db, policy);

    let socket = TcpListener::bind(format!("{host}:{port}")).await?;
    info!("Parley server listening on {}:{} ({:?} device policy)", host, port, policy);

    // Ctrl-c triggers the coordinated shutdown in the listener
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(());
        }
    });

    listener::run(socket, ctx, shutdown_rx).await
}

use std::sync::Arc;

use clap::Parser;
use libvirt_aws::config::{Config, LogFormat};
use libvirt_aws::ec2::volumes::reconcile_attachments;
use libvirt_aws::libvirt::{Connection, LibvirtDriver};
use libvirt_aws::state::AppState;
use libvirt_aws::{db, dispatch};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(config.log_format);

    let db = db::connect(&config.database).await?;
    let libvirt: Arc<dyn LibvirtDriver> = Arc::new(Connection::open(&config.libvirt_uri)?);
    let addr = config.socket_addr();
    let state = AppState::new(db, libvirt, config);
    reconcile_attachments(&state).await?;

    let router = dispatch::router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    tracing::info!("shutting down");
}

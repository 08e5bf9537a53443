use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::info;

use courier_server::hub::{Hub, HubEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_server=debug,courier_net=info".into()),
        )
        .init();

    // Port resolution: positional argument beats COURIER_PORT beats 8888.
    let port: u16 = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid port argument: {arg:?}"))?,
        None => std::env::var("COURIER_PORT")
            .unwrap_or_else(|_| "8888".into())
            .parse()?,
    };
    let host = std::env::var("COURIER_HOST").unwrap_or_else(|_| "0.0.0.0".into());

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("courier hub listening on {addr}");

    let hub = Hub::new();

    // Surface lifecycle events in the log.
    let mut events = hub.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                HubEvent::PeerJoined { id } => info!("event: peer {id} joined"),
                HubEvent::PeerLeft { id, name } => {
                    info!("event: peer {id} ({name:?}) left")
                }
                HubEvent::TransferStarted {
                    id,
                    sender,
                    target,
                    file_name,
                    size,
                } => info!(
                    "event: transfer {id} proposed: {file_name:?} ({size} bytes) {sender} -> {target}"
                ),
                HubEvent::TransferEnded { id, success, reason } => {
                    info!("event: transfer {id} ended (success={success}, {reason})")
                }
            }
        }
    });

    tokio::select! {
        _ = hub.run(listener) => {}
        _ = shutdown_signal() => {}
    }

    hub.shutdown().await;
    info!("hub drained, exiting");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received Ctrl+C, shutting down...");
    }
}

use scribblechat::{AppState, Config};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("scribblechat=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env()?;
    let addr = config.addr;
    info!(
        %addr,
        max_payload_bytes = config.max_payload_bytes,
        outbound_buffer = config.outbound_buffer,
        max_connections = config.max_connections,
        "starting relay"
    );

    let app = scribblechat::app(AppState::new(config));
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutting down");
    }
}

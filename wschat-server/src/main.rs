use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wschat_server::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match ServerConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let server = match RelayServer::from_config(&config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to set up relay: {}", e);
            std::process::exit(1);
        }
    };

    let listener = match TcpListener::bind(&config.listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", config.listen_addr, e);
            std::process::exit(1);
        }
    };

    let scheme = if server.is_tls() { "wss" } else { "ws" };
    info!(
        "wschat relay listening on {}://{}/{}",
        scheme, config.listen_addr, config.endpoint
    );

    server.serve(listener).await;
}

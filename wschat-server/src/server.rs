use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_native_tls::TlsAcceptor;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{error, info, warn};
use wschat_core::Result;

use crate::config::ServerConfig;
use crate::connection::{handle_connection, ConnectionSettings};
use crate::registry::RelayRegistry;
use crate::tls;

/// Accepts sockets, upgrades them on the configured path and hands each
/// one to its own connection task.
pub struct RelayServer {
    registry: Arc<RelayRegistry>,
    settings: Arc<ConnectionSettings>,
    endpoint: Arc<str>,
    tls: Option<TlsAcceptor>,
}

impl RelayServer {
    pub fn new(registry: Arc<RelayRegistry>, settings: ConnectionSettings, endpoint: &str) -> Self {
        Self {
            registry,
            settings: Arc::new(settings),
            endpoint: Arc::from(endpoint.trim_matches('/')),
            tls: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Build a server from configuration, loading TLS material if given.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let registry = Arc::new(RelayRegistry::with_max_pending(config.max_pending));
        let server = Self::new(registry, config.connection_settings(), &config.endpoint);

        match config.tls_files() {
            Some((cert, key)) => Ok(server.with_tls(tls::load_acceptor(cert, key)?)),
            None => {
                warn!("No TLS certificate configured, serving plain WebSocket");
                Ok(server)
            }
        }
    }

    pub fn registry(&self) -> &Arc<RelayRegistry> {
        &self.registry
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Accept connections until the listener fails permanently.
    pub async fn serve(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    info!("New connection from {}", peer_addr);

                    let registry = self.registry.clone();
                    let settings = self.settings.clone();
                    let endpoint = self.endpoint.clone();
                    let tls = self.tls.clone();
                    tokio::spawn(async move {
                        match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    upgrade(tls_stream, peer_addr, endpoint, registry, settings)
                                        .await
                                }
                                Err(e) => warn!("TLS handshake failed for {}: {}", peer_addr, e),
                            },
                            None => upgrade(stream, peer_addr, endpoint, registry, settings).await,
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// Complete the WebSocket upgrade, refusing any path but `/<endpoint>`.
async fn upgrade<S>(
    stream: S,
    peer_addr: SocketAddr,
    endpoint: Arc<str>,
    registry: Arc<RelayRegistry>,
    settings: Arc<ConnectionSettings>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let check_path = |request: &Request, response: Response| {
        let path = request.uri().path();
        if path.trim_start_matches('/') == &*endpoint {
            Ok(response)
        } else {
            warn!("Rejecting upgrade from {} on unknown path {}", peer_addr, path);
            let mut rejection = ErrorResponse::new(Some("not found".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };

    match accept_hdr_async(stream, check_path).await {
        Ok(ws_stream) => handle_connection(ws_stream, registry, settings).await,
        Err(e) => {
            warn!("WebSocket handshake failed for {}: {}", peer_addr, e);
        }
    }
}

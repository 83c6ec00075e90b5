use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};
use wschat_core::envelope::pong_frame;
use wschat_core::identity::ID_LENGTH;
use wschat_core::{Envelope, Error, Handshake, Result};

use crate::registry::{ConnectionId, RelayRegistry, RouteOutcome};

pub const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(3);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection policy shared by every handler.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Silence longer than this evicts the connection
    pub liveness_window: Duration,
    /// How long a fresh socket may take to send its handshake
    pub handshake_timeout: Duration,
    /// When set, only these ids may register
    pub allowed_ids: Option<HashSet<String>>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            liveness_window: DEFAULT_LIVENESS_WINDOW,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            allowed_ids: None,
        }
    }
}

type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;

/// Handle a single WebSocket connection from handshake to teardown
pub async fn handle_connection<S>(
    ws_stream: WebSocketStream<S>,
    registry: Arc<RelayRegistry>,
    settings: Arc<ConnectionSettings>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // The first frame decides who this connection is
    let user_id = match wait_for_handshake(&mut ws_receiver, &settings).await {
        Ok(id) => id,
        Err(e) => {
            warn!("Rejecting connection: {}", e);
            let _ = ws_sender.send(policy_close()).await;
            let _ = ws_sender.close().await;
            return;
        }
    };

    let (handle, mut rx) = registry.open_connection();
    let connection = handle.id();
    let pending = registry.register(&user_id, handle);
    info!("User connected: {} (connection {})", user_id, connection);

    // Queued messages go out before anything routed after registration
    let mut undelivered: Vec<Envelope> = Vec::new();
    if !pending.is_empty() {
        info!(
            "Delivering {} pending messages to {}",
            pending.len(),
            user_id
        );
    }
    let mut pending = pending.into_iter();
    let mut flushed = true;
    while let Some(envelope) = pending.next() {
        if let Err(e) = write_envelope(&mut ws_sender, &envelope).await {
            warn!("Failed to flush pending messages to {}: {}", user_id, e);
            undelivered.push(envelope);
            undelivered.extend(pending.by_ref());
            flushed = false;
            break;
        }
    }

    if flushed {
        let (heartbeat_tx, heartbeat_rx) = watch::channel(());
        let (evict_tx, mut evict_rx) = oneshot::channel();
        let watcher = spawn_liveness_watcher(
            settings.liveness_window,
            user_id.clone(),
            connection,
            registry.clone(),
            heartbeat_rx,
            evict_tx,
        );

        loop {
            tokio::select! {
                // Branch 1: Read from WebSocket
                res = ws_receiver.next() => {
                    match res {
                        Some(Ok(Message::Text(text))) => {
                            handle_message(&text, &user_id, &registry);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            heartbeat_tx.send_replace(());
                            if let Err(e) = ws_sender.send(pong_frame(data)).await {
                                warn!("Failed to answer ping from {}: {}", user_id, e);
                                break;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            heartbeat_tx.send_replace(());
                        }
                        Some(Ok(Message::Binary(_))) => {
                            debug!("Ignoring binary frame from {} after handshake", user_id);
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("User {} sent close frame", user_id);
                            break;
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            error!("WebSocket error for user {}: {}", user_id, e);
                            break;
                        }
                        None => {
                            info!("WebSocket stream ended for user {}", user_id);
                            break;
                        }
                    }
                }
                // Branch 2: Messages routed to this connection
                outbound = rx.recv() => {
                    match outbound {
                        Some(envelope) => {
                            if let Err(e) = write_envelope(&mut ws_sender, &envelope).await {
                                warn!("Failed to deliver message to {}: {}", user_id, e);
                                undelivered.push(envelope);
                                break;
                            }
                        }
                        None => {
                            info!("Connection {} for {} superseded by a newer handshake", connection, user_id);
                            break;
                        }
                    }
                }
                // Branch 3: Liveness watcher gave up on this connection
                _ = &mut evict_rx => {
                    info!("Evicting {} after missed liveness window", user_id);
                    break;
                }
            }
        }

        watcher.abort();
    }

    // Cleanup: nothing accepted for this connection is dropped on the floor.
    // Routes racing the close see a dead channel and queue instead.
    rx.close();
    while let Ok(envelope) = rx.try_recv() {
        undelivered.push(envelope);
    }
    registry.retire(&user_id, connection, undelivered);
    let _ = ws_sender.close().await;

    info!("User disconnected: {} (connection {})", user_id, connection);
}

/// Wait for the binary handshake frame and validate the claimed id
async fn wait_for_handshake<S>(
    receiver: &mut SplitStream<WebSocketStream<S>>,
    settings: &ConnectionSettings,
) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = match timeout(settings.handshake_timeout, receiver.next()).await {
        Ok(Some(Ok(frame))) => frame,
        Ok(Some(Err(e))) => {
            return Err(Error::ProtocolViolation(format!(
                "read failed before handshake: {}",
                e
            )))
        }
        Ok(None) => {
            return Err(Error::ProtocolViolation(
                "connection closed before handshake".to_string(),
            ))
        }
        Err(_) => {
            return Err(Error::ProtocolViolation(format!(
                "no handshake within {:?}",
                settings.handshake_timeout
            )))
        }
    };

    let handshake = Handshake::from_frame(&frame)?;
    if let Some(allowed) = &settings.allowed_ids {
        if !allowed.contains(&handshake.id) {
            return Err(Error::ProtocolViolation(format!(
                "id {} is not on the allowlist",
                handshake.id
            )));
        }
    }
    Ok(handshake.id)
}

/// Evicts the connection once no ping or pong arrives within `window`.
///
/// Each heartbeat restarts the wait. On expiry the watcher deregisters the
/// connection itself, then signals the handler to stop.
fn spawn_liveness_watcher(
    window: Duration,
    user_id: String,
    connection: ConnectionId,
    registry: Arc<RelayRegistry>,
    mut heartbeat: watch::Receiver<()>,
    evict: oneshot::Sender<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match timeout(window, heartbeat.changed()).await {
                Ok(Ok(())) => continue,
                // Handler already finished
                Ok(Err(_)) => return,
                Err(_) => {
                    warn!("No ping from {} within {:?}", user_id, window);
                    registry.deregister(&user_id, connection);
                    let _ = evict.send(());
                    return;
                }
            }
        }
    })
}

/// Handle a text frame from a connected client
pub fn handle_message(text: &str, sender_id: &str, registry: &RelayRegistry) -> Option<RouteOutcome> {
    let mut envelope = match Envelope::from_json(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Failed to parse message from {}: {}", sender_id, e);
            return None;
        }
    };

    if envelope.target_id.chars().count() != ID_LENGTH {
        warn!(
            "Dropping message from {} for malformed target id {:?}",
            sender_id, envelope.target_id
        );
        return None;
    }

    // Enforce sender identity to prevent spoofing
    if envelope.from_id != sender_id {
        debug!(
            "Overwriting claimed sender {:?} with {}",
            envelope.from_id, sender_id
        );
        envelope.from_id = sender_id.to_string();
    }

    let target = envelope.target_id.clone();
    let outcome = registry.route(envelope);
    debug!("Message from {} to {}: {:?}", sender_id, target, outcome);
    Some(outcome)
}

async fn write_envelope<S>(sender: &mut WsSink<S>, envelope: &Envelope) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = envelope.to_frame()?;
    sender
        .send(frame)
        .await
        .map_err(|e| Error::WriteError(e.to_string()))
}

fn policy_close() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Policy,
        reason: "handshake rejected".into(),
    }))
}

//! Client side of the relay link: dial, handshake, keep-alive and reconnect.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::envelope::{close_frame, ping_frame, Envelope, Handshake};
use crate::error::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
}

/// A live transport: the write half plus the task draining the read half.
struct Link {
    sink: SplitSink<WsStream, Message>,
    listener: JoinHandle<()>,
}

/// Connection state, shared with listener tasks. Only the listener of the
/// link numbered `generation` may report that link as lost.
struct SharedState {
    tx: watch::Sender<ConnectionState>,
    generation: AtomicU64,
}

/// What a listener needs to report its own link going down.
struct LinkWatch {
    state: Arc<SharedState>,
    generation: u64,
    lost: Arc<AtomicBool>,
}

impl LinkWatch {
    fn link_lost(&self) {
        self.state.tx.send_if_modified(|state| {
            self.lost.store(true, Ordering::Release);
            let current = self.state.generation.load(Ordering::Acquire) == self.generation;
            if current && *state != ConnectionState::Disconnected {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
    }
}

/// Connection to the relay for one local identity.
///
/// Inbound message frames are decoded and pushed to the receiver returned by
/// [`RelayClient::new`]. All background tasks stop once
/// [`RelayClient::disconnect`] is called.
pub struct RelayClient {
    config: ClientConfig,
    local_id: String,
    link: TokioMutex<Option<Link>>,
    state: Arc<SharedState>,
    inbound_tx: mpsc::UnboundedSender<Envelope>,
    keepalive_running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl RelayClient {
    pub fn new(
        config: ClientConfig,
        local_id: impl Into<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Envelope>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);

        let client = Arc::new(Self {
            config,
            local_id: local_id.into(),
            link: TokioMutex::new(None),
            state: Arc::new(SharedState {
                tx: state_tx,
                generation: AtomicU64::new(0),
            }),
            inbound_tx,
            keepalive_running: AtomicBool::new(false),
            shutdown_tx,
        });
        (client, inbound_rx)
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.tx.send_replace(state);
    }

    /// Dial the relay and announce the local id.
    ///
    /// On failure no listener task is left running.
    pub async fn connect(&self) -> Result<()> {
        // A fresh connect re-arms a client that was previously disconnected.
        self.shutdown_tx.send_replace(false);
        self.establish().await
    }

    async fn establish(&self) -> Result<()> {
        let url = self.config.url();
        self.set_state(ConnectionState::Connecting);
        info!(url = %url, "Connecting to relay");

        let connector = match self.connector() {
            Ok(connector) => connector,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        let dial = connect_async_tls_with_config(url.as_str(), None, false, Some(connector));
        let ws_stream = match timeout(self.config.dial_timeout(), dial).await {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(Error::DialError(e.to_string()));
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(Error::DialError(format!(
                    "timed out after {:?}",
                    self.config.dial_timeout()
                )));
            }
        };

        let generation = self.state.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let lost = Arc::new(AtomicBool::new(false));
        let (mut sink, stream) = ws_stream.split();
        let listener = tokio::spawn(listen(
            stream,
            self.inbound_tx.clone(),
            self.shutdown_tx.subscribe(),
            LinkWatch {
                state: self.state.clone(),
                generation,
                lost: lost.clone(),
            },
        ));

        self.set_state(ConnectionState::Handshaking);
        let sent = match Handshake::new(self.local_id.as_str()).to_frame() {
            Ok(frame) => sink
                .send(frame)
                .await
                .map_err(|e| Error::HandshakeWriteError(e.to_string())),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            listener.abort();
            self.set_state(ConnectionState::Disconnected);
            return Err(e);
        }

        let mut guard = self.link.lock().await;
        if *self.shutdown_tx.borrow() {
            // disconnect() ran while the dial was in flight
            drop(guard);
            let _ = ignore_closed(sink.send(close_frame()).await);
            let _ = ignore_closed(sink.close().await);
            listener.abort();
            self.set_state(ConnectionState::Disconnected);
            info!("Shutdown requested during connect, dropped new link");
            return Err(Error::NotConnected);
        }

        let previous = guard.replace(Link { sink, listener });
        // Set under the link lock so a concurrent disconnect() has the last word.
        let live = self.state.tx.send_if_modified(|state| {
            if lost.load(Ordering::Acquire) {
                false
            } else {
                *state = ConnectionState::Connected;
                true
            }
        });
        drop(guard);
        if let Some(old) = previous {
            old.listener.abort();
        }

        if live {
            info!("Connected to relay");
        } else {
            warn!("Relay dropped the link during handshake");
        }
        Ok(())
    }

    fn connector(&self) -> Result<Connector> {
        if !self.config.tls {
            return Ok(Connector::Plain);
        }
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(self.config.accept_invalid_certs)
            .danger_accept_invalid_hostnames(self.config.accept_invalid_certs)
            .build()
            .map_err(|e| Error::DialError(format!("TLS setup failed: {}", e)))?;
        Ok(Connector::NativeTls(tls))
    }

    async fn send_frame(&self, frame: Message) -> Result<()> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(Error::NotConnected)?;
        link.sink
            .send(frame)
            .await
            .map_err(|e| Error::WriteError(e.to_string()))
    }

    /// Send one message frame to `target_id`. No retry happens here; see
    /// [`crate::retry`].
    pub async fn send_message(&self, target_id: &str, ciphertext: Vec<u8>) -> Result<Envelope> {
        let envelope = Envelope::new(target_id, ciphertext, self.local_id.as_str());
        self.send_envelope(&envelope).await?;
        Ok(envelope)
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        let frame = envelope.to_frame()?;
        self.send_frame(frame).await?;
        debug!(target = %envelope.target_id, bytes = envelope.ciphertext.len(), "Message sent");
        Ok(())
    }

    /// Start the ping loop, reconnecting whenever a ping cannot be written.
    ///
    /// Returns `None` if a keep-alive loop is already running for this client.
    pub fn keep_alive(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self
            .keepalive_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Keep-alive already running");
            return None;
        }

        let client = Arc::clone(self);
        Some(tokio::spawn(async move {
            client.run_keep_alive().await;
            client.keepalive_running.store(false, Ordering::Release);
            debug!("Keep-alive stopped");
        }))
    }

    async fn run_keep_alive(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.ping_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }

            match self.send_frame(ping_frame()).await {
                Ok(()) => continue,
                Err(e) => warn!(error = %e, "Keep-alive ping failed, link considered dead"),
            }

            self.set_state(ConnectionState::Disconnected);
            if !self.reconnect(&mut shutdown).await {
                break;
            }
            ticker.reset();
        }
    }

    /// Retry [`Self::establish`] with a fixed backoff. Returns `false` if
    /// shutdown was requested first.
    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            if *shutdown.borrow() {
                return false;
            }
            match self.establish().await {
                Ok(()) => {
                    info!("Reconnected to relay");
                    return true;
                }
                Err(_) if *shutdown.borrow() => return false,
                Err(e) => {
                    warn!(
                        error = %e,
                        backoff = ?self.config.reconnect_backoff(),
                        "Reconnect failed"
                    );
                    tokio::select! {
                        _ = wait_for_shutdown(shutdown) => return false,
                        _ = sleep(self.config.reconnect_backoff()) => {}
                    }
                }
            }
        }
    }

    /// Send a normal-closure frame and close the transport. Background tasks
    /// are stopped; errors are reported, not retried.
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting from relay");
        self.shutdown_tx.send_replace(true);
        let link = {
            let mut guard = self.link.lock().await;
            self.state.generation.fetch_add(1, Ordering::AcqRel);
            self.set_state(ConnectionState::Disconnected);
            guard.take()
        };

        let Some(mut link) = link else {
            return Ok(());
        };
        let sent = ignore_closed(link.sink.send(close_frame()).await);
        let closed = ignore_closed(link.sink.close().await);
        link.listener.abort();

        sent.and(closed).map_err(|e| {
            warn!(error = %e, "Failed to close relay connection cleanly");
            Error::WriteError(e.to_string())
        })
    }
}

fn ignore_closed(result: std::result::Result<(), WsError>) -> std::result::Result<(), WsError> {
    match result {
        Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
        other => other,
    }
}

/// Resolves once shutdown is requested or the client is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Drain the read half, forwarding message frames. Other frame types are of
/// no interest at this layer.
async fn listen(
    mut stream: SplitStream<WsStream>,
    inbound: mpsc::UnboundedSender<Envelope>,
    mut shutdown: watch::Receiver<bool>,
    link: LinkWatch,
) {
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match Envelope::from_json(&text) {
                    Ok(envelope) => {
                        if inbound.send(envelope).is_err() {
                            debug!("Inbound receiver dropped, stopping listener");
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Dropping unreadable message frame"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    info!("Relay closed the connection");
                    link.link_lost();
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "Failed to read from relay");
                    link.link_lost();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    const LOCAL_ID: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn test_config(port: u16) -> ClientConfig {
        let mut config = ClientConfig::new(format!("127.0.0.1:{}", port));
        config.tls = false;
        config.ping_interval_ms = 50;
        config.reconnect_backoff_ms = 50;
        config.dial_timeout_ms = 1_000;
        config
    }

    async fn bind() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        accept_async(stream).await.unwrap()
    }

    async fn next_frame(ws: &mut WebSocketStream<TcpStream>) -> Message {
        timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("Timeout waiting for frame")
            .expect("Stream closed")
            .expect("Read error")
    }

    #[tokio::test]
    async fn test_connect_sends_handshake_first() {
        let (listener, port) = bind().await;
        let (client, _inbound) = RelayClient::new(test_config(port), LOCAL_ID);

        let (connected, mut server) = tokio::join!(client.connect(), accept(&listener));
        connected.unwrap();
        assert!(client.is_connected());

        let frame = next_frame(&mut server).await;
        let handshake = Handshake::from_frame(&frame).unwrap();
        assert_eq!(handshake.id, LOCAL_ID);
    }

    #[tokio::test]
    async fn test_dial_error_leaves_client_disconnected() {
        let (listener, port) = bind().await;
        drop(listener);

        let (client, _inbound) = RelayClient::new(test_config(port), LOCAL_ID);
        let result = client.connect().await;
        assert!(matches!(result, Err(Error::DialError(_))));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.link.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let (client, _inbound) = RelayClient::new(test_config(1), LOCAL_ID);
        let result = client.send_message("target", vec![1]).await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_text_frames_reach_inbound_channel() {
        let (listener, port) = bind().await;
        let (client, mut inbound) = RelayClient::new(test_config(port), LOCAL_ID);

        let (connected, mut server) = tokio::join!(client.connect(), accept(&listener));
        connected.unwrap();
        let _handshake = next_frame(&mut server).await;

        let envelope = Envelope::new(LOCAL_ID, vec![9, 9, 9], "b".repeat(64));
        server.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
        server.send(Message::Text("not json".to_string())).await.unwrap();
        server.send(envelope.to_frame().unwrap()).await.unwrap();

        let received = timeout(Duration::from_secs(5), inbound.recv())
            .await
            .expect("Timeout waiting for inbound")
            .expect("Inbound closed");
        assert_eq!(received, envelope);
    }

    #[tokio::test]
    async fn test_send_message_writes_envelope() {
        let (listener, port) = bind().await;
        let (client, _inbound) = RelayClient::new(test_config(port), LOCAL_ID);

        let (connected, mut server) = tokio::join!(client.connect(), accept(&listener));
        connected.unwrap();
        let _handshake = next_frame(&mut server).await;

        let sent = client.send_message(&"b".repeat(64), vec![4, 5]).await.unwrap();
        match next_frame(&mut server).await {
            Message::Text(text) => {
                let parsed = Envelope::from_json(&text).unwrap();
                assert_eq!(parsed, sent);
                assert_eq!(parsed.from_id, LOCAL_ID);
            }
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_keep_alive_pings_and_single_loop() {
        let (listener, port) = bind().await;
        let (client, _inbound) = RelayClient::new(test_config(port), LOCAL_ID);

        let (connected, mut server) = tokio::join!(client.connect(), accept(&listener));
        connected.unwrap();
        let _handshake = next_frame(&mut server).await;

        let handle = client.keep_alive().expect("first keep-alive starts");
        assert!(client.keep_alive().is_none());

        match next_frame(&mut server).await {
            Message::Ping(payload) => assert_eq!(payload, b"ping"),
            other => panic!("Expected ping, got {:?}", other),
        }

        client.disconnect().await.unwrap();
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("keep-alive should stop after disconnect")
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconnects_after_relay_drops_link() {
        let (listener, port) = bind().await;
        let (client, _inbound) = RelayClient::new(test_config(port), LOCAL_ID);

        let (connected, mut first) = tokio::join!(client.connect(), accept(&listener));
        connected.unwrap();
        let _handshake = next_frame(&mut first).await;
        let _keepalive = client.keep_alive();

        // Relay goes away without a closing handshake.
        drop(first);

        let mut second = timeout(Duration::from_secs(5), accept(&listener))
            .await
            .expect("client should redial");
        let frame = next_frame(&mut second).await;
        assert_eq!(Handshake::from_frame(&frame).unwrap().id, LOCAL_ID);

        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_state_drops_when_relay_closes_link() {
        let (listener, port) = bind().await;
        let (client, _inbound) = RelayClient::new(test_config(port), LOCAL_ID);
        let mut states = client.subscribe_state();

        let (connected, mut server) = tokio::join!(client.connect(), accept(&listener));
        connected.unwrap();
        let _handshake = next_frame(&mut server).await;
        assert!(client.is_connected());

        // No keep-alive: the listener alone has to notice.
        server.close(None).await.unwrap();
        timeout(
            Duration::from_secs(5),
            states.wait_for(|state| *state == ConnectionState::Disconnected),
        )
        .await
        .expect("state should drop to disconnected")
        .unwrap();
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_state_drops_when_transport_vanishes() {
        let (listener, port) = bind().await;
        let (client, _inbound) = RelayClient::new(test_config(port), LOCAL_ID);
        let mut states = client.subscribe_state();

        let (connected, mut server) = tokio::join!(client.connect(), accept(&listener));
        connected.unwrap();
        let _handshake = next_frame(&mut server).await;

        drop(server);
        timeout(
            Duration::from_secs(5),
            states.wait_for(|state| *state == ConnectionState::Disconnected),
        )
        .await
        .expect("state should drop to disconnected")
        .unwrap();
    }

    #[tokio::test]
    async fn test_old_link_closing_keeps_newer_link_connected() {
        let (listener, port) = bind().await;
        let (client, _inbound) = RelayClient::new(test_config(port), LOCAL_ID);

        let (connected, mut first) = tokio::join!(client.connect(), accept(&listener));
        connected.unwrap();
        let _handshake = next_frame(&mut first).await;

        let (connected, mut second) = tokio::join!(client.connect(), accept(&listener));
        connected.unwrap();
        let _handshake = next_frame(&mut second).await;

        first.close(None).await.unwrap();
        sleep(Duration::from_millis(200)).await;
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_during_dial_drops_new_link() {
        let (listener, port) = bind().await;
        let (client, _inbound) = RelayClient::new(test_config(port), LOCAL_ID);

        let dialing = {
            let client = client.clone();
            tokio::spawn(async move { client.connect().await })
        };

        // Hold the upgrade back until shutdown has been requested.
        let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        client.disconnect().await.unwrap();
        let mut server = accept_async(stream).await.unwrap();

        let result = timeout(Duration::from_secs(5), dialing)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::NotConnected)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.link.lock().await.is_none());

        let frame = next_frame(&mut server).await;
        assert!(Handshake::from_frame(&frame).is_ok());
        assert!(matches!(next_frame(&mut server).await, Message::Close(_)));
    }

    #[tokio::test]
    async fn test_zero_ping_interval_does_not_panic_keep_alive() {
        let (listener, port) = bind().await;
        let mut config = test_config(port);
        config.ping_interval_ms = 0;
        let (client, _inbound) = RelayClient::new(config, LOCAL_ID);

        let (connected, mut server) = tokio::join!(client.connect(), accept(&listener));
        connected.unwrap();
        let _handshake = next_frame(&mut server).await;

        let handle = client.keep_alive().expect("keep-alive starts");
        assert!(matches!(next_frame(&mut server).await, Message::Ping(_)));
        client.disconnect().await.unwrap();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_sends_normal_close() {
        let (listener, port) = bind().await;
        let (client, _inbound) = RelayClient::new(test_config(port), LOCAL_ID);

        let (connected, mut server) = tokio::join!(client.connect(), accept(&listener));
        connected.unwrap();
        let _handshake = next_frame(&mut server).await;

        client.disconnect().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        match next_frame(&mut server).await {
            Message::Close(Some(frame)) => {
                assert_eq!(
                    frame.code,
                    tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Normal
                );
            }
            other => panic!("Expected close frame, got {:?}", other),
        }
    }
}

//! The netx client.
//!
//! `Client` connects over TCP, runs the connect side of the handshake and
//! keeps one dispatch task reading from the session until it closes.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, info, warn};

use netx_core::connection::{ConnectionHandler, ConnectionOptions, DEFAULT_CLOSE_GRACE};
use netx_core::endpoint::{DispatchExit, Endpoint, SessionRole, DEFAULT_TIMEOUT_MS};
use netx_core::error::{NetxError, NetxResult};
use netx_core::frame::DEFAULT_MAX_FRAME_LEN;
use netx_core::handshake::{self, PROTOCOL_VERSION};
use netx_core::{
    CipherAlgorithm, ListenerKey, PayloadCodec, Request, RequestHandler, Response, SignalKind, Uuid,
};

/// Configuration for connecting to a netx server.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Cipher algorithm; must match the server's.
    pub algorithm: CipherAlgorithm,
    /// Wait applied to awaits and requests when the caller gives none.
    pub default_timeout: Duration,
    /// Bound on establishing the TCP connection and the handshake.
    pub connect_timeout: Duration,
    pub max_frame_len: usize,
    pub close_grace: Duration,
    /// Version announced to the server after the cipher is active.
    pub protocol_version: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4590,
            algorithm: CipherAlgorithm::default(),
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            connect_timeout: Duration::from_secs(10),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            close_grace: DEFAULT_CLOSE_GRACE,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            algorithm: self.algorithm,
            max_frame_len: self.max_frame_len,
            close_grace: self.close_grace,
        }
    }
}

/// A connected netx session.
pub struct Client<C: PayloadCodec> {
    endpoint: Arc<Endpoint<C>>,
    conn: Arc<ConnectionHandler<C::Item>>,
}

impl<C: PayloadCodec> Client<C> {
    /// Connect, complete the handshake and start the dispatch task.
    pub async fn connect(config: ClientConfig, codec: C) -> NetxResult<Self> {
        let endpoint = Endpoint::new(codec, SessionRole::Client, config.default_timeout);
        Self::connect_with(config, endpoint).await
    }

    /// Connect with handlers already in place, so no early request from the
    /// server goes unanswered.
    pub async fn connect_with_handlers(
        config: ClientConfig,
        codec: C,
        handlers: Vec<Arc<dyn RequestHandler>>,
    ) -> NetxResult<Self> {
        let endpoint = Endpoint::new(codec, SessionRole::Client, config.default_timeout);
        for handler in handlers {
            endpoint.register_handler(handler).await;
        }
        Self::connect_with(config, endpoint).await
    }

    async fn connect_with(config: ClientConfig, endpoint: Endpoint<C>) -> NetxResult<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let endpoint = Arc::new(endpoint);

        let conn = time::timeout(config.connect_timeout, async {
            let stream = TcpStream::connect(&addr)
                .await
                .map_err(|e| NetxError::Transport(format!("connect to {addr} failed: {e}")))?;
            let conn = ConnectionHandler::from_tcp(stream, config.connection_options());
            handshake_connect(&conn, config.algorithm, config.protocol_version).await?;
            Ok::<_, NetxError>(conn)
        })
        .await
        .map_err(|_| NetxError::Timeout)??;

        let conn = Arc::new(conn);
        let session_id = conn.session_id();
        info!(session_id = %session_id, addr = %addr, "connected");

        let task = {
            let endpoint = endpoint.clone();
            let conn = conn.clone();
            tokio::spawn(async move {
                match endpoint.run_dispatch(&conn).await {
                    DispatchExit::PeerClosed => info!(session_id = %session_id, "server closed session"),
                    DispatchExit::LocalClose => debug!(session_id = %session_id, "dispatch stopped"),
                    DispatchExit::Failed(e) => {
                        warn!(session_id = %session_id, error = %e, "session failed")
                    }
                }
                conn.close_detached().await;
            })
        };
        conn.set_dispatch_task(task);

        Ok(Self { endpoint, conn })
    }

    /// The session id assigned by the server.
    pub fn session_id(&self) -> Uuid {
        self.conn.session_id()
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_open()
    }

    pub fn algorithm(&self) -> CipherAlgorithm {
        self.conn.options().algorithm
    }

    pub fn default_timeout(&self) -> Duration {
        self.endpoint.default_timeout()
    }

    pub fn codec(&self) -> &C {
        self.endpoint.codec()
    }

    pub async fn send(&self, value: &C::Item) -> NetxResult<()> {
        self.endpoint.send(&self.conn, value).await
    }

    /// Wait for the next typed value from the server.
    pub async fn await_next(&self, timeout: Option<Duration>) -> NetxResult<Option<C::Item>> {
        self.endpoint.await_next(&self.conn, timeout).await
    }

    pub async fn send_and_await(
        &self,
        value: &C::Item,
        timeout: Option<Duration>,
    ) -> NetxResult<Option<C::Item>> {
        self.endpoint.send_and_await(&self.conn, value, timeout).await
    }

    pub async fn request(
        &self,
        request: &Request,
        timeout: Option<Duration>,
    ) -> NetxResult<Option<Response>> {
        self.endpoint.request(&self.conn, request, timeout).await
    }

    pub async fn request_or_else<F>(
        &self,
        request: &Request,
        timeout: Option<Duration>,
        on_error: F,
    ) -> Option<Response>
    where
        F: FnOnce(Response),
    {
        self.endpoint
            .request_or_else(&self.conn, request, timeout, on_error)
            .await
    }

    pub async fn register_handler(&self, handler: Arc<dyn RequestHandler>) {
        self.endpoint.register_handler(handler).await;
    }

    pub async fn unregister_handler(&self, kind_id: u32) -> bool {
        self.endpoint.handlers().unregister(kind_id).await.is_some()
    }

    pub async fn registered_handlers(&self) -> Vec<u32> {
        self.endpoint.handlers().kind_ids().await
    }

    pub fn on_packet_received(
        &self,
        listener: impl Fn(&C::Item, Uuid) + Send + Sync + 'static,
    ) -> ListenerKey {
        self.endpoint.observers().on_packet_received(listener)
    }

    pub fn on_packet_sent(&self, listener: impl Fn(&C::Item) + Send + Sync + 'static) -> ListenerKey {
        self.endpoint.observers().on_packet_sent(listener)
    }

    pub fn remove_listener(&self, key: ListenerKey) -> bool {
        self.endpoint.observers().remove(key)
    }

    pub fn packet_received_listeners(&self) -> usize {
        self.endpoint.observers().packet_received_count()
    }

    pub fn packet_sent_listeners(&self) -> usize {
        self.endpoint.observers().packet_sent_count()
    }

    /// Close the session. Returns `false` if it was already closed.
    pub async fn close(&self) -> bool {
        let closed = self.conn.close().await;
        if closed {
            info!(session_id = %self.session_id(), "disconnected");
        }
        closed
    }
}

impl<C: PayloadCodec> Drop for Client<C> {
    fn drop(&mut self) {
        // The dispatch task holds the socket until closed.
        if !self.conn.is_closed() {
            let conn = self.conn.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    conn.close().await;
                });
            }
        }
    }
}

/// Connect side of the handshake: adopt the server's session id, derive the
/// key from it and announce our protocol version.
pub async fn handshake_connect<T>(
    conn: &ConnectionHandler<T>,
    algorithm: CipherAlgorithm,
    protocol_version: u32,
) -> NetxResult<Uuid> {
    conn.open_raw()?;

    let frame = conn.protocol_read().await?;
    if frame.signal()? != SignalKind::Type {
        return Err(NetxError::Protocol(format!(
            "expected session id frame, got kind {:#04x}",
            frame.kind
        )));
    }
    let session_id = handshake::parse_session_id(&frame.payload)?;
    let text = handshake::session_id_text(&session_id);

    let key = handshake::derive_key(&text, algorithm)?;
    conn.open(&key)?;
    conn.set_session_id(session_id);

    conn.write(SignalKind::Type, &handshake::encode_version(protocol_version))
        .await?;
    debug!(session_id = %session_id, version = protocol_version, "handshake complete");
    Ok(session_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use netx_core::handshake::{decode_version, derive_key, session_id_text};

    #[tokio::test]
    async fn connect_side_adopts_id_and_sends_version() {
        let (a, b) = tokio::io::duplex(4096);
        let client = ConnectionHandler::<String>::new(a, None, ConnectionOptions::default());
        let server = ConnectionHandler::<String>::new(b, None, ConnectionOptions::default());

        let id = handshake::generate_session_id();
        let text = session_id_text(&id);
        server.open_raw().unwrap();
        server.protocol_write(SignalKind::Type, text.as_bytes()).await.unwrap();
        server
            .open(&derive_key(&text, CipherAlgorithm::default()).unwrap())
            .unwrap();

        let adopted = handshake_connect(&client, CipherAlgorithm::default(), 7)
            .await
            .unwrap();
        assert_eq!(adopted, id);
        assert_eq!(client.session_id(), id);

        let version = server.read().await.unwrap();
        assert_eq!(decode_version(&version.payload).unwrap(), 7);
    }

    #[tokio::test]
    async fn malformed_session_id_is_a_protocol_error() {
        let (a, b) = tokio::io::duplex(4096);
        let client = ConnectionHandler::<String>::new(a, None, ConnectionOptions::default());
        let server = ConnectionHandler::<String>::new(b, None, ConnectionOptions::default());
        server.open_raw().unwrap();
        server.protocol_write(SignalKind::Type, b"not-a-uuid").await.unwrap();

        let err = handshake_connect(&client, CipherAlgorithm::default(), PROTOCOL_VERSION)
            .await
            .unwrap_err();
        assert!(matches!(err, NetxError::Protocol(_)));
    }

    #[tokio::test]
    async fn connect_refused_is_a_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = Client::connect(ClientConfig::new("127.0.0.1", port), netx_core::TextCodec)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, NetxError::Transport(_)));
    }

    #[test]
    fn config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.port, 4590);
        assert_eq!(config.default_timeout, Duration::from_millis(32_767));
        assert_eq!(config.protocol_version, PROTOCOL_VERSION);
    }
}

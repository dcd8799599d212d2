//! Core server: accept loop, session setup and the session-facing API.
//!
//! Each accepted connection gets its own task for the handshake. Once
//! admitted, a session is registered and served by one dispatch task until
//! it closes, fails or is kicked.

use crate::config::ServerConfig;
use crate::handshake::accept_handshake;
use crate::registry::{BroadcastReport, SessionRegistry};
use netx_core::{
    ConnectionHandler, DispatchExit, Endpoint, ListenerKey, NetxError, NetxResult, PayloadCodec,
    Request, RequestHandler, Response, SessionRole, Uuid,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Bound on a single client's handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on the accept loop noticing shutdown.
const ACCEPT_STOP_TIMEOUT: Duration = Duration::from_millis(100);

type Session<C> = Arc<ConnectionHandler<<C as PayloadCodec>::Item>>;

/// State shared between the server handle, the accept loop and every
/// session task.
struct Shared<C: PayloadCodec> {
    config: ServerConfig,
    endpoint: Endpoint<C>,
    registry: SessionRegistry<C::Item>,
    shutdown: watch::Sender<bool>,
}

/// The netx server instance.
pub struct Server<C: PayloadCodec> {
    shared: Arc<Shared<C>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<C: PayloadCodec> Server<C> {
    pub fn new(config: ServerConfig, codec: C) -> Self {
        let endpoint = Endpoint::new(codec, SessionRole::Server, config.default_timeout);
        let (shutdown, _) = watch::channel(true);
        Self {
            shared: Arc::new(Shared {
                config,
                endpoint,
                registry: SessionRegistry::new(),
                shutdown,
            }),
            accept_task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn codec(&self) -> &C {
        self.shared.endpoint.codec()
    }

    /// Bind and start accepting. Returns the bound address; an already open
    /// server returns its current address.
    pub async fn open(&self) -> NetxResult<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let bind = format!("{}:{}", self.shared.config.host, self.shared.config.port);
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| NetxError::Transport(format!("bind {bind} failed: {e}")))?;
        let addr = listener.local_addr()?;

        self.shared.shutdown.send_replace(false);
        let shared = self.shared.clone();
        let task = tokio::spawn(accept_loop(shared, listener));

        *lock(&self.accept_task) = Some(task);
        *lock(&self.local_addr) = Some(addr);
        info!(addr = %addr, algorithm = %self.shared.config.algorithm, "server listening");
        Ok(addr)
    }

    /// Stop accepting and kick every session. Returns `false` if the server
    /// was not open.
    pub async fn close(&self) -> bool {
        let Some(addr) = lock(&self.local_addr).take() else {
            return false;
        };
        self.shared.shutdown.send_replace(true);

        let task = lock(&self.accept_task).take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            if time::timeout(ACCEPT_STOP_TIMEOUT, task).await.is_err() {
                abort.abort();
            }
        }

        for conn in self.shared.registry.drain().await {
            let id = conn.session_id();
            if conn.close().await {
                self.shared.endpoint.observers().fire_client_disconnect(id);
            }
        }
        info!(addr = %addr, "server closed");
        true
    }

    pub fn is_open(&self) -> bool {
        lock(&self.local_addr).is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    async fn session(&self, id: Uuid) -> NetxResult<Session<C>> {
        self.shared
            .registry
            .get(&id)
            .await
            .ok_or(NetxError::SessionNotFound(id))
    }

    pub async fn session_ids(&self) -> Vec<Uuid> {
        self.shared.registry.ids().await
    }

    pub async fn session_count(&self) -> usize {
        self.shared.registry.count().await
    }

    pub async fn peer_addr(&self, id: Uuid) -> Option<SocketAddr> {
        self.shared.registry.peer_addr(&id).await
    }

    pub async fn send(&self, id: Uuid, value: &C::Item) -> NetxResult<()> {
        let conn = self.session(id).await?;
        self.shared.endpoint.send(&conn, value).await
    }

    /// Send one value to every session. Failures are logged per session
    /// and reported, never fatal to the rest.
    pub async fn broadcast(&self, value: &C::Item) -> NetxResult<BroadcastReport> {
        let payload = self.shared.endpoint.codec().decompile(value)?;
        let report = self.shared.registry.broadcast(&payload).await;
        if !report.delivered.is_empty() {
            self.shared.endpoint.observers().fire_packet_sent(value);
        }
        Ok(report)
    }

    /// Wait for the next typed value from one session.
    pub async fn await_next(&self, id: Uuid, timeout: Option<Duration>) -> NetxResult<Option<C::Item>> {
        let conn = self.session(id).await?;
        self.shared.endpoint.await_next(&conn, timeout).await
    }

    pub async fn send_and_await(
        &self,
        id: Uuid,
        value: &C::Item,
        timeout: Option<Duration>,
    ) -> NetxResult<Option<C::Item>> {
        let conn = self.session(id).await?;
        self.shared.endpoint.send_and_await(&conn, value, timeout).await
    }

    pub async fn request(
        &self,
        id: Uuid,
        request: &Request,
        timeout: Option<Duration>,
    ) -> NetxResult<Option<Response>> {
        let conn = self.session(id).await?;
        self.shared.endpoint.request(&conn, request, timeout).await
    }

    pub async fn request_or_else<F>(
        &self,
        id: Uuid,
        request: &Request,
        timeout: Option<Duration>,
        on_error: F,
    ) -> Option<Response>
    where
        F: FnOnce(Response),
    {
        match self.session(id).await {
            Ok(conn) => {
                self.shared
                    .endpoint
                    .request_or_else(&conn, request, timeout, on_error)
                    .await
            }
            Err(e) => {
                on_error(Response::error(request, e.to_string()));
                None
            }
        }
    }

    /// Force-close one session, unregister it and notify observers.
    pub async fn kick(&self, id: Uuid) -> NetxResult<()> {
        let conn = self
            .shared
            .registry
            .remove(&id)
            .await
            .ok_or(NetxError::SessionNotFound(id))?;
        if conn.close().await {
            info!(session_id = %id, "session kicked");
            self.shared.endpoint.observers().fire_client_disconnect(id);
        }
        Ok(())
    }

    pub async fn register_handler(&self, handler: Arc<dyn RequestHandler>) {
        self.shared.endpoint.register_handler(handler).await;
    }

    pub async fn unregister_handler(&self, kind_id: u32) -> bool {
        self.shared.endpoint.handlers().unregister(kind_id).await.is_some()
    }

    pub async fn registered_handlers(&self) -> Vec<u32> {
        self.shared.endpoint.handlers().kind_ids().await
    }

    pub fn on_packet_received(
        &self,
        listener: impl Fn(&C::Item, Uuid) + Send + Sync + 'static,
    ) -> ListenerKey {
        self.shared.endpoint.observers().on_packet_received(listener)
    }

    pub fn on_packet_sent(&self, listener: impl Fn(&C::Item) + Send + Sync + 'static) -> ListenerKey {
        self.shared.endpoint.observers().on_packet_sent(listener)
    }

    pub fn on_client_connect(&self, listener: impl Fn(Uuid) + Send + Sync + 'static) -> ListenerKey {
        self.shared.endpoint.observers().on_client_connect(listener)
    }

    pub fn on_client_disconnect(
        &self,
        listener: impl Fn(Uuid) + Send + Sync + 'static,
    ) -> ListenerKey {
        self.shared.endpoint.observers().on_client_disconnect(listener)
    }

    pub fn remove_listener(&self, key: ListenerKey) -> bool {
        self.shared.endpoint.observers().remove(key)
    }

    pub fn packet_received_listeners(&self) -> usize {
        self.shared.endpoint.observers().packet_received_count()
    }

    pub fn packet_sent_listeners(&self) -> usize {
        self.shared.endpoint.observers().packet_sent_count()
    }

    pub fn client_connect_listeners(&self) -> usize {
        self.shared.endpoint.observers().client_connect_count()
    }

    pub fn client_disconnect_listeners(&self) -> usize {
        self.shared.endpoint.observers().client_disconnect_count()
    }
}

impl<C: PayloadCodec> Drop for Server<C> {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
        if let Some(task) = lock(&self.accept_task).take() {
            task.abort();
        }
    }
}

async fn accept_loop<C: PayloadCodec>(shared: Arc<Shared<C>>, listener: TcpListener) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown_flag(&mut shutdown) => {
                debug!("accept loop stopped");
                return;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "connection accepted");
                tokio::spawn(establish(shared.clone(), stream));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
}

/// Handshake, register and start serving one accepted connection.
async fn establish<C: PayloadCodec>(shared: Arc<Shared<C>>, stream: TcpStream) {
    let conn = Arc::new(ConnectionHandler::from_tcp(
        stream,
        shared.config.connection_options(),
    ));
    let peer = conn.peer_addr();
    let id = shared.registry.reserve_id().await;

    let handshake = accept_handshake(
        &conn,
        id,
        shared.config.algorithm,
        shared.config.protocol_version,
    );
    let outcome = time::timeout(HANDSHAKE_TIMEOUT, handshake)
        .await
        .unwrap_or(Err(NetxError::Timeout));
    if let Err(e) = outcome {
        warn!(session_id = %id, peer = ?peer, error = %e, "handshake failed");
        conn.close().await;
        shared.registry.release_id(id).await;
        return;
    }

    shared.registry.insert(conn.clone()).await;
    if *shared.shutdown.borrow() {
        shared.registry.remove(&id).await;
        conn.close().await;
        return;
    }

    info!(session_id = %id, peer = ?peer, "client connected");
    shared.endpoint.observers().fire_client_connect(id);

    let task = tokio::spawn(serve(shared.clone(), conn.clone()));
    conn.set_dispatch_task(task);
}

/// Run one session's dispatch loop and tear it down when it ends.
async fn serve<C: PayloadCodec>(shared: Arc<Shared<C>>, conn: Session<C>) {
    let id = conn.session_id();
    match shared.endpoint.run_dispatch(&conn).await {
        DispatchExit::PeerClosed => debug!(session_id = %id, "client closed session"),
        DispatchExit::LocalClose => {}
        DispatchExit::Failed(e) => warn!(session_id = %id, error = %e, "session failed"),
    }

    if conn.close_detached().await {
        shared.registry.remove(&id).await;
        info!(session_id = %id, "client disconnected");
        shared.endpoint.observers().fire_client_disconnect(id);
    }
}

async fn shutdown_flag(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn lock<V>(mutex: &Mutex<V>) -> std::sync::MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

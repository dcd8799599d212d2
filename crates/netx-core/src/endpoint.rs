//! Dispatch loop and correlated calls shared by client and server.

use crate::codec::PayloadCodec;
use crate::connection::ConnectionHandler;
use crate::error::{NetxError, NetxResult};
use crate::frame::Frame;
use crate::handlers::{HandlerRegistry, RequestHandler};
use crate::message::{decode_request, decode_response, encode_request, encode_response, Request, Response};
use crate::observers::Observers;
use crate::signal::SignalKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time;
use tracing::{debug, warn};

/// Default wait for blocking awaits, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 32_767;

/// Which side of the connection an endpoint plays.
///
/// Decides how the dispatch loop reacts to unreadable frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Any read failure tears the session down.
    Server,
    /// Only a broken transport or protocol violation ends the loop.
    Client,
}

/// Why a dispatch loop stopped.
#[derive(Debug)]
pub enum DispatchExit {
    /// The peer sent `Close`.
    PeerClosed,
    /// This side closed the connection.
    LocalClose,
    Failed(NetxError),
}

enum Flow {
    Continue,
    PeerClosed,
}

/// Codec, observers and handlers bound to one side of the protocol.
pub struct Endpoint<C: PayloadCodec> {
    codec: C,
    observers: Observers<C::Item>,
    handlers: HandlerRegistry,
    default_timeout: Duration,
    role: SessionRole,
}

impl<C: PayloadCodec> Endpoint<C> {
    pub fn new(codec: C, role: SessionRole, default_timeout: Duration) -> Self {
        Self {
            codec,
            observers: Observers::new(),
            handlers: HandlerRegistry::new(),
            default_timeout,
            role,
        }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn observers(&self) -> &Observers<C::Item> {
        &self.observers
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub async fn register_handler(&self, handler: Arc<dyn RequestHandler>) {
        let kind_id = handler.kind_id();
        if self.handlers.register(handler).await.is_some() {
            debug!(kind_id, "replaced request handler");
        }
    }

    /// Send one typed value.
    pub async fn send(&self, conn: &ConnectionHandler<C::Item>, value: &C::Item) -> NetxResult<()> {
        let payload = self.codec.decompile(value)?;
        conn.write(SignalKind::Type, &payload).await?;
        self.observers.fire_packet_sent(value);
        Ok(())
    }

    /// Wait for the next inbound typed value without sending anything.
    ///
    /// `Ok(None)` means the wait timed out.
    pub async fn await_next(
        &self,
        conn: &ConnectionHandler<C::Item>,
        timeout: Option<Duration>,
    ) -> NetxResult<Option<C::Item>> {
        let (token, rx) = conn.correlations().push_await();
        let outcome = self.wait(rx, timeout).await;
        if !matches!(outcome, Ok(Some(_))) {
            conn.correlations().cancel_await(token);
        }
        outcome
    }

    /// Send a typed value and wait for the next inbound typed value.
    ///
    /// The waiter is registered before the frame is written, so a fast
    /// reply cannot slip past it.
    pub async fn send_and_await(
        &self,
        conn: &ConnectionHandler<C::Item>,
        value: &C::Item,
        timeout: Option<Duration>,
    ) -> NetxResult<Option<C::Item>> {
        let (token, rx) = conn.correlations().push_await();
        if let Err(e) = self.send(conn, value).await {
            conn.correlations().cancel_await(token);
            return Err(e);
        }
        let outcome = self.wait(rx, timeout).await;
        if !matches!(outcome, Ok(Some(_))) {
            conn.correlations().cancel_await(token);
        }
        outcome
    }

    /// Send a request and wait for the response with the same correlation id.
    ///
    /// `Ok(None)` means the wait timed out. The peer may still be working on it.
    pub async fn request(
        &self,
        conn: &ConnectionHandler<C::Item>,
        request: &Request,
        timeout: Option<Duration>,
    ) -> NetxResult<Option<Response>> {
        let correlation_id = request.correlation_id();
        let rx = conn.correlations().register_request(correlation_id);

        let sent = async {
            let payload = encode_request(request)?;
            conn.write(SignalKind::Request, &payload).await
        };
        if let Err(e) = sent.await {
            conn.correlations().cancel_request(correlation_id);
            return Err(e);
        }

        let outcome = self.wait(rx, timeout).await;
        if !matches!(outcome, Ok(Some(_))) {
            conn.correlations().cancel_request(correlation_id);
        }
        outcome
    }

    /// Like [`request`](Self::request), but a failure is handed to
    /// `on_error` as a synthetic error [`Response`] and `None` is returned.
    /// A timeout also yields `None` without calling `on_error`.
    pub async fn request_or_else<F>(
        &self,
        conn: &ConnectionHandler<C::Item>,
        request: &Request,
        timeout: Option<Duration>,
        on_error: F,
    ) -> Option<Response>
    where
        F: FnOnce(Response),
    {
        match self.request(conn, request, timeout).await {
            Ok(response) => response,
            Err(e) => {
                on_error(Response::error(request, e.to_string()));
                None
            }
        }
    }

    async fn wait<V>(&self, rx: oneshot::Receiver<V>, timeout: Option<Duration>) -> NetxResult<Option<V>> {
        match time::timeout(timeout.unwrap_or(self.default_timeout), rx).await {
            Ok(Ok(value)) => Ok(Some(value)),
            Ok(Err(_)) => Err(NetxError::Transport("session closed while awaiting".into())),
            Err(_) => Ok(None),
        }
    }

    /// Read and route frames until the session closes.
    pub async fn run_dispatch(&self, conn: &ConnectionHandler<C::Item>) -> DispatchExit {
        let session_id = conn.session_id();
        let mut closed = conn.closed_signal();

        loop {
            let frame = tokio::select! {
                biased;
                _ = closed_flag(&mut closed) => return DispatchExit::LocalClose,
                frame = conn.read() => frame,
            };

            let result = match frame {
                Ok(frame) => self.dispatch_frame(conn, frame).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(Flow::Continue) => {}
                Ok(Flow::PeerClosed) => {
                    debug!(session_id = %session_id, "peer closed session");
                    return DispatchExit::PeerClosed;
                }
                Err(_) if conn.is_closed() => return DispatchExit::LocalClose,
                Err(e) if self.is_fatal(&e) => return DispatchExit::Failed(e),
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "dropping unreadable frame");
                }
            }
        }
    }

    fn is_fatal(&self, error: &NetxError) -> bool {
        match self.role {
            SessionRole::Server => true,
            SessionRole::Client => {
                error.is_transport() || matches!(error, NetxError::Protocol(_))
            }
        }
    }

    async fn dispatch_frame(&self, conn: &ConnectionHandler<C::Item>, frame: Frame) -> NetxResult<Flow> {
        match SignalKind::from_wire(frame.kind) {
            Ok(SignalKind::Type) => self.on_type(conn, &frame.payload)?,
            Ok(SignalKind::Request) => self.on_request(conn, &frame.payload).await?,
            Ok(SignalKind::Response) => self.on_response(conn, &frame.payload)?,
            Ok(SignalKind::Close) => return Ok(Flow::PeerClosed),
            Err(e) => {
                warn!(session_id = %conn.session_id(), error = %e, "ignoring frame");
            }
        }
        Ok(Flow::Continue)
    }

    fn on_type(&self, conn: &ConnectionHandler<C::Item>, payload: &[u8]) -> NetxResult<()> {
        let value = self.codec.compile(payload)?;
        // A value that answers an await still reaches the observers.
        if conn.correlations().has_pending_awaits() {
            let _ = conn.correlations().resolve_await(self.codec.compile(payload)?);
        }
        self.observers.fire_packet_received(&value, conn.session_id());
        Ok(())
    }

    async fn on_request(&self, conn: &ConnectionHandler<C::Item>, payload: &[u8]) -> NetxResult<()> {
        let mut request = decode_request(payload)?;
        request.set_sender(conn.session_id());

        let Some(handler) = self.handlers.get(request.kind_id()).await else {
            let e = NetxError::Correlation(format!(
                "no handler for request kind {}",
                request.kind_id()
            ));
            warn!(
                session_id = %conn.session_id(),
                correlation_id = %request.correlation_id(),
                error = %e,
                "dropping request"
            );
            return Ok(());
        };

        let response = handler.handle(request).await;
        let mut payload = encode_response(&response)?;
        if payload.len() > conn.max_plaintext_len() {
            let message = format!(
                "response too large: {} bytes (max {})",
                payload.len(),
                conn.max_plaintext_len()
            );
            warn!(
                session_id = %conn.session_id(),
                correlation_id = %response.correlation_id(),
                "{message}"
            );
            payload = encode_response(&response.into_error(message))?;
        }
        conn.write(SignalKind::Response, &payload).await
    }

    fn on_response(&self, conn: &ConnectionHandler<C::Item>, payload: &[u8]) -> NetxResult<()> {
        let response = decode_response(payload)?;
        match conn.correlations().take_request(response.correlation_id()) {
            Some(waiter) => {
                if let Err(late) = waiter.send(response) {
                    debug!(
                        session_id = %conn.session_id(),
                        correlation_id = %late.correlation_id(),
                        "requester stopped waiting"
                    );
                }
            }
            None => {
                let e = NetxError::Correlation(format!(
                    "no pending request for response {}",
                    response.correlation_id()
                ));
                warn!(session_id = %conn.session_id(), error = %e, "dropping response");
            }
        }
        Ok(())
    }
}

async fn closed_flag(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

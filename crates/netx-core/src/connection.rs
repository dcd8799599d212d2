//! Per-session connection state machine.
//!
//! A [`ConnectionHandler`] owns one transport, its frame reader and writer,
//! the session cipher and the correlation store. It moves through
//! `Unopened -> RawOpen -> Open -> Closed`; `Closed` is terminal.

use crate::cipher::{CipherAlgorithm, SessionCipher};
use crate::correlation::CorrelationStore;
use crate::error::{NetxError, NetxResult};
use crate::frame::{Frame, FrameReader, FrameWriter, DEFAULT_MAX_FRAME_LEN};
use crate::signal::SignalKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;
use uuid::Uuid;

/// How long `close()` waits for the dispatch task before aborting it.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_millis(5);

/// Upper bound on sending the farewell `Close` frame.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_millis(500);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Unopened = 0,
    RawOpen = 1,
    Open = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Unopened,
            1 => ConnectionState::RawOpen,
            2 => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }
}

/// Tunables shared by every connection of an endpoint.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub algorithm: CipherAlgorithm,
    /// Bound on a frame payload as it travels, i.e. after sealing.
    pub max_frame_len: usize,
    pub close_grace: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            algorithm: CipherAlgorithm::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}

/// One transport connection and everything keyed to it.
///
/// `T` is the application payload type delivered to plain awaits.
pub struct ConnectionHandler<T> {
    options: ConnectionOptions,
    peer_addr: Option<SocketAddr>,
    session_id: OnceLock<Uuid>,
    state: AtomicU8,
    cipher: SessionCipher,
    reader: AsyncMutex<Option<FrameReader<BoxedReader>>>,
    writer: AsyncMutex<Option<FrameWriter<BoxedWriter>>>,
    correlations: CorrelationStore<T>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    closed_tx: watch::Sender<bool>,
}

impl<T> ConnectionHandler<T> {
    /// Wrap any bidirectional byte stream.
    pub fn new<S>(stream: S, peer_addr: Option<SocketAddr>, options: ConnectionOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader: BoxedReader = Box::new(read_half);
        let writer: BoxedWriter = Box::new(write_half);
        let (closed_tx, _) = watch::channel(false);

        Self {
            options,
            peer_addr,
            session_id: OnceLock::new(),
            state: AtomicU8::new(ConnectionState::Unopened as u8),
            cipher: SessionCipher::new(options.algorithm),
            reader: AsyncMutex::new(Some(FrameReader::with_max_len(
                reader,
                options.max_frame_len,
            ))),
            writer: AsyncMutex::new(Some(FrameWriter::with_max_len(
                writer,
                options.max_frame_len,
            ))),
            correlations: CorrelationStore::new(),
            dispatch: Mutex::new(None),
            closed_tx,
        }
    }

    /// Wrap an accepted or connected TCP stream.
    pub fn from_tcp(stream: TcpStream, options: ConnectionOptions) -> Self {
        let peer_addr = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }
        Self::new(stream, peer_addr, options)
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Session id, or the nil id before the handshake assigned one.
    pub fn session_id(&self) -> Uuid {
        self.session_id.get().copied().unwrap_or_else(Uuid::nil)
    }

    /// Assign the session id. Only the first call has any effect.
    pub fn set_session_id(&self, id: Uuid) -> bool {
        self.session_id.set(id).is_ok()
    }

    /// Largest plaintext `write` accepts once sealing overhead is added.
    pub fn max_plaintext_len(&self) -> usize {
        self.options
            .max_frame_len
            .saturating_sub(self.options.algorithm.sealed_overhead())
    }

    pub fn correlations(&self) -> &CorrelationStore<T> {
        &self.correlations
    }

    /// Start the unencrypted handshake phase.
    pub fn open_raw(&self) -> NetxResult<()> {
        self.state
            .compare_exchange(
                ConnectionState::Unopened as u8,
                ConnectionState::RawOpen as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|current| {
                NetxError::Protocol(format!(
                    "cannot open raw from {:?}",
                    ConnectionState::from_u8(current)
                ))
            })
    }

    /// Activate the cipher. A no-op once the connection is open.
    pub fn open(&self, key: &[u8]) -> NetxResult<()> {
        match self.state() {
            ConnectionState::Open => return Ok(()),
            ConnectionState::RawOpen => {}
            other => {
                return Err(NetxError::Protocol(format!("cannot open from {other:?}")));
            }
        }

        self.cipher.open(key)?;
        let _ = self.state.compare_exchange(
            ConnectionState::RawOpen as u8,
            ConnectionState::Open as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if self.is_open() {
            Ok(())
        } else {
            Err(NetxError::Protocol("connection closed while opening".into()))
        }
    }

    fn require_open(&self) -> NetxResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(NetxError::Protocol("not open".into()))
        }
    }

    fn require_raw(&self) -> NetxResult<()> {
        match self.state() {
            ConnectionState::RawOpen | ConnectionState::Open => Ok(()),
            _ => Err(NetxError::Protocol("not open".into())),
        }
    }

    /// Encrypt and write one frame.
    pub async fn write(&self, kind: SignalKind, plaintext: &[u8]) -> NetxResult<()> {
        self.require_open()?;
        if plaintext.len() > self.max_plaintext_len() {
            return Err(NetxError::Protocol(format!(
                "payload too large: {} bytes (max {} before sealing)",
                plaintext.len(),
                self.max_plaintext_len()
            )));
        }
        let sealed = self.cipher.encode(plaintext)?;
        self.write_frame(kind, &sealed).await
    }

    /// Read and decrypt one frame.
    pub async fn read(&self) -> NetxResult<Frame> {
        self.require_open()?;
        let mut frame = self.read_frame().await?;
        frame.payload = self.cipher.decode(&frame.payload)?;
        Ok(frame)
    }

    /// Write one frame without encryption. Handshake only.
    pub async fn protocol_write(&self, kind: SignalKind, payload: &[u8]) -> NetxResult<()> {
        self.require_raw()?;
        self.write_frame(kind, payload).await
    }

    /// Read one frame without decryption. Handshake only.
    pub async fn protocol_read(&self) -> NetxResult<Frame> {
        self.require_raw()?;
        self.read_frame().await
    }

    async fn write_frame(&self, kind: SignalKind, payload: &[u8]) -> NetxResult<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => writer.write(kind, payload).await,
            None => Err(NetxError::Transport("connection closed".into())),
        }
    }

    async fn read_frame(&self) -> NetxResult<Frame> {
        let mut reader = self.reader.lock().await;
        match reader.as_mut() {
            Some(reader) => reader.read().await,
            None => Err(NetxError::Transport("connection closed".into())),
        }
    }

    /// Hand over the task running this connection's dispatch loop.
    pub fn set_dispatch_task(&self, task: JoinHandle<()>) {
        if self.is_closed() {
            // Already torn down; the loop exits on the closed signal.
            return;
        }
        *self.dispatch.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    /// Receiver that flips to `true` when the connection starts closing.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Close the connection and wait briefly for the dispatch task.
    ///
    /// Returns `true` if this call performed the teardown, `false` if the
    /// connection was already closed.
    pub async fn close(&self) -> bool {
        let Some(was_open) = self.begin_close() else {
            return false;
        };
        self.shutdown_transport(was_open).await;

        let task = self
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            if time::timeout(self.options.close_grace, task).await.is_err() {
                debug!(session_id = %self.session_id(), "dispatch task still running, aborting");
                abort.abort();
            }
        }

        self.release_reader();
        self.correlations.clear();
        true
    }

    /// Close from inside the dispatch task itself, without joining it.
    pub async fn close_detached(&self) -> bool {
        let Some(was_open) = self.begin_close() else {
            return false;
        };
        self.shutdown_transport(was_open).await;
        self.dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.release_reader();
        self.correlations.clear();
        true
    }

    /// Mark closed. Yields whether the cipher was active, or `None` if
    /// another caller already closed.
    fn begin_close(&self) -> Option<bool> {
        let previous =
            ConnectionState::from_u8(self.state.swap(ConnectionState::Closed as u8, Ordering::AcqRel));
        if previous == ConnectionState::Closed {
            return None;
        }
        self.closed_tx.send_replace(true);
        Some(previous == ConnectionState::Open)
    }

    async fn shutdown_transport(&self, was_open: bool) {
        let session_id = self.session_id();
        let farewell = async {
            let mut guard = self.writer.lock().await;
            let Some(mut writer) = guard.take() else {
                return;
            };
            if was_open {
                match self.cipher.encode(&[]) {
                    Ok(sealed) => {
                        if let Err(e) = writer.write(SignalKind::Close, &sealed).await {
                            debug!(session_id = %session_id, error = %e, "close frame not delivered");
                        }
                    }
                    Err(e) => debug!(session_id = %session_id, error = %e, "failed to seal close frame"),
                }
            }
            if let Err(e) = writer.shutdown().await {
                debug!(session_id = %session_id, error = %e, "transport shutdown failed");
            }
        };
        if time::timeout(CLOSE_FRAME_TIMEOUT, farewell).await.is_err() {
            debug!(session_id = %session_id, "transport shutdown timed out");
        }
    }

    fn release_reader(&self) {
        // A handshake read still holding the lock drops it on its own.
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
    }
}

impl<T> std::fmt::Debug for ConnectionHandler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("session_id", &self.session_id())
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .field("algorithm", &self.cipher.algorithm())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::derive_key;

    type Conn = ConnectionHandler<String>;

    fn pair() -> (Conn, Conn) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Conn::new(a, None, ConnectionOptions::default()),
            Conn::new(b, None, ConnectionOptions::default()),
        )
    }

    fn open_pair(a: &Conn, b: &Conn) {
        let key = derive_key("abcd-session-text", CipherAlgorithm::default()).unwrap();
        a.open_raw().unwrap();
        b.open_raw().unwrap();
        a.open(&key).unwrap();
        b.open(&key).unwrap();
    }

    #[tokio::test]
    async fn encrypted_frames_round_trip() {
        let (a, b) = pair();
        open_pair(&a, &b);

        a.write(SignalKind::Type, b"hello").await.unwrap();
        let frame = b.read().await.unwrap();
        assert_eq!(frame.signal().unwrap(), SignalKind::Type);
        assert_eq!(frame.payload, b"hello");
    }

    #[tokio::test]
    async fn write_bound_accounts_for_sealing() {
        let options = ConnectionOptions {
            max_frame_len: 64,
            ..ConnectionOptions::default()
        };
        let (x, y) = tokio::io::duplex(1024);
        let a = Conn::new(x, None, options);
        let b = Conn::new(y, None, options);
        open_pair(&a, &b);
        assert_eq!(a.max_plaintext_len(), 36);

        assert!(matches!(
            a.write(SignalKind::Type, &[0u8; 37]).await,
            Err(NetxError::Protocol(_))
        ));
        assert!(a.is_open());

        a.write(SignalKind::Type, &[5u8; 36]).await.unwrap();
        assert_eq!(b.read().await.unwrap().payload, vec![5u8; 36]);
    }

    #[tokio::test]
    async fn raw_frames_bypass_cipher() {
        let (a, b) = pair();
        a.open_raw().unwrap();
        b.open_raw().unwrap();

        a.protocol_write(SignalKind::Type, b"plain").await.unwrap();
        assert_eq!(b.protocol_read().await.unwrap().payload, b"plain");
    }

    #[tokio::test]
    async fn encrypted_io_requires_open() {
        let (a, _b) = pair();
        assert!(matches!(
            a.write(SignalKind::Type, b"x").await,
            Err(NetxError::Protocol(_))
        ));
        a.open_raw().unwrap();
        assert!(matches!(a.read().await, Err(NetxError::Protocol(_))));
        assert!(matches!(
            a.protocol_write(SignalKind::Type, b"x").await,
            Ok(())
        ));
    }

    #[tokio::test]
    async fn state_transitions() {
        let (a, _b) = pair();
        assert_eq!(a.state(), ConnectionState::Unopened);
        assert!(a.open(&[0u8; 32]).is_err());

        a.open_raw().unwrap();
        assert!(a.open_raw().is_err());
        assert_eq!(a.state(), ConnectionState::RawOpen);

        a.open(&[0u8; 32]).unwrap();
        a.open(&[1u8; 32]).unwrap();
        assert_eq!(a.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn bad_key_leaves_connection_raw() {
        let (a, _b) = pair();
        a.open_raw().unwrap();
        assert!(matches!(a.open(&[0u8; 3]), Err(NetxError::Crypto(_))));
        assert_eq!(a.state(), ConnectionState::RawOpen);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_notifies_peer() {
        let (a, b) = pair();
        open_pair(&a, &b);
        let mut signal = a.closed_signal();

        assert!(a.close().await);
        assert!(!a.close().await);
        assert!(a.is_closed());
        assert!(*signal.borrow_and_update());

        let farewell = b.read().await.unwrap();
        assert_eq!(farewell.signal().unwrap(), SignalKind::Close);
        assert!(matches!(b.read().await, Err(NetxError::Transport(_))));
    }

    #[tokio::test]
    async fn close_drops_pending_waiters() {
        let (a, b) = pair();
        open_pair(&a, &b);
        let (_, rx) = a.correlations().push_await();
        a.close().await;
        assert!(rx.await.is_err());
        assert!(!a.correlations().has_pending());
    }

    #[tokio::test]
    async fn close_aborts_a_stuck_dispatch_task() {
        let (a, b) = pair();
        open_pair(&a, &b);
        let task = tokio::spawn(async {
            std::future::pending::<()>().await;
        });
        let abort = task.abort_handle();
        a.set_dispatch_task(task);

        a.close().await;
        for _ in 0..100 {
            if abort.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(abort.is_finished());
    }

    #[tokio::test]
    async fn io_after_close_fails() {
        let (a, b) = pair();
        open_pair(&a, &b);
        a.close().await;
        assert!(a.write(SignalKind::Type, b"late").await.is_err());
    }

    #[test]
    fn session_id_is_set_once() {
        let (a, _b) = pair();
        assert!(a.session_id().is_nil());
        let id = Uuid::new_v4();
        assert!(a.set_session_id(id));
        assert!(!a.set_session_id(Uuid::new_v4()));
        assert_eq!(a.session_id(), id);
    }
}

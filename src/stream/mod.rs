//! Interactive stream-proxy sessions.
//!
//! After the filter chain approves an exec-start/attach request and the
//! backend attach call succeeds, the session takes exclusive ownership of
//! both transports, writes the raw-stream negotiation line, and pumps bytes
//! in both directions until termination. Hijacked transports never go back
//! to the buffered request/response abstraction or to any pool.

use crate::error::{ProxyError, Result};
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Negotiation line when the inbound request carried an `Upgrade` header.
pub const RAW_STREAM_UPGRADE_BANNER: &[u8] = b"HTTP/1.1 101 UPGRADED\r\nContent-Type: application/vnd.docker.raw-stream\r\nConnection: Upgrade\r\nUpgrade: tcp\r\n\r\n";

/// Negotiation line without an upgrade.
pub const RAW_STREAM_OK_BANNER: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: application/vnd.docker.raw-stream\r\n\r\n";

const PUMP_BUF_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Negotiating = 0,
    DataPlaneOpen = 1,
    HalfClosed = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Negotiating,
            1 => SessionState::DataPlaneOpen,
            2 => SessionState::HalfClosed,
            _ => SessionState::Closed,
        }
    }
}

/// One-shot close latch. The first caller wins; later (possibly concurrent)
/// attempts are no-ops.
pub(crate) struct CloseOnce(AtomicBool);

impl CloseOnce {
    pub(crate) fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// True exactly once across all callers.
    pub(crate) fn begin(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }
}

/// Byte counts observed by a finished session.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

pub struct StreamSession<C, B> {
    client: C,
    backend: B,
    upgrade: bool,
    /// Bytes the serving layer had already read off the client transport
    /// before the hijack; flushed to the backend ahead of the pump.
    client_leftover: Bytes,
    state: Arc<AtomicU8>,
}

impl<C, B> StreamSession<C, B>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(client: C, backend: B, upgrade: bool) -> Self {
        Self {
            client,
            backend,
            upgrade,
            client_leftover: Bytes::new(),
            state: Arc::new(AtomicU8::new(SessionState::Negotiating as u8)),
        }
    }

    pub fn with_client_leftover(mut self, leftover: Bytes) -> Self {
        self.client_leftover = leftover;
        self
    }

    /// Observable lifecycle state; usable while `run` is in flight.
    pub fn state_handle(&self) -> Arc<AtomicU8> {
        self.state.clone()
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Negotiate, then pump until both directions are done. Consumes the
    /// session; the transports are closed exactly once each on the way out.
    pub async fn run(mut self) -> Result<StreamStats> {
        let banner: &[u8] = if self.upgrade {
            RAW_STREAM_UPGRADE_BANNER
        } else {
            RAW_STREAM_OK_BANNER
        };

        // The negotiation line must precede any forwarded byte.
        self.client
            .write_all(banner)
            .await
            .map_err(ProxyError::StreamIo)?;
        self.client.flush().await.map_err(ProxyError::StreamIo)?;

        self.state
            .store(SessionState::DataPlaneOpen as u8, Ordering::SeqCst);
        debug!(upgrade = self.upgrade, "Stream session data plane open");

        let (client_read, client_write) = tokio::io::split(self.client);
        let (backend_read, backend_write) = tokio::io::split(self.backend);

        let client_close = Arc::new(CloseOnce::new());
        let backend_close = Arc::new(CloseOnce::new());

        // Either direction ending tears down the whole session: each pump
        // announces its exit, and the opposite pump stops on that signal
        // instead of waiting for its own end of stream.
        let (c2b_done_tx, c2b_done_rx) = oneshot::channel();
        let (b2c_done_tx, b2c_done_rx) = oneshot::channel();

        let state = self.state.clone();
        let leftover = self.client_leftover.clone();
        let c2b = tokio::spawn(pump(
            "client->backend",
            client_read,
            backend_write,
            leftover,
            backend_close.clone(),
            state.clone(),
            c2b_done_tx,
            b2c_done_rx,
        ));

        let state = self.state.clone();
        let b2c = tokio::spawn(pump(
            "backend->client",
            backend_read,
            client_write,
            Bytes::new(),
            client_close.clone(),
            state,
            b2c_done_tx,
            c2b_done_rx,
        ));

        // Task panics would only come from the pump itself, so treat them
        // as stream failures.
        let (to_backend, to_client) = tokio::join!(c2b, b2c);
        let client_to_backend = to_backend.map_err(|e| {
            ProxyError::StreamIo(std::io::Error::other(e))
        })?;
        let backend_to_client = to_client.map_err(|e| {
            ProxyError::StreamIo(std::io::Error::other(e))
        })?;

        debug!(
            client_to_backend,
            backend_to_client, "Stream session closed"
        );

        Ok(StreamStats {
            client_to_backend,
            backend_to_client,
        })
    }
}

/// One directional pump: forward every chunk read from `reader` onto
/// `writer`, preserving arrival order, until EOF or error on either side,
/// or until the opposite pump announces its own exit via `peer_done`.
/// Data already read when the terminating condition hits is still flushed.
/// On exit the writer is shut down through its close latch, exactly once,
/// and `done` fires so the opposite pump stops too.
#[allow(clippy::too_many_arguments)]
async fn pump<R, W>(
    direction: &'static str,
    mut reader: R,
    mut writer: W,
    initial: Bytes,
    close: Arc<CloseOnce>,
    state: Arc<AtomicU8>,
    done: oneshot::Sender<()>,
    mut peer_done: oneshot::Receiver<()>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut forwarded = 0u64;
    let mut buf = BytesMut::with_capacity(PUMP_BUF_SIZE);

    if !initial.is_empty() {
        match writer.write_all(&initial).await {
            Ok(()) => forwarded += initial.len() as u64,
            Err(e) => {
                trace!(direction, error = %e, "Pump write failed on buffered bytes");
                let _ = done.send(());
                finish_pump(direction, &mut writer, &close, &state).await;
                return forwarded;
            }
        }
    }

    loop {
        buf.clear();
        tokio::select! {
            _ = &mut peer_done => {
                trace!(direction, "Opposite pump finished, stopping");
                break;
            }
            result = reader.read_buf(&mut buf) => match result {
                Ok(0) => {
                    trace!(direction, "Pump source reached end of stream");
                    break;
                }
                Ok(n) => {
                    if let Err(e) = writer.write_all(&buf[..n]).await {
                        trace!(direction, error = %e, "Pump write failed");
                        break;
                    }
                    if let Err(e) = writer.flush().await {
                        trace!(direction, error = %e, "Pump flush failed");
                        break;
                    }
                    forwarded += n as u64;
                }
                Err(e) => {
                    trace!(direction, error = %e, "Pump read failed");
                    break;
                }
            }
        }
    }

    let _ = done.send(());
    finish_pump(direction, &mut writer, &close, &state).await;
    forwarded
}

async fn finish_pump<W>(
    direction: &'static str,
    writer: &mut W,
    close: &CloseOnce,
    state: &AtomicU8,
) where
    W: AsyncWrite + Unpin,
{
    if close.begin() {
        let _ = writer.flush().await;
        let _ = writer.shutdown().await;
        debug!(direction, "Pump destination closed");
    }

    // DataPlaneOpen -> HalfClosed on the first pump out, -> Closed on the
    // second; both CAS attempts are race-safe.
    let _ = state.compare_exchange(
        SessionState::DataPlaneOpen as u8,
        SessionState::HalfClosed as u8,
        Ordering::SeqCst,
        Ordering::SeqCst,
    );
    let _ = state.compare_exchange(
        SessionState::HalfClosed as u8,
        SessionState::Closed as u8,
        Ordering::SeqCst,
        Ordering::SeqCst,
    );
}

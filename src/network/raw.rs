use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{
    self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, trace};

use crate::service::global_config;
use crate::{AppError, AppResult};

/// Any bidirectional byte stream a connection can wrap.
pub trait NetStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> NetStream for T {}

type CloseHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct CloseState {
    closed: AtomicBool,
    token: CancellationToken,
    on_close: Mutex<Vec<CloseHook>>,
}

impl fmt::Debug for CloseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseState")
            .field("closed", &self.closed)
            .field("hooks", &self.on_close.lock().len())
            .finish()
    }
}

/// Shared close switch of one connection.
///
/// Both directions of a connection hold the same `Closer`. Closing it from
/// any task releases both halves of the stream and wakes every receive or
/// send blocked on that connection, which then fails with
/// [`AppError::ConnectionClosed`].
#[derive(Debug, Clone, Default)]
pub struct Closer {
    state: Arc<CloseState>,
}

impl Closer {
    /// Marks the connection closed. A second call reports
    /// [`AppError::ConnectionClosed`] and changes nothing.
    pub fn close(&self) -> AppResult<()> {
        if self.mark_closed() {
            Ok(())
        } else {
            Err(AppError::ConnectionClosed)
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Returns `true` only for the call that performed the transition.
    pub(crate) fn mark_closed(&self) -> bool {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.state.token.cancel();
        let hooks = std::mem::take(&mut *self.state.on_close.lock());
        for hook in hooks {
            hook();
        }
        true
    }

    /// Runs `hook` once the connection is closed, right away if it already is.
    fn on_close(&self, hook: CloseHook) {
        let mut hooks = self.state.on_close.lock();
        if self.is_closed() {
            drop(hooks);
            hook();
        } else {
            hooks.push(hook);
        }
    }

    fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.state.token.cancelled()
    }
}

/// One half of the split stream. The close hook holds a weak handle so it can
/// drop the half even while the owning direction sits idle in another task.
type HalfSlot<T> = Arc<AsyncMutex<Option<T>>>;

/// Drops the half unless an in-flight call holds it; that call drops it
/// itself once it sees the connection closed.
fn release_half<T>(slot: &AsyncMutex<Option<T>>) {
    if let Ok(mut half) = slot.try_lock() {
        half.take();
    }
}

fn release_on_close<T: Send + 'static>(closer: &Closer, slot: &HalfSlot<T>) {
    let slot: Weak<AsyncMutex<Option<T>>> = Arc::downgrade(slot);
    closer.on_close(Box::new(move || {
        if let Some(slot) = slot.upgrade() {
            release_half(&slot);
        }
    }));
}

/// Receive direction of a raw connection.
#[derive(Debug)]
pub struct RawReader<S = TcpStream> {
    stream: HalfSlot<ReadHalf<S>>,
    read_timeout: Option<Duration>,
    closer: Closer,
}

impl<S: NetStream> RawReader<S> {
    pub fn set_read_timeout(&mut self, read_timeout: Option<Duration>) {
        self.read_timeout = read_timeout;
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn closer(&self) -> Closer {
        self.closer.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    /// Receives one byte.
    pub async fn recv_byte(&mut self) -> AppResult<u8> {
        let mut buf = [0u8; 1];
        self.recv_exact(&mut buf).await?;
        Ok(buf[0])
    }

    /// Receives whatever the stream delivers next, up to `buf.len()` bytes.
    ///
    /// Returns at least one byte unless `buf` is empty. End of stream is a
    /// permanent [`AppError::PeerClosed`].
    pub async fn recv_some(&mut self, buf: &mut [u8]) -> AppResult<usize> {
        let result = self.read_once(buf).await;
        if let Err(err) = &result {
            if !err.is_temporary() {
                debug!(error = %err, "closing connection after read error");
                self.abort();
            }
        }
        result
    }

    /// Fills `buf` completely.
    ///
    /// A transient error before the first byte arrives is handed back to the
    /// caller, since nothing of the unit has been consumed yet. Once part of
    /// the unit is read, transient errors are retried so the stream never
    /// loses alignment.
    pub async fn recv_exact(&mut self, buf: &mut [u8]) -> AppResult<()> {
        self.fill(buf, false).await
    }

    /// Fills `buf` completely, retrying every transient error. Used for the
    /// remainder of a unit whose first bytes were already consumed.
    pub(crate) async fn recv_exact_continued(&mut self, buf: &mut [u8]) -> AppResult<()> {
        self.fill(buf, true).await
    }

    async fn fill(&mut self, buf: &mut [u8], started: bool) -> AppResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.recv_some(&mut buf[filled..]).await {
                Ok(n) => filled += n,
                Err(err) if err.is_temporary() && (started || filled > 0) => {
                    trace!(error = %err, filled, total = buf.len(), "retry partial read");
                }
                Err(AppError::PeerClosed(_)) if filled > 0 => {
                    return Err(AppError::PeerClosed(format!(
                        "stream ended after {} of {} bytes",
                        filled,
                        buf.len()
                    )));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn read_once(&mut self, buf: &mut [u8]) -> AppResult<usize> {
        let read_timeout = self.read_timeout;
        let mut half = self.stream.lock().await;
        let result = match half.as_mut() {
            Some(stream) if !self.closer.is_closed() => {
                let read = async move {
                    let res = match read_timeout {
                        Some(timeout) => {
                            match time::timeout(timeout, stream.read(&mut *buf)).await {
                                Ok(res) => res,
                                Err(_) => return Err(AppError::Timeout),
                            }
                        }
                        None => stream.read(&mut *buf).await,
                    };
                    match res {
                        Ok(0) if !buf.is_empty() => {
                            Err(AppError::PeerClosed("end of stream".to_string()))
                        }
                        Ok(n) => Ok(n),
                        Err(err) => Err(AppError::from(err)),
                    }
                };
                tokio::select! {
                    biased;
                    _ = self.closer.cancelled() => Err(AppError::ConnectionClosed),
                    res = read => res,
                }
            }
            _ => Err(AppError::ConnectionClosed),
        };
        drop(half);
        // a close that raced with this call could not take the half
        if self.closer.is_closed() {
            release_half(&self.stream);
        }
        result
    }

    /// Closes the connection without waiting for the peer. Both halves of
    /// the stream are dropped.
    pub(crate) fn abort(&mut self) {
        self.closer.mark_closed();
    }

    pub fn close(&mut self) -> AppResult<()> {
        self.closer.close()
    }
}

/// Send direction of a raw connection. Every send is flushed before it
/// returns.
#[derive(Debug)]
pub struct RawWriter<S = TcpStream> {
    stream: HalfSlot<BufWriter<WriteHalf<S>>>,
    closer: Closer,
}

impl<S: NetStream> RawWriter<S> {
    pub fn closer(&self) -> Closer {
        self.closer.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    pub async fn send_byte(&mut self, b: u8) -> AppResult<()> {
        self.send_parts(&[&[b]]).await
    }

    pub async fn send_bytes(&mut self, bytes: &[u8]) -> AppResult<()> {
        self.send_parts(&[bytes]).await
    }

    /// Writes every part in order and flushes once. Any failure closes the
    /// connection, since part of the sequence may already be on the wire.
    pub(crate) async fn send_parts(&mut self, parts: &[&[u8]]) -> AppResult<()> {
        let mut half = self.stream.lock().await;
        let result = match half.as_mut() {
            Some(stream) if !self.closer.is_closed() => {
                let write = async move {
                    for part in parts {
                        stream.write_all(part).await?;
                    }
                    stream.flush().await
                };
                tokio::select! {
                    biased;
                    _ = self.closer.cancelled() => Err(AppError::ConnectionClosed),
                    res = write => res.map_err(AppError::SendFailed),
                }
            }
            _ => Err(AppError::ConnectionClosed),
        };
        drop(half);
        if let Err(err) = &result {
            debug!(error = %err, "closing connection after write error");
            self.closer.mark_closed();
        }
        if self.closer.is_closed() {
            release_half(&self.stream);
        }
        result
    }

    /// Shuts the write side down, sending end-of-stream to the peer.
    async fn shutdown_stream(&mut self) {
        let stream = self.stream.lock().await.take();
        if let Some(mut stream) = stream {
            if let Err(err) = stream.shutdown().await {
                trace!(error = %err, "shutdown write side");
            }
        }
    }

    pub async fn close(&mut self) -> AppResult<()> {
        self.shutdown_stream().await;
        self.closer.close()
    }
}

/// Closes both directions of one connection and releases the stream.
pub(crate) async fn close_pair<S: NetStream>(
    reader: &mut RawReader<S>,
    writer: &mut RawWriter<S>,
) -> AppResult<()> {
    writer.shutdown_stream().await;
    let first = reader.closer.mark_closed();
    release_half(&reader.stream);
    if first {
        debug!("connection closed");
        Ok(())
    } else {
        Err(AppError::ConnectionClosed)
    }
}

/// Unframed byte stream over one socket.
#[derive(Debug)]
pub struct RawConnection<S = TcpStream> {
    reader: RawReader<S>,
    writer: RawWriter<S>,
}

impl<S: NetStream> RawConnection<S> {
    /// Wraps `stream`, applying the configured read deadline if any.
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = io::split(stream);
        let read_half = Arc::new(AsyncMutex::new(Some(read_half)));
        let write_half = Arc::new(AsyncMutex::new(Some(BufWriter::new(write_half))));
        let closer = Closer::default();
        release_on_close(&closer, &read_half);
        release_on_close(&closer, &write_half);
        RawConnection {
            reader: RawReader {
                stream: read_half,
                read_timeout: global_config().connection.read_timeout(),
                closer: closer.clone(),
            },
            writer: RawWriter {
                stream: write_half,
                closer,
            },
        }
    }

    pub async fn send_byte(&mut self, b: u8) -> AppResult<()> {
        self.writer.send_byte(b).await
    }

    pub async fn recv_byte(&mut self) -> AppResult<u8> {
        self.reader.recv_byte().await
    }

    pub async fn send_bytes(&mut self, bytes: &[u8]) -> AppResult<()> {
        self.writer.send_bytes(bytes).await
    }

    pub async fn recv_some(&mut self, buf: &mut [u8]) -> AppResult<usize> {
        self.reader.recv_some(buf).await
    }

    /// `None` disables the deadline. An elapsed deadline surfaces as
    /// [`AppError::Timeout`].
    pub fn set_read_timeout(&mut self, read_timeout: Option<Duration>) {
        self.reader.set_read_timeout(read_timeout);
    }

    pub fn closer(&self) -> Closer {
        self.reader.closer()
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_closed()
    }

    /// Closes the connection. Calling it again returns
    /// [`AppError::ConnectionClosed`].
    pub async fn close(&mut self) -> AppResult<()> {
        close_pair(&mut self.reader, &mut self.writer).await
    }

    pub fn into_split(self) -> (RawReader<S>, RawWriter<S>) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};
    use tokio::time::Instant;

    fn pair() -> (RawConnection<DuplexStream>, DuplexStream) {
        let (local, remote) = duplex(64 * 1024);
        (RawConnection::new(local), remote)
    }

    #[tokio::test]
    async fn test_send_and_recv_byte() -> AppResult<()> {
        let (mut conn, mut remote) = pair();
        conn.send_byte(0xAB).await?;
        let mut buf = [0u8; 1];
        remote.read_exact(&mut buf).await?;
        assert_eq!(buf[0], 0xAB);

        remote.write_all(&[7]).await?;
        assert_eq!(conn.recv_byte().await?, 7);
        Ok(())
    }

    #[tokio::test]
    async fn test_peer_eof_is_permanent_and_closes() {
        let (mut conn, remote) = pair();
        drop(remote);
        let err = conn.recv_byte().await.unwrap_err();
        assert!(matches!(err, AppError::PeerClosed(_)));
        assert!(!err.is_temporary());
        assert!(conn.is_closed());
        assert!(matches!(
            conn.send_byte(1).await,
            Err(AppError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_twice() {
        let (mut conn, _remote) = pair();
        assert!(conn.close().await.is_ok());
        assert!(matches!(conn.close().await, Err(AppError::ConnectionClosed)));
        assert!(matches!(conn.recv_byte().await, Err(AppError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_read_timeout_is_transient() -> AppResult<()> {
        let (mut conn, mut remote) = pair();
        conn.set_read_timeout(Some(Duration::from_millis(20)));
        let err = conn.recv_byte().await.unwrap_err();
        assert!(matches!(err, AppError::Timeout));
        assert!(err.is_temporary());
        assert!(!conn.is_closed());

        remote.write_all(&[42]).await?;
        assert_eq!(conn.recv_byte().await?, 42);
        Ok(())
    }

    #[tokio::test]
    async fn test_closer_wakes_blocked_recv() {
        let (conn, _remote) = pair();
        let (mut reader, _writer) = conn.into_split();
        let closer = reader.closer();
        let started = Instant::now();
        let blocked = tokio::spawn(async move { reader.recv_byte().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(closer.close().is_ok());
        let res = blocked.await.unwrap();
        assert!(matches!(res, Err(AppError::ConnectionClosed)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(closer.close(), Err(AppError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_closer_wakes_blocked_send() {
        // a tiny pipe nobody drains, so the flush never completes
        let (local, _remote) = duplex(8);
        let (_reader, mut writer) = RawConnection::new(local).into_split();
        let closer = writer.closer();
        let started = Instant::now();
        let blocked = tokio::spawn(async move { writer.send_bytes(&[0u8; 64]).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());
        assert!(closer.close().is_ok());
        let res = blocked.await.unwrap();
        assert!(matches!(res, Err(AppError::ConnectionClosed)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    async fn assert_remote_sees_eof(remote: &mut DuplexStream) {
        let mut buf = [0u8; 16];
        let read = time::timeout(Duration::from_millis(500), remote.read(&mut buf)).await;
        assert!(matches!(read, Ok(Ok(0))), "remote did not see EOF: {:?}", read);
    }

    #[tokio::test]
    async fn test_read_error_releases_stream() -> AppResult<()> {
        let (mut conn, mut remote) = pair();
        remote.shutdown().await?;
        let err = conn.recv_byte().await.unwrap_err();
        assert!(matches!(err, AppError::PeerClosed(_)));
        // the connection is still owned, yet the socket must be gone
        assert_remote_sees_eof(&mut remote).await;
        assert!(conn.is_closed());
        Ok(())
    }

    #[tokio::test]
    async fn test_read_error_releases_idle_writer_half() -> AppResult<()> {
        let (conn, mut remote) = pair();
        let (mut reader, writer) = conn.into_split();
        let idle_writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(writer);
        });
        remote.shutdown().await?;
        assert!(reader.recv_byte().await.is_err());
        assert_remote_sees_eof(&mut remote).await;
        idle_writer.abort();
        Ok(())
    }

    #[tokio::test]
    async fn test_closer_releases_idle_connection() {
        let (conn, mut remote) = pair();
        conn.closer().close().unwrap();
        assert_remote_sees_eof(&mut remote).await;
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_partial_unit_survives_timeout() -> AppResult<()> {
        let (conn, mut remote) = pair();
        let (mut reader, _writer) = conn.into_split();
        reader.set_read_timeout(Some(Duration::from_millis(10)));
        let peer = tokio::spawn(async move {
            remote.write_all(&[1, 2]).await?;
            tokio::time::sleep(Duration::from_millis(50)).await;
            remote.write_all(&[3, 4]).await?;
            Ok::<_, std::io::Error>(remote)
        });
        let mut buf = [0u8; 4];
        reader.recv_exact(&mut buf).await?;
        assert_eq!(buf, [1, 2, 3, 4]);
        let _remote = peer.await.unwrap()?;
        Ok(())
    }

    #[tokio::test]
    async fn test_write_side_close_sends_eof() -> AppResult<()> {
        let (mut conn, mut remote) = pair();
        conn.send_bytes(b"bye").await?;
        conn.close().await?;
        let mut received = Vec::new();
        remote.read_to_end(&mut received).await?;
        assert_eq!(received, b"bye");
        Ok(())
    }
}

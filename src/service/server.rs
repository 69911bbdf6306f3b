use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::app_error::is_temporary_io_error;
use super::global_config;
use crate::{AppError, AppResult};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Accept backoff ceiling in seconds; past it the listener is given up on.
const MAX_ACCEPT_BACKOFF: u64 = 64;

/// Serves one accepted socket.
///
/// The handler owns the whole lifecycle of the connection it is given: its
/// read loop, its writes and its close. The server never closes it.
pub trait TcpConnectionHandler: Send + Sync + 'static {
    fn serve_tcp_connection(&self, socket: TcpStream) -> impl Future<Output = ()> + Send;
}

/// Errors that only concern the connection being accepted, not the listener.
fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    ) || is_temporary_io_error(err)
}

#[derive(Debug)]
pub struct Server<H> {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    tcp_nodelay: bool,
    handler: Arc<H>,
}

impl<H: TcpConnectionHandler> Server<H> {
    /// Binds `address`; failure is returned to the caller.
    pub async fn bind(address: &str, handler: Arc<H>) -> AppResult<Self> {
        let listener = TcpListener::bind(address).await.map_err(|err| {
            error!(
                "Failed to bind server to address: {} - Error: {}",
                address, err
            );
            AppError::from(err)
        })?;
        info!("tcp server binding to {} for listening", address);
        let network_conf = &global_config().network;
        Ok(Server {
            listener,
            limit_connections: Arc::new(Semaphore::new(network_conf.max_connection)),
            tcp_nodelay: network_conf.tcp_nodelay,
            handler,
        })
    }

    /// Caps the number of connections served at once.
    pub fn with_max_connections(mut self, max_connection: usize) -> Self {
        self.limit_connections = Arc::new(Semaphore::new(max_connection));
        self
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the listener becomes unusable.
    ///
    /// Each socket is handed to the handler on its own task; the loop goes
    /// straight back to accepting. A connection holds one permit of the
    /// connection limit until its handler returns.
    pub async fn run(&self) -> AppResult<()> {
        info!("accepting inbound connections");
        loop {
            let permit = self
                .limit_connections
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::Accept(format!("connection limiter closed: {}", e)))?;

            let (socket, peer) = self.accept().await?;
            let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
            debug!(connection_id, %peer, "accept new connection");
            if self.tcp_nodelay {
                if let Err(err) = socket.set_nodelay(true) {
                    warn!(connection_id, error = %err, "failed to set TCP_NODELAY");
                }
            }

            let handler = Arc::clone(&self.handler);
            let span = info_span!("connection", id = connection_id, %peer);
            tokio::spawn(
                async move {
                    handler.serve_tcp_connection(socket).await;
                    debug!("connection handler finished");
                    // whether gracefully or unexpectedly closed, release the slot
                    drop(permit);
                }
                .instrument(span),
            );
        }
    }

    async fn accept(&self) -> AppResult<(TcpStream, SocketAddr)> {
        let mut backoff = 1;
        loop {
            match self.listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(err) if is_transient_accept_error(&err) => {
                    warn!(error = %err, "transient accept error");
                    continue;
                }
                Err(err) => {
                    if backoff > MAX_ACCEPT_BACKOFF {
                        error!(error = %err, "accept keeps failing, giving up on listener");
                        return Err(AppError::Accept(format!(
                            "accept tcp server error: {}",
                            err
                        )));
                    }
                    warn!(error = %err, backoff, "accept failed, backing off");
                }
            }
            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

/// Binds `address` and serves forever, or fails with the bind error.
pub async fn serve_tcp<H: TcpConnectionHandler>(address: &str, handler: Arc<H>) -> AppResult<()> {
    Server::bind(address, handler).await?.run().await
}

impl<H> Drop for Server<H> {
    fn drop(&mut self) {
        debug!("tcp server dropped");
    }
}

use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error};

use super::server::TcpConnectionHandler;
use super::Shutdown;
use crate::network::PacketConnection;
use crate::{is_temporary_net_error, AppError};

/// Echoes every received packet back to its sender.
///
/// Each connection is closed when the shutdown notification fires. It keeps a
/// clone of `shutdown_complete_tx` until it has closed, so the owner can wait
/// for all connections to drain.
#[derive(Debug)]
pub struct PacketEchoHandler {
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
}

impl PacketEchoHandler {
    pub fn new(
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Self {
        PacketEchoHandler {
            notify_shutdown,
            shutdown_complete_tx,
        }
    }
}

impl TcpConnectionHandler for PacketEchoHandler {
    async fn serve_tcp_connection(&self, socket: TcpStream) {
        let _shutdown_complete = self.shutdown_complete_tx.clone();
        let mut connection = PacketConnection::new(socket);
        let watcher =
            Shutdown::subscribe(&self.notify_shutdown).close_on_shutdown(connection.closer());

        loop {
            match connection.recv_packet().await {
                Ok(packet) => {
                    if let Err(err) = connection.send_packet(&packet).await {
                        error!(error = %err, "echo send failed");
                        break;
                    }
                    packet.release();
                }
                Err(err) if is_temporary_net_error(&err) => continue,
                Err(AppError::PeerClosed(reason)) => {
                    debug!(%reason, "peer closed connection");
                    break;
                }
                Err(AppError::ConnectionClosed) => {
                    debug!("echo handler exit read loop after shutdown");
                    break;
                }
                Err(err) => {
                    error!(error = %err, "connection error");
                    break;
                }
            }
        }
        watcher.abort();
        // already closed after a permanent error or shutdown
        let _ = connection.close().await;
    }
}

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{trace, warn};

use super::binary::{BinaryConnection, BinaryReader, BinaryWriter};
use super::packet::Packet;
use super::pool::PacketPool;
use super::raw::{close_pair, Closer, NetStream};
use crate::service::{global_config, PacketConfig};
use crate::{AppError, AppResult};

/// Payload bytes a receive commits before any of them arrive.
const RECV_CHUNK_LEN: usize = 64 * 1024;

/// End of the next payload region to fill. The region doubles with what
/// has been received, so a peer that announces a large frame and stalls
/// holds at most one chunk of memory.
fn next_recv_end(received: usize, payload_len: usize) -> usize {
    payload_len.min(received.saturating_mul(2).max(RECV_CHUNK_LEN))
}

/// Receive direction of a packet connection.
#[derive(Debug)]
pub struct PacketReceiver<S = TcpStream> {
    binary: BinaryReader<S>,
    pool: PacketPool,
    max_payload_len: usize,
}

impl<S: NetStream> PacketReceiver<S> {
    pub fn new(binary: BinaryReader<S>, config: &PacketConfig, pool: PacketPool) -> Self {
        PacketReceiver {
            binary,
            pool,
            max_payload_len: config.max_payload_len,
        }
    }

    /// Receives one frame.
    ///
    /// A transient error before the length header arrives is returned as is
    /// and the connection stays usable. Once the header is read the whole
    /// payload is read, retrying transient errors, so the next call starts on
    /// a frame boundary. A claimed length above the configured maximum closes
    /// the connection.
    pub async fn recv_packet(&mut self) -> AppResult<Packet> {
        let payload_len = self.binary.recv_u32().await? as usize;
        if payload_len > self.max_payload_len {
            warn!(
                payload_len,
                max_payload_len = self.max_payload_len,
                "frame too large, closing connection"
            );
            self.binary.raw_mut().abort();
            return Err(AppError::MessageTooLarge(format!(
                "frame of length {} exceeds max payload length {}",
                payload_len, self.max_payload_len
            )));
        }

        // storage grows with the bytes that actually arrive, not the claim
        let mut packet = self
            .pool
            .acquire_with_capacity(payload_len.min(RECV_CHUNK_LEN));
        let mut received = 0;
        while received < payload_len {
            let end = next_recv_end(received, payload_len);
            self.binary
                .raw_mut()
                .recv_exact_continued(&mut packet.recv_region(end)[received..])
                .await?;
            received = end;
        }
        packet.set_payload_len(payload_len);
        trace!(payload_len, "recv packet");
        Ok(packet)
    }

    pub fn set_read_timeout(&mut self, read_timeout: Option<Duration>) {
        self.binary.raw_mut().set_read_timeout(read_timeout);
    }

    pub fn closer(&self) -> Closer {
        self.binary.raw().closer()
    }

    pub fn is_closed(&self) -> bool {
        self.binary.raw().is_closed()
    }

    pub fn close(&mut self) -> AppResult<()> {
        self.binary.raw_mut().close()
    }
}

/// Send direction of a packet connection.
#[derive(Debug)]
pub struct PacketSender<S = TcpStream> {
    binary: BinaryWriter<S>,
    max_payload_len: usize,
}

impl<S: NetStream> PacketSender<S> {
    pub fn new(binary: BinaryWriter<S>, config: &PacketConfig) -> Self {
        PacketSender {
            binary,
            max_payload_len: config.max_payload_len,
        }
    }

    /// Sends `packet` as one frame: u32 length header, payload, flush.
    ///
    /// Payloads above the maximum are refused before anything is written,
    /// leaving the connection open.
    pub async fn send_packet(&mut self, packet: &Packet) -> AppResult<()> {
        let payload = packet.payload();
        if payload.len() > self.max_payload_len {
            return Err(AppError::MessageTooLarge(format!(
                "packet of length {} exceeds max payload length {}",
                payload.len(),
                self.max_payload_len
            )));
        }
        let len = u32::try_from(payload.len()).map_err(|_| {
            AppError::MessageTooLarge(format!(
                "packet of length {} does not fit the length header",
                payload.len()
            ))
        })?;
        self.binary.send_u32_prefixed(len, payload).await?;
        trace!(payload_len = len, "sent packet");
        Ok(())
    }

    pub fn closer(&self) -> Closer {
        self.binary.raw().closer()
    }

    pub fn is_closed(&self) -> bool {
        self.binary.raw().is_closed()
    }

    pub async fn close(&mut self) -> AppResult<()> {
        self.binary.raw_mut().close().await
    }
}

/// Length-framed messages over one socket.
///
/// Wire format: repeating `[u32 big-endian length][length bytes]`.
#[derive(Debug)]
pub struct PacketConnection<S = TcpStream> {
    receiver: PacketReceiver<S>,
    sender: PacketSender<S>,
    pool: PacketPool,
}

impl<S: NetStream> PacketConnection<S> {
    /// Uses the installed config and the process-wide pool.
    pub fn new(stream: S) -> Self {
        Self::with_config(stream, &global_config().packet, PacketPool::global())
    }

    pub fn with_config(stream: S, config: &PacketConfig, pool: PacketPool) -> Self {
        Self::from_binary(BinaryConnection::new(stream), config, pool)
    }

    pub fn from_binary(
        binary: BinaryConnection<S>,
        config: &PacketConfig,
        pool: PacketPool,
    ) -> Self {
        let (reader, writer) = binary.into_split();
        PacketConnection {
            receiver: PacketReceiver::new(reader, config, pool.clone()),
            sender: PacketSender::new(writer, config),
            pool,
        }
    }

    /// An empty packet from this connection's pool.
    pub fn new_packet(&self) -> Packet {
        self.pool.acquire()
    }

    pub fn pool(&self) -> &PacketPool {
        &self.pool
    }

    pub async fn send_packet(&mut self, packet: &Packet) -> AppResult<()> {
        self.sender.send_packet(packet).await
    }

    pub async fn recv_packet(&mut self) -> AppResult<Packet> {
        self.receiver.recv_packet().await
    }

    pub fn set_read_timeout(&mut self, read_timeout: Option<Duration>) {
        self.receiver.set_read_timeout(read_timeout);
    }

    pub fn closer(&self) -> Closer {
        self.receiver.closer()
    }

    pub fn is_closed(&self) -> bool {
        self.receiver.is_closed()
    }

    pub async fn close(&mut self) -> AppResult<()> {
        close_pair(
            self.receiver.binary.raw_mut(),
            self.sender.binary.raw_mut(),
        )
        .await
    }

    /// Splits into independently owned directions for full-duplex use.
    pub fn into_split(self) -> (PacketReceiver<S>, PacketSender<S>) {
        (self.receiver, self.sender)
    }
}

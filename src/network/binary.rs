//! Fixed-width integers over a raw connection.
//!
//! Every value is big-endian (network order) with no length prefix; both
//! peers must agree on the sequence of value types.

use std::time::Duration;

use tokio::net::TcpStream;

use super::raw::{close_pair, Closer, NetStream, RawConnection, RawReader, RawWriter};
use crate::AppResult;

#[derive(Debug)]
pub struct BinaryReader<S = TcpStream> {
    raw: RawReader<S>,
}

impl<S: NetStream> BinaryReader<S> {
    pub fn new(raw: RawReader<S>) -> Self {
        BinaryReader { raw }
    }

    pub fn raw(&self) -> &RawReader<S> {
        &self.raw
    }

    pub fn raw_mut(&mut self) -> &mut RawReader<S> {
        &mut self.raw
    }

    pub async fn recv_byte(&mut self) -> AppResult<u8> {
        self.raw.recv_byte().await
    }

    pub async fn recv_u16(&mut self) -> AppResult<u16> {
        let mut buf = [0u8; 2];
        self.raw.recv_exact(&mut buf).await?;
        Ok(u16::from_be_bytes(buf))
    }

    pub async fn recv_u32(&mut self) -> AppResult<u32> {
        let mut buf = [0u8; 4];
        self.raw.recv_exact(&mut buf).await?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Reads exactly 8 bytes, looping over short reads.
    pub async fn recv_u64(&mut self) -> AppResult<u64> {
        let mut buf = [0u8; 8];
        self.raw.recv_exact(&mut buf).await?;
        Ok(u64::from_be_bytes(buf))
    }
}

#[derive(Debug)]
pub struct BinaryWriter<S = TcpStream> {
    raw: RawWriter<S>,
}

impl<S: NetStream> BinaryWriter<S> {
    pub fn new(raw: RawWriter<S>) -> Self {
        BinaryWriter { raw }
    }

    pub fn raw(&self) -> &RawWriter<S> {
        &self.raw
    }

    pub fn raw_mut(&mut self) -> &mut RawWriter<S> {
        &mut self.raw
    }

    pub async fn send_byte(&mut self, b: u8) -> AppResult<()> {
        self.raw.send_byte(b).await
    }

    pub async fn send_u16(&mut self, v: u16) -> AppResult<()> {
        self.raw.send_bytes(&v.to_be_bytes()).await
    }

    pub async fn send_u32(&mut self, v: u32) -> AppResult<()> {
        self.raw.send_bytes(&v.to_be_bytes()).await
    }

    pub async fn send_u64(&mut self, v: u64) -> AppResult<()> {
        self.raw.send_bytes(&v.to_be_bytes()).await
    }

    /// Writes `body` behind its u32 length in a single flushed sequence.
    pub(crate) async fn send_u32_prefixed(&mut self, len: u32, body: &[u8]) -> AppResult<()> {
        self.raw.send_parts(&[&len.to_be_bytes(), body]).await
    }
}

#[derive(Debug)]
pub struct BinaryConnection<S = TcpStream> {
    reader: BinaryReader<S>,
    writer: BinaryWriter<S>,
}

impl<S: NetStream> BinaryConnection<S> {
    pub fn new(stream: S) -> Self {
        Self::from_raw(RawConnection::new(stream))
    }

    pub fn from_raw(raw: RawConnection<S>) -> Self {
        let (reader, writer) = raw.into_split();
        BinaryConnection {
            reader: BinaryReader::new(reader),
            writer: BinaryWriter::new(writer),
        }
    }

    pub async fn send_byte(&mut self, b: u8) -> AppResult<()> {
        self.writer.send_byte(b).await
    }

    pub async fn recv_byte(&mut self) -> AppResult<u8> {
        self.reader.recv_byte().await
    }

    pub async fn send_u16(&mut self, v: u16) -> AppResult<()> {
        self.writer.send_u16(v).await
    }

    pub async fn recv_u16(&mut self) -> AppResult<u16> {
        self.reader.recv_u16().await
    }

    pub async fn send_u32(&mut self, v: u32) -> AppResult<()> {
        self.writer.send_u32(v).await
    }

    pub async fn recv_u32(&mut self) -> AppResult<u32> {
        self.reader.recv_u32().await
    }

    pub async fn send_u64(&mut self, v: u64) -> AppResult<()> {
        self.writer.send_u64(v).await
    }

    pub async fn recv_u64(&mut self) -> AppResult<u64> {
        self.reader.recv_u64().await
    }

    pub fn set_read_timeout(&mut self, read_timeout: Option<Duration>) {
        self.reader.raw_mut().set_read_timeout(read_timeout);
    }

    pub fn closer(&self) -> Closer {
        self.reader.raw().closer()
    }

    pub fn is_closed(&self) -> bool {
        self.reader.raw().is_closed()
    }

    pub async fn close(&mut self) -> AppResult<()> {
        close_pair(self.reader.raw_mut(), self.writer.raw_mut()).await
    }

    pub fn into_split(self) -> (BinaryReader<S>, BinaryWriter<S>) {
        (self.reader, self.writer)
    }
}

use std::fmt;

use bytes::{Buf, Bytes};

use super::pool::PacketPool;
use crate::{AppError, AppResult};

/// Smallest capacity growth ever produces.
const MIN_GROW_CAPACITY: usize = 8;

/// Capacity after doubling `current` until it holds `needed` bytes.
///
/// Doubling keeps appends amortised O(1).
pub(crate) fn grown_capacity(current: usize, needed: usize) -> usize {
    let mut capacity = current.max(MIN_GROW_CAPACITY);
    while capacity < needed {
        capacity = capacity.saturating_mul(2);
    }
    capacity
}

/// Payload container for one frame.
///
/// The backing storage is fully initialised and its length is the packet's
/// capacity; `payload_len` marks how much of it is content. Bytes past
/// `payload_len` may hold data from an earlier use and are never exposed.
///
/// Dropping a packet hands its storage back to the pool it came from, so a
/// buffer is either owned by exactly one `Packet` or resident in the pool.
pub struct Packet {
    buf: Vec<u8>,
    payload_len: usize,
    pool: PacketPool,
}

impl Packet {
    pub(crate) fn from_pool(buf: Vec<u8>, pool: PacketPool) -> Self {
        Packet {
            buf,
            payload_len: 0,
            pool,
        }
    }

    /// Acquires an empty packet from the process-wide pool.
    pub fn new() -> Self {
        PacketPool::global().acquire()
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.payload_len]
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload_len == 0
    }

    /// Drops the content, keeping the storage.
    pub fn clear(&mut self) {
        self.payload_len = 0;
    }

    fn reserve(&mut self, additional: usize) {
        let needed = self.payload_len + additional;
        if needed > self.buf.len() {
            let capacity = grown_capacity(self.buf.len(), needed);
            self.buf.resize(capacity, 0);
        }
    }

    pub fn append_byte(&mut self, b: u8) {
        self.reserve(1);
        self.buf[self.payload_len] = b;
        self.payload_len += 1;
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        self.buf[self.payload_len..self.payload_len + bytes.len()].copy_from_slice(bytes);
        self.payload_len += bytes.len();
    }

    pub fn append_bool(&mut self, v: bool) {
        self.append_byte(v as u8);
    }

    pub fn append_u16(&mut self, v: u16) {
        self.append_bytes(&v.to_be_bytes());
    }

    pub fn append_u32(&mut self, v: u32) {
        self.append_bytes(&v.to_be_bytes());
    }

    pub fn append_u64(&mut self, v: u64) {
        self.append_bytes(&v.to_be_bytes());
    }

    pub fn append_f32(&mut self, v: f32) {
        self.append_bytes(&v.to_be_bytes());
    }

    pub fn append_f64(&mut self, v: f64) {
        self.append_bytes(&v.to_be_bytes());
    }

    /// Appends `bytes` behind a u32 length.
    pub fn append_var_bytes(&mut self, bytes: &[u8]) -> AppResult<()> {
        let len = u32::try_from(bytes.len()).map_err(|_| {
            AppError::MessageTooLarge(format!(
                "var bytes of length {} do not fit a u32 prefix",
                bytes.len()
            ))
        })?;
        self.append_u32(len);
        self.append_bytes(bytes);
        Ok(())
    }

    pub fn append_var_str(&mut self, s: &str) -> AppResult<()> {
        self.append_var_bytes(s.as_bytes())
    }

    pub fn reader(&self) -> PacketReader<'_> {
        PacketReader::new(self.payload())
    }

    /// Copies the payload out so the packet can be released right away.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.payload())
    }

    /// Returns the packet's storage to its pool.
    pub fn release(mut self) {
        self.payload_len = 0;
    }

    /// Grows the storage to hold `len` bytes and exposes exactly that region
    /// for a receive to fill. The payload length is left untouched.
    pub(crate) fn recv_region(&mut self, len: usize) -> &mut [u8] {
        if len > self.buf.len() {
            let capacity = grown_capacity(self.buf.len(), len);
            self.buf.resize(capacity, 0);
        }
        &mut self.buf[..len]
    }

    pub(crate) fn set_payload_len(&mut self, len: usize) {
        debug_assert!(len <= self.buf.len());
        self.payload_len = len;
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        self.payload_len = 0;
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("payload_len", &self.payload_len)
            .field("capacity", &self.buf.len())
            .finish()
    }
}

/// Cursor over a packet payload, decoding the big-endian values the
/// `append_*` methods write.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        PacketReader { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn ensure(&self, needed: usize, what: &str) -> AppResult<()> {
        if self.buf.remaining() < needed {
            return Err(AppError::MalformedProtocol(format!(
                "packet underflow reading {}: need {} bytes, {} left",
                what,
                needed,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> AppResult<u8> {
        self.ensure(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> AppResult<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(AppError::MalformedProtocol(format!(
                "invalid bool byte {}",
                other
            ))),
        }
    }

    pub fn read_u16(&mut self) -> AppResult<u16> {
        self.ensure(2, "u16")?;
        Ok(self.buf.get_u16())
    }

    pub fn read_u32(&mut self) -> AppResult<u32> {
        self.ensure(4, "u32")?;
        Ok(self.buf.get_u32())
    }

    pub fn read_u64(&mut self) -> AppResult<u64> {
        self.ensure(8, "u64")?;
        Ok(self.buf.get_u64())
    }

    pub fn read_f32(&mut self) -> AppResult<f32> {
        self.ensure(4, "f32")?;
        Ok(self.buf.get_f32())
    }

    pub fn read_f64(&mut self) -> AppResult<f64> {
        self.ensure(8, "f64")?;
        Ok(self.buf.get_f64())
    }

    pub fn read_bytes(&mut self, len: usize) -> AppResult<&'a [u8]> {
        self.ensure(len, "bytes")?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_var_bytes(&mut self) -> AppResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    pub fn read_var_str(&mut self) -> AppResult<&'a str> {
        let bytes = self.read_var_bytes()?;
        std::str::from_utf8(bytes)
            .map_err(|e| AppError::MalformedProtocol(format!("invalid utf-8 string: {}", e)))
    }
}

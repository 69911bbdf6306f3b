//! Network Module Implementation
//!
//! Three connection layers over one bidirectional byte stream, each usable
//! on its own:
//!
//! - `RawConnection`: unframed bytes, flushed on every send
//! - `BinaryConnection`: fixed-width big-endian integers
//! - `PacketConnection`: `[u32 length][payload]` frames carried in pooled
//!   `Packet` buffers
//!
//! Each layer owns the one below it per direction (reader/writer), so
//! `into_split` gives full-duplex halves at every level. All layers share
//! one close state per connection: a permanent error or an explicit close on
//! either half closes both, and a `Closer` can abort a blocked call from
//! another task.
//!
//! Errors are classified once, at the raw layer. Higher layers only retry to
//! finish a unit they have started (one integer, one frame) and otherwise
//! pass the error up unchanged.

pub use binary::{BinaryConnection, BinaryReader, BinaryWriter};
pub use packet::{Packet, PacketReader};
pub use packet_connection::{PacketConnection, PacketReceiver, PacketSender};
pub use pool::{PacketPool, PoolStats};
pub use raw::{Closer, NetStream, RawConnection, RawReader, RawWriter};

mod binary;
mod packet;
mod packet_connection;
mod pool;
mod raw;

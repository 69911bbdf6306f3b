mod network;
mod service;

pub use network::{
    BinaryConnection, BinaryReader, BinaryWriter, Closer, NetStream, Packet, PacketConnection,
    PacketPool, PacketReader, PacketReceiver, PacketSender, PoolStats, RawConnection, RawReader,
    RawWriter,
};
pub use service::{
    global_config, is_temporary_io_error, is_temporary_net_error, serve_tcp, setup_local_tracing,
    setup_tracing, AppError, AppResult, ConnectionConfig, NetConfig, NetworkConfig,
    PacketConfig, PacketEchoHandler, Server, Shutdown, TcpConnectionHandler, TracingGuard,
    GLOBAL_CONFIG,
};

pub use app_error::{is_temporary_io_error, is_temporary_net_error, AppError, AppResult};
pub use self::config::{
    global_config, ConnectionConfig, NetConfig, NetworkConfig, PacketConfig, GLOBAL_CONFIG,
};
pub use echo::PacketEchoHandler;
pub use server::{serve_tcp, Server, TcpConnectionHandler};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, TracingGuard};

mod app_error;
mod config;
mod echo;
mod server;
mod shutdown;
mod tracing_config;

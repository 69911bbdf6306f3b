extern crate config as _;

use std::path::Path;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

pub static GLOBAL_CONFIG: OnceCell<NetConfig> = OnceCell::new();

/// The installed process-wide config, or the defaults if none was installed.
pub fn global_config() -> &'static NetConfig {
    GLOBAL_CONFIG.get_or_init(NetConfig::default)
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    /// Disable Nagle on accepted sockets so small frames leave immediately.
    pub tcp_nodelay: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 9100,
            max_connection: 10_000,
            tcp_nodelay: true,
        }
    }
}

impl NetworkConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Packet sizing and pool retention limits.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PacketConfig {
    /// Capacity of a freshly allocated packet.
    pub default_capacity: usize,
    /// Largest payload accepted from a peer or sent to one.
    pub max_payload_len: usize,
    /// Number of released buffers the pool keeps; extra releases are dropped.
    pub pool_max_packets: usize,
    /// Buffers grown beyond this capacity are dropped instead of pooled.
    pub pool_max_packet_capacity: usize,
}

impl Default for PacketConfig {
    fn default() -> Self {
        PacketConfig {
            default_capacity: 128,
            max_payload_len: 32 * 1024 * 1024,
            pool_max_packets: 1024,
            pool_max_packet_capacity: 1024 * 1024,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// 0 disables the read deadline.
    pub read_timeout_ms: u64,
}

impl ConnectionConfig {
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct NetConfig {
    pub network: NetworkConfig,
    pub packet: PacketConfig,
    pub connection: ConnectionConfig,
}

impl NetConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<NetConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let net_config: NetConfig = config.try_deserialize()?;
        net_config.validate()?;

        Ok(net_config)
    }

    fn validate(&self) -> AppResult<()> {
        if self.packet.default_capacity == 0 {
            return Err(AppError::InvalidValue(
                "packet.default_capacity must be greater than 0".to_string(),
            ));
        }
        if self.packet.max_payload_len > u32::MAX as usize {
            return Err(AppError::InvalidValue(format!(
                "packet.max_payload_len {} does not fit the 32-bit length header",
                self.packet.max_payload_len
            )));
        }
        if self.network.max_connection == 0 {
            return Err(AppError::InvalidValue(
                "network.max_connection must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_full_config() -> AppResult<()> {
        let file = write_config(
            r#"
[network]
ip = "0.0.0.0"
port = 4001
max_connection = 16
tcp_nodelay = false

[packet]
default_capacity = 64
max_payload_len = 65536
pool_max_packets = 8
pool_max_packet_capacity = 4096

[connection]
read_timeout_ms = 250
"#,
        );
        let config = NetConfig::set_up_config(file.path())?;
        assert_eq!(config.network.listen_address(), "0.0.0.0:4001");
        assert_eq!(config.network.max_connection, 16);
        assert!(!config.network.tcp_nodelay);
        assert_eq!(config.packet.default_capacity, 64);
        assert_eq!(config.packet.max_payload_len, 65536);
        assert_eq!(config.packet.pool_max_packets, 8);
        assert_eq!(config.packet.pool_max_packet_capacity, 4096);
        assert_eq!(
            config.connection.read_timeout(),
            Some(Duration::from_millis(250))
        );
        Ok(())
    }

    #[test]
    fn test_missing_sections_use_defaults() -> AppResult<()> {
        let file = write_config(
            r#"
[network]
port = 4002
"#,
        );
        let config = NetConfig::set_up_config(file.path())?;
        assert_eq!(config.network.port, 4002);
        assert_eq!(config.network.ip, "127.0.0.1");
        assert!(config.network.tcp_nodelay);
        assert_eq!(config.packet, PacketConfig::default());
        assert_eq!(config.connection.read_timeout(), None);
        Ok(())
    }

    #[test]
    fn test_reject_oversized_payload_limit() {
        let file = write_config(
            r#"
[packet]
max_payload_len = 8589934592
"#,
        );
        let result = NetConfig::set_up_config(file.path());
        assert!(matches!(result, Err(AppError::InvalidValue(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = NetConfig::set_up_config("/nonexistent/gamenet.toml");
        assert!(matches!(result, Err(AppError::ConfigFileError(_))));
    }
}

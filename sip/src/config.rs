use anyhow::Result;
use serde::Deserialize;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

/// Idle transports are closed this many seconds after their last reference
/// is released.
pub const DEFAULT_IDLE_TIMEOUT: u64 = 30;
pub const DEFAULT_MAX_PACKET_LEN: usize = 4000;
pub const DEFAULT_MAX_RX_BUFFER: usize = 4000;
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 5;
pub const DEFAULT_SIP_PORT: u16 = 5060;

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// seconds
    pub idle_timeout: u64,
    pub max_packet_len: usize,
    /// largest partial message a stream transport may buffer
    pub max_rx_buffer: usize,
    /// seconds
    pub connect_timeout: u64,
    pub udp_bind: SocketAddr,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_packet_len: DEFAULT_MAX_PACKET_LEN,
            max_rx_buffer: DEFAULT_MAX_RX_BUFFER,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            udp_bind: SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::UNSPECIFIED,
                DEFAULT_SIP_PORT,
            )),
        }
    }
}

impl TransportConfig {
    pub fn from_toml(contents: &str) -> Result<TransportConfig> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<TransportConfig> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

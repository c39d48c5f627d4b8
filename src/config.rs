use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

/// Maximum payload length of a single protocol message (4 MB)
pub const MAX_PROTOCOL_MESSAGE_LENGTH: u32 = 4_000_000;

/// Maximum entries in an inv / getdata / notfound message
pub const MAX_INV_SZ: usize = 50_000;

/// Maximum headers in a single headers message
pub const MAX_HEADERS_RESULTS: usize = 2_000;

/// Maximum addresses in a single addr message
pub const MAX_ADDR_TO_SEND: usize = 1_000;

/// Misbehavior score at which a peer is disconnected
pub const DEFAULT_MISBEHAVIOR_THRESHOLD: u32 = 100;

/// Queued bytes per peer before its socket reads are paused (5 MB)
pub const DEFAULT_RECEIVE_FLOOD_SIZE: usize = 5_000_000;

/// Unsent bytes per peer before its socket reads are paused (1 MB)
pub const DEFAULT_SEND_FLOOD_SIZE: usize = 1_000_000;

/// Maximum number of inbound peers
pub const DEFAULT_MAX_INBOUND: usize = 125;

/// Lines retained by the in-memory debug log
pub const DEFAULT_DEBUG_LOG_CAPACITY: usize = 10_000;

/// Protocol version advertised in our version message
pub const PROTOCOL_VERSION: i32 = 70015;

/// User agent advertised in our version message
pub const USER_AGENT: &str = "/p2pframe:0.3.0/";

/// Bind address for P2P; 0.0.0.0 accepts peers from anywhere
pub const P2P_BIND_ADDRESS: &str = "0.0.0.0";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown network: {0}")]
    UnknownNetwork(String),
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config file error: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    /// Message start bytes prefixing every frame on this network
    pub fn magic(self) -> [u8; 4] {
        match self {
            Network::Mainnet => [0xf9, 0xbe, 0xb4, 0xd9],
            Network::Testnet => [0x0b, 0x11, 0x09, 0x07],
            Network::Regtest => [0xfa, 0xbf, 0xb5, 0xda],
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Network::Mainnet => 8333,
            Network::Testnet => 18333,
            Network::Regtest => 18444,
        }
    }
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Ok(Network::Mainnet),
            "test" | "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(ConfigError::UnknownNetwork(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: Network,
    pub bind_address: String,
    pub p2p_port: u16,
    pub max_message_length: u32,
    pub misbehavior_threshold: u32,
    pub receive_flood_size: usize,
    pub send_flood_size: usize,
    pub max_inbound: usize,
    pub debug_log_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::for_network(Network::Mainnet)
    }
}

impl NodeConfig {
    pub fn for_network(network: Network) -> Self {
        NodeConfig {
            network,
            bind_address: P2P_BIND_ADDRESS.to_string(),
            p2p_port: network.default_port(),
            max_message_length: MAX_PROTOCOL_MESSAGE_LENGTH,
            misbehavior_threshold: DEFAULT_MISBEHAVIOR_THRESHOLD,
            receive_flood_size: DEFAULT_RECEIVE_FLOOD_SIZE,
            send_flood_size: DEFAULT_SEND_FLOOD_SIZE,
            max_inbound: DEFAULT_MAX_INBOUND,
            debug_log_capacity: DEFAULT_DEBUG_LOG_CAPACITY,
        }
    }

    /// Regtest on loopback with an OS-assigned port, for tests
    pub fn local_regtest() -> Self {
        NodeConfig {
            bind_address: "127.0.0.1".to_string(),
            p2p_port: 0,
            ..Self::for_network(Network::Regtest)
        }
    }

    /// Load a JSON config file; missing keys fall back to mainnet defaults
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Apply P2PFRAME_* environment overrides on top of this config
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(n) = std::env::var("P2PFRAME_NETWORK") {
            let network: Network = n.parse()?;
            // Only move the port along with the network if it was not customised
            if self.p2p_port == self.network.default_port() {
                self.p2p_port = network.default_port();
            }
            self.network = network;
        }
        if let Ok(b) = std::env::var("P2PFRAME_BIND") {
            self.bind_address = b;
        }
        if let Ok(p) = std::env::var("P2PFRAME_P2P_PORT") {
            self.p2p_port = parse_env("P2PFRAME_P2P_PORT", &p)?;
        }
        if let Ok(v) = std::env::var("P2PFRAME_MAX_RECEIVE_BUFFER") {
            self.receive_flood_size = parse_env("P2PFRAME_MAX_RECEIVE_BUFFER", &v)?;
        }
        if let Ok(v) = std::env::var("P2PFRAME_MAX_SEND_BUFFER") {
            self.send_flood_size = parse_env("P2PFRAME_MAX_SEND_BUFFER", &v)?;
        }
        if let Ok(v) = std::env::var("P2PFRAME_MISBEHAVIOR_THRESHOLD") {
            self.misbehavior_threshold = parse_env("P2PFRAME_MISBEHAVIOR_THRESHOLD", &v)?;
        }
        Ok(self)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = format!("{}:{}", self.bind_address, self.p2p_port);
        raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: "bind_address",
            value: raw,
        })
    }

    pub fn magic(&self) -> [u8; 4] {
        self.network.magic()
    }
}

fn parse_env<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_network_magic() {
        assert_eq!(Network::Mainnet.magic(), [0xf9, 0xbe, 0xb4, 0xd9]);
        assert_eq!(Network::Regtest.magic(), [0xfa, 0xbf, 0xb5, 0xda]);
        assert_eq!("REGTEST".parse::<Network>().unwrap(), Network::Regtest);
        assert!("signet2".parse::<Network>().is_err());
    }

    #[test]
    fn test_defaults() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.max_message_length, 4_000_000);
        assert_eq!(cfg.misbehavior_threshold, 100);
        assert_eq!(cfg.p2p_port, 8333);
        assert_eq!(cfg.send_flood_size, 1_000_000);
    }

    #[test]
    fn test_local_regtest_listen_addr() {
        let cfg = NodeConfig::local_regtest();
        assert_eq!(cfg.listen_addr().unwrap().to_string(), "127.0.0.1:0");
    }

    #[test]
    fn test_load_file_partial() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"network": "testnet", "p2p_port": 19000, "misbehavior_threshold": 50}}"#).unwrap();
        let cfg = NodeConfig::load_file(f.path()).unwrap();
        assert_eq!(cfg.network, Network::Testnet);
        assert_eq!(cfg.p2p_port, 19000);
        assert_eq!(cfg.misbehavior_threshold, 50);
        assert_eq!(cfg.receive_flood_size, DEFAULT_RECEIVE_FLOOD_SIZE);
    }

    #[test]
    fn test_bad_bind_address() {
        let cfg = NodeConfig {
            bind_address: "not-an-ip".to_string(),
            ..NodeConfig::local_regtest()
        };
        assert!(matches!(cfg.listen_addr(), Err(ConfigError::InvalidValue { .. })));
    }
}

//
// Copyright 2018-2019 Tamas Blummer
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
//!
//! # Configuration
//!
//! Typed, validated configuration loaded from a TOML file. Every field has a sane default
//! so an empty file is a runnable mainnet configuration.
//!

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use crate::error::{Result, SprunedError};
use crate::types::ServerAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkChoice {
    Mainnet,
    Testnet,
}

impl From<NetworkChoice> for bitcoin::Network {
    fn from(n: NetworkChoice) -> Self {
        match n {
            NetworkChoice::Mainnet => bitcoin::Network::Bitcoin,
            NetworkChoice::Testnet => bitcoin::Network::Testnet,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub bind: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            bind: "127.0.0.1".to_owned(),
            port: 8332,
            user: "spruned".to_owned(),
            password: String::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkChoice,
    pub rpc: RpcConfig,
    pub data_dir: String,
    pub cache_size_bytes: u64,
    pub keep_blocks: u32,
    pub mempool_size: usize,
    pub zmq_enabled: bool,
    pub zmq_bind: String,
    pub use_tor: bool,
    pub electrum_servers: Vec<ServerAddr>,
    pub p2p_peers: Vec<SocketAddr>,
    pub min_sources: usize,
    pub required_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            network: NetworkChoice::Mainnet,
            rpc: RpcConfig::default(),
            data_dir: "./spruned-data".to_owned(),
            cache_size_bytes: 256 * 1024 * 1024,
            keep_blocks: 50,
            mempool_size: 0,
            zmq_enabled: false,
            zmq_bind: "tcp://127.0.0.1:28332".to_owned(),
            use_tor: false,
            electrum_servers: Vec::new(),
            p2p_peers: Vec::new(),
            min_sources: 3,
            required_connections: 3,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let text = fs::read_to_string(path).map_err(SprunedError::config_io)?;
        Config::from_str(&text)
    }

    pub fn from_str(text: &str) -> Result<Config> {
        let config: Config = toml::from_str(text).map_err(|e| SprunedError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.min_sources == 0 {
            return Err(SprunedError::config("min_sources must be at least 1"));
        }
        if self.required_connections == 0 && !self.p2p_peers.is_empty() {
            return Err(SprunedError::config("required_connections must be at least 1 when p2p_peers is set"));
        }
        if self.min_sources > self.required_connections {
            return Err(SprunedError::config("min_sources must not exceed required_connections"));
        }
        if self.electrum_servers.is_empty() && self.p2p_peers.is_empty() {
            return Err(SprunedError::config(
                "at least one of electrum_servers or p2p_peers must be configured",
            ));
        }
        Ok(())
    }
}

impl SprunedError {
    fn config_io(e: std::io::Error) -> SprunedError {
        SprunedError::config(format!("could not read config file: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_rejects_no_sources() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn minimal_toml_parses_with_defaults() {
        let text = r#"
            p2p_peers = ["127.0.0.1:8333"]
        "#;
        let config = Config::from_str(text).unwrap();
        assert_eq!(config.min_sources, 3);
        assert_eq!(config.required_connections, 3);
        assert_eq!(config.p2p_peers.len(), 1);
    }

    #[test]
    fn rejects_zero_min_sources() {
        let text = r#"
            p2p_peers = ["127.0.0.1:8333"]
            min_sources = 0
        "#;
        assert!(Config::from_str(text).is_err());
    }

    #[test]
    fn rejects_min_sources_exceeding_required_connections() {
        let text = r#"
            p2p_peers = ["127.0.0.1:8333"]
            min_sources = 5
            required_connections = 3
        "#;
        assert!(Config::from_str(text).is_err());
    }
}

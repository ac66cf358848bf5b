//! Daemon configuration: TOML file with CLI overlay.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub default_rpc_timeout: Duration,
    pub mount_root: PathBuf,
    /// Capacity of each session's outbound channel -- the buffer a
    /// `Filesystem` callback's RPC frame and a dispatcher response sit in
    /// before the connection's write side drains them. A slow writer backs
    /// up into this before a caller ever blocks on it.
    pub worker_channel_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: "127.0.0.1:7500".parse().unwrap(),
            default_rpc_timeout: Duration::from_secs(10),
            mount_root: PathBuf::from("/var/lib/webmount"),
            worker_channel_count: 64,
        }
    }
}

/// Mirrors `Config`, but every field is optional, since it is loaded from
/// a TOML file a deployment may only partially populate; unset fields
/// fall back to `Config::default()`.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    bind_addr: Option<SocketAddr>,
    default_rpc_timeout_ms: Option<u64>,
    mount_root: Option<PathBuf>,
    worker_channel_count: Option<usize>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(file.into_config())
    }
}

impl FileConfig {
    fn into_config(self) -> Config {
        let default = Config::default();
        Config {
            bind_addr: self.bind_addr.unwrap_or(default.bind_addr),
            default_rpc_timeout: self
                .default_rpc_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(default.default_rpc_timeout),
            mount_root: self.mount_root.unwrap_or(default.mount_root),
            worker_channel_count: self.worker_channel_count.unwrap_or(default.worker_channel_count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_config_falls_back_to_defaults() {
        let file: FileConfig = toml::from_str(r#"bind_addr = "0.0.0.0:9000""#).unwrap();
        let config = file.into_config();
        assert_eq!(config.bind_addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.default_rpc_timeout, Duration::from_secs(10));
    }

    #[test]
    fn empty_file_config_is_all_defaults() {
        let file: FileConfig = toml::from_str("").unwrap();
        let config = file.into_config();
        assert_eq!(config.bind_addr, Config::default().bind_addr);
        assert_eq!(config.mount_root, Config::default().mount_root);
        assert_eq!(config.worker_channel_count, Config::default().worker_channel_count);
    }
}

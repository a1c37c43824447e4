//! Manager configuration types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use consort_core::Mode;
use consort_transfer::DEFAULT_CHUNK_SIZE;

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// This node's client id
    pub client_id: String,
    #[serde(default)]
    pub mode: Mode,
    /// Root of the `input/`, `output/`, `cache/`, `transfer/` and `system/` trees
    #[serde(default = "default_operating_directory")]
    pub operating_directory: PathBuf,
    /// Where the remote's file endpoint lives
    #[serde(default)]
    pub remote: TransferEndpoint,
    /// Address the file server binds in remote mode
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_bus_url")]
    pub bus_url: String,
    /// Docker Engine API endpoint
    #[serde(default = "default_docker_url")]
    pub docker_url: String,
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Keep `output/<client>/<run>` when a run is cleaned up
    #[serde(default)]
    pub preserve_output: bool,
}

fn default_operating_directory() -> PathBuf {
    PathBuf::from("./")
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3300))
}

fn default_bus_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_docker_url() -> String {
    "http://localhost:2375".to_string()
}

impl ManagerConfig {
    /// Defaults for a node named `client_id`.
    #[must_use]
    pub fn new(client_id: impl Into<String>, mode: Mode) -> Self {
        Self {
            client_id: client_id.into(),
            mode,
            operating_directory: default_operating_directory(),
            remote: TransferEndpoint::default(),
            listen_addr: default_listen_addr(),
            bus_url: default_bus_url(),
            docker_url: default_docker_url(),
            transfer: TransferConfig::default(),
            preserve_output: false,
        }
    }

    /// Set the operating directory.
    #[must_use]
    pub fn with_operating_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.operating_directory = dir.into();
        self
    }

    /// Set the remote file endpoint.
    #[must_use]
    pub fn with_remote(mut self, remote: TransferEndpoint) -> Self {
        self.remote = remote;
        self
    }

    /// Set the file server bind address.
    #[must_use]
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Set the bus URL.
    #[must_use]
    pub fn with_bus_url(mut self, url: impl Into<String>) -> Self {
        self.bus_url = url.into();
        self
    }

    /// Set the Docker Engine endpoint.
    #[must_use]
    pub fn with_docker_url(mut self, url: impl Into<String>) -> Self {
        self.docker_url = url.into();
        self
    }

    /// Set the transfer tuning.
    #[must_use]
    pub fn with_transfer(mut self, transfer: TransferConfig) -> Self {
        self.transfer = transfer;
        self
    }

    /// Keep output directories at cleanup.
    #[must_use]
    pub fn with_preserve_output(mut self, preserve: bool) -> Self {
        self.preserve_output = preserve;
        self
    }
}

/// Location of the remote's `/transfer` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEndpoint {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_pathname")]
    pub pathname: String,
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    3300
}

fn default_pathname() -> String {
    "/transfer".to_string()
}

impl Default for TransferEndpoint {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            host: default_host(),
            port: default_port(),
            pathname: default_pathname(),
        }
    }
}

impl TransferEndpoint {
    /// Full URL of the endpoint.
    #[must_use]
    pub fn url(&self) -> String {
        format!("{}://{}:{}{}", self.protocol, self.host, self.port, self.pathname)
    }
}

/// File channel tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Largest archive chunk, in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_upload_limit")]
    pub upload_retry_limit: u32,
    #[serde(default = "default_download_limit")]
    pub download_retry_limit: u32,
    /// Attempt `n` waits `n` times this long
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_upload_limit() -> u32 {
    100
}

fn default_download_limit() -> u32 {
    300
}

fn default_retry_base_delay_ms() -> u64 {
    5000
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            upload_retry_limit: default_upload_limit(),
            download_retry_limit: default_download_limit(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl TransferConfig {
    /// Retry base delay as a duration.
    #[must_use]
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_from_minimal_json() {
        let config: ManagerConfig =
            serde_json::from_value(json!({ "client_id": "site-a" })).unwrap();

        assert_eq!(config.mode, Mode::Local);
        assert_eq!(config.operating_directory, PathBuf::from("./"));
        assert_eq!(config.remote.url(), "http://localhost:3300/transfer");
        assert_eq!(config.listen_addr.port(), 3300);
        assert_eq!(config.bus_url, "nats://localhost:4222");
        assert_eq!(config.docker_url, "http://localhost:2375");
        assert_eq!(config.transfer.chunk_size, 20 * 1024 * 1024);
        assert_eq!(config.transfer.upload_retry_limit, 100);
        assert_eq!(config.transfer.download_retry_limit, 300);
        assert_eq!(config.transfer.retry_base_delay(), Duration::from_secs(5));
        assert!(!config.preserve_output);
    }

    #[test]
    fn test_remote_endpoint_override() {
        let config: ManagerConfig = serde_json::from_value(json!({
            "client_id": "central",
            "mode": "remote",
            "remote": { "host": "hub.example.org", "port": 8443, "protocol": "https" }
        }))
        .unwrap();

        assert_eq!(config.mode, Mode::Remote);
        assert_eq!(config.remote.url(), "https://hub.example.org:8443/transfer");
    }
}

use std::{path::Path, time::Duration};

use serde::Deserialize;
use stacked_errors::{Result, StackableErr};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
/// Default HTTP read/write timeout in seconds.
pub const DEFAULT_HTTP_TIMEOUT: u64 = 30;

/// Deployer daemon configuration, read from a TOML file. Every option is
/// optional; unset engine options fall back to the engine's environment
/// defaults (`DOCKER_HOST` and friends).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Config {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// HTTP read timeout in seconds.
    pub read_timeout: Option<u64>,
    /// HTTP write timeout in seconds.
    pub write_timeout: Option<u64>,
    /// Engine URL, e.g. `http://127.0.0.1:2375`.
    pub docker_host: Option<String>,
    /// Engine API version string, e.g. `1.43`.
    pub docker_api_version: Option<String>,
    /// Engine request timeout in seconds.
    pub docker_timeout: Option<u64>,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path)
            .await
            .stack_err_with(|| format!("failed to read config file {path:?}"))?;
        toml::from_str(&contents)
            .stack_err_with(|| format!("failed to parse config file {path:?}"))
    }

    /// Like [Config::load], but a missing file yields the defaults instead of
    /// an error, so a fresh installation runs without any setup.
    pub async fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            Self::load(path).await
        } else {
            tracing::debug!("config file {path:?} not found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn bind_addr(&self) -> String {
        format!(
            "{}:{}",
            self.host.as_deref().unwrap_or(DEFAULT_HOST),
            self.port.unwrap_or(DEFAULT_PORT)
        )
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout.unwrap_or(DEFAULT_HTTP_TIMEOUT))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout.unwrap_or(DEFAULT_HTTP_TIMEOUT))
    }
}

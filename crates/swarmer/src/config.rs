//! Configuration of the client.
//!
//! Values are layered, each one overriding the previous:
//!
//! Defaults --> config.toml --> SWARMER_* env vars --> CLI flags
//!
//! The CLI layer is applied by the binary after [`Config::load`].
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use tokio::fs::create_dir_all;

use crate::{error::Error, piece_manager::PieceStrategy};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Where the downloaded file is written.
    pub download_dir: PathBuf,

    /// Port announced to the tracker.
    pub listen_port: u16,

    /// How many peer connections may be running at the same time.
    pub max_peers: usize,

    /// Pipeline depth, maximum of in-flight block requests per peer.
    pub max_outstanding_requests: usize,

    pub request_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub keep_alive_secs: u64,

    pub piece_strategy: PieceStrategy,

    /// After this many hash mismatches on the same piece, every new
    /// mismatch is logged as an error.
    pub max_hash_failures: u32,

    /// Used when the tracker does not send an interval.
    pub default_announce_interval_secs: u64,

    /// How long peers have to close their connections after the download
    /// finishes, before their tasks are aborted.
    pub shutdown_grace_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let download_dir = UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            download_dir,
            listen_port: 6881,
            max_peers: 30,
            max_outstanding_requests: 5,
            request_timeout_secs: 30,
            idle_timeout_secs: 120,
            connect_timeout_secs: 10,
            handshake_timeout_secs: 10,
            keep_alive_secs: 120,
            piece_strategy: PieceStrategy::default(),
            max_hash_failures: 5,
            default_announce_interval_secs: 300,
            shutdown_grace_secs: 5,
        }
    }
}

impl Config {
    /// Prefix of the environment variables that override the file.
    pub const ENV_PREFIX: &'static str = "SWARMER";

    /// `~/.config/swarmer/config.toml` on Linux, or the equivalent of the
    /// platform.
    pub fn config_path() -> Result<PathBuf, Error> {
        let dirs =
            ProjectDirs::from("", "", "swarmer").ok_or(Error::HomeInvalid)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Load the configuration from the defaults, the optional file at
    /// `path` and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let defaults = config::Config::try_from(&Config::default())?;

        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(Self::ENV_PREFIX)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<Config>()?;

        config.validate()?;
        Ok(config)
    }

    /// Write the default configuration to `path`, if there is no file there
    /// yet. Returns true if a file was written.
    pub async fn write_default(path: &Path) -> Result<bool, Error> {
        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(&Config::default())?;
        tokio::fs::write(path, content).await?;
        Ok(true)
    }

    fn validate(&self) -> Result<(), Error> {
        let invalid = |msg: &str| {
            Err(Error::Config(config::ConfigError::Message(msg.to_owned())))
        };
        if self.max_peers == 0 {
            return invalid("max_peers cannot be zero");
        }
        if self.max_outstanding_requests == 0 {
            return invalid("max_outstanding_requests cannot be zero");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn default_announce_interval(&self) -> Duration {
        Duration::from_secs(self.default_announce_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cli::Cli;
use crate::core::{BufferPolicy, DEFAULT_RING_DEPTH};
use crate::error::{Error, Result};

pub const DEFAULT_SHM_NAME: &str = "/frame-producer";
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/frame-producer.sock";
pub const DEFAULT_CARD: &str = "/dev/dri/card0";

/// Which allocator backs the frame buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    /// Anonymous memfd buffers
    #[default]
    Memfd,
    /// DRM dumb buffers exported through PRIME
    Drm,
}

/// Deployment settings, fixed for the life of the process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub shm_name: String,
    pub create_shm: bool,
    pub socket_path: PathBuf,
    pub device: DeviceKind,
    pub card: PathBuf,
    pub ring_depth: usize,
    pub policy: BufferPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shm_name: DEFAULT_SHM_NAME.to_string(),
            create_shm: false,
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            device: DeviceKind::default(),
            card: PathBuf::from(DEFAULT_CARD),
            ring_depth: DEFAULT_RING_DEPTH,
            policy: BufferPolicy::default(),
        }
    }
}

impl Config {
    /// Read a JSON config file; missing keys take defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&text).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Defaults, then the config file if one was given, then flags
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };

        if let Some(name) = &cli.shm_name {
            config.shm_name = name.clone();
        }
        if cli.create_shm {
            config.create_shm = true;
        }
        if let Some(socket) = &cli.socket {
            config.socket_path = socket.clone();
        }
        if let Some(device) = cli.device {
            config.device = device;
        }
        if let Some(card) = &cli.card {
            config.card = card.clone();
        }
        if let Some(depth) = cli.ring_depth {
            config.ring_depth = depth;
        }
        if let Some(policy) = cli.policy {
            config.policy = policy;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ring_depth == 0 {
            return Err(Error::Config("ring_depth must be at least 1".into()));
        }
        if !self.shm_name.starts_with('/') || self.shm_name[1..].contains('/') {
            return Err(Error::Config(format!(
                "shm_name {:?} must be a single component starting with '/'",
                self.shm_name
            )));
        }
        Ok(())
    }
}

//! Daemon configuration.
//!
//! One TOML file under the cirrus directory (`~/.cirrus` by default)
//! describes the node: where to listen, what to call ourselves, which
//! directories are shares, which access codes we are waiting to redeem,
//! and any statically configured peers. The CLI edits this file; the
//! daemon reads it at startup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 40400;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("cannot determine a home directory")]
    NoHome,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

fn default_name() -> String {
    hostname().unwrap_or_else(|| "cirrus".to_string())
}

fn hostname() -> Option<String> {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// A directory synchronized as a share.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShareEntry {
    pub path: PathBuf,
}

/// An access code entered locally, waiting for a peer to deliver keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingEntry {
    pub code: String,
    pub path: PathBuf,
}

/// A peer we always try to reach, besides anything discovery finds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StaticPeer {
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub listen_port: u16,
    #[serde(default = "default_name")]
    pub friendly_name: String,
    /// Disabling this sends everything in plaintext. Test rigs only.
    #[serde(default = "default_true")]
    pub encryption: bool,
    #[serde(default, rename = "share")]
    pub shares: Vec<ShareEntry>,
    #[serde(default, rename = "pending")]
    pub pending: Vec<PendingEntry>,
    #[serde(default, rename = "peer")]
    pub peers: Vec<StaticPeer>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_port: DEFAULT_PORT,
            friendly_name: default_name(),
            encryption: true,
            shares: Vec::new(),
            pending: Vec::new(),
            peers: Vec::new(),
        }
    }
}

impl Config {
    /// The cirrus directory, `~/.cirrus` unless overridden.
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        Ok(dirs::home_dir().ok_or(ConfigError::NoHome)?.join(".cirrus"))
    }

    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join("config.toml")
    }

    /// Load the config from `dir`, falling back to defaults when the file
    /// does not exist yet.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let path = Self::path_in(dir);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(toml::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(dir)?;
        let text = toml::to_string_pretty(self)?;
        std::fs::write(Self::path_in(dir), text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.listen_port, DEFAULT_PORT);
        assert!(config.encryption);
        assert!(config.shares.is_empty());
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.listen_port = 12345;
        config.shares.push(ShareEntry {
            path: PathBuf::from("/srv/music"),
        });
        config.pending.push(PendingEntry {
            code: "SYNC...".to_string(),
            path: PathBuf::from("/srv/joined"),
        });
        config.peers.push(StaticPeer {
            address: "203.0.113.9".to_string(),
            port: 40401,
        });
        config.save(dir.path()).unwrap();

        let back = Config::load(dir.path()).unwrap();
        assert_eq!(back.listen_port, 12345);
        assert_eq!(back.shares, config.shares);
        assert_eq!(back.pending, config.pending);
        assert_eq!(back.peers, config.peers);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(
            Config::path_in(dir.path()),
            "friendly_name = \"attic\"\n\n[[share]]\npath = \"/srv/docs\"\n",
        )
        .unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.friendly_name, "attic");
        assert_eq!(config.listen_port, DEFAULT_PORT);
        assert_eq!(config.shares.len(), 1);
    }
}

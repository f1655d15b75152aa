//! Server configuration: four keys, loaded from a YAML file with
//! defaults merged in. The file is created with defaults on first run;
//! keys present in the file override the defaults, missing keys fall
//! back to them.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    47500
}

fn default_max_connections() -> usize {
    10
}

fn default_log_level() -> String {
    "INFO".to_string()
}

/// The core's configuration contract: `host`, `port`, `max_connections`,
/// `log_level`. Anything else in the file is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Default config path, `~/.aonet/config.yaml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs_home().map(|home| home.join(".aonet").join("config.yaml"))
    }

    /// Load from `path`, writing out defaults first if the file does
    /// not exist yet.
    pub fn load_or_default(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                log::error!("failed to create config directory {}: {e}", parent.display());
            }
        }

        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }

        let contents = fs::read_to_string(path)?;
        match serde_yaml::from_str::<Self>(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                log::error!("YAML error while loading config {}: {e}", path.display());
                Ok(Self::default())
            }
        }
    }

    /// Write the current settings back out as YAML.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        fs::write(path, yaml)
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_contract() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 47500);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.log_level, "INFO");
    }

    #[test]
    fn load_or_default_creates_file_on_first_run() {
        let dir = std::env::temp_dir().join(format!(
            "aonet-config-test-{}",
            std::process::id()
        ));
        let path = dir.join("config.yaml");
        let _ = fs::remove_dir_all(&dir);

        let loaded = ServerConfig::load_or_default(&path).expect("load_or_default");
        assert_eq!(loaded, ServerConfig::default());
        assert!(path.exists());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_or_default_merges_partial_file_with_defaults() {
        let dir = std::env::temp_dir().join(format!(
            "aonet-config-test-partial-{}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        fs::write(&path, "port: 9999\n").unwrap();

        let loaded = ServerConfig::load_or_default(&path).expect("load_or_default");
        assert_eq!(loaded.port, 9999);
        assert_eq!(loaded.host, "127.0.0.1");

        fs::remove_dir_all(&dir).ok();
    }
}

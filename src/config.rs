//! TOML configuration

use crate::error::{Result, SyncError};
use crate::mapping::PathMapping;
use crate::reconcile::DisabledSuffix;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "sidesync.toml";

const MIN_CHUNK_MB: u32 = 1;
const MAX_CHUNK_MB: u32 = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Local base directory every mapping is relative to.
    pub game_path: PathBuf,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default = "default_chunk_mb")]
    pub chunk_size_mb: u32,
    /// Local files ending in this suffix count as present copies of the
    /// remote file without it.
    #[serde(default)]
    pub disabled_suffix: Option<String>,
    #[serde(rename = "mapping", default)]
    pub mappings: Vec<MappingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_root_path")]
    pub root_path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Seconds to wait on connect and on any single control or data read.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: default_port(),
            username: default_username(),
            password: String::new(),
            root_path: default_root_path(),
            max_connections: default_max_connections(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingConfig {
    /// Remote directory relative to `connection.root_path`.
    pub remote: String,
    /// Local directory relative to `game_path`; defaults to `remote`.
    #[serde(default)]
    pub local: Option<PathBuf>,
    #[serde(default)]
    pub delete_client_files: bool,
}

fn default_chunk_mb() -> u32 {
    10
}
fn default_port() -> u16 {
    21
}
fn default_username() -> String {
    "anonymous".to_string()
}
fn default_root_path() -> String {
    "/".to_string()
}
fn default_max_connections() -> usize {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        let config = Self::from_toml_str(&data)
            .with_context(|| format!("parsing configuration {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml_str(data: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mappings.is_empty() {
            return Err(SyncError::Config("at least one [[mapping]] is required".into()));
        }
        if self.connection.max_connections == 0 {
            return Err(SyncError::Config("max_connections must be at least 1".into()));
        }
        if self.connection.timeout_secs == 0 {
            return Err(SyncError::Config("timeout_secs must be at least 1".into()));
        }
        if !(MIN_CHUNK_MB..=MAX_CHUNK_MB).contains(&self.chunk_size_mb) {
            return Err(SyncError::Config(format!(
                "chunk_size_mb must be between {MIN_CHUNK_MB} and {MAX_CHUNK_MB}, got {}",
                self.chunk_size_mb
            )));
        }
        if let Some(m) = self.mappings.iter().find(|m| m.remote.trim().is_empty()) {
            return Err(SyncError::Config(format!(
                "mapping for local {:?} has an empty remote path",
                m.local
            )));
        }
        Ok(())
    }

    pub fn chunk_size_bytes(&self) -> u32 {
        self.chunk_size_mb * 1024 * 1024
    }

    /// Root directory mappings to scan.
    pub fn roots(&self) -> Vec<PathMapping> {
        self.mappings
            .iter()
            .map(|m| {
                let remote = m.remote.trim_matches('/').to_string();
                let local = m.local.clone().unwrap_or_else(|| PathBuf::from(&remote));
                PathMapping::root(
                    &self.game_path,
                    self.connection.root_path.clone(),
                    local,
                    remote,
                    m.delete_client_files,
                )
            })
            .collect()
    }

    pub fn variant_rule(&self) -> Option<DisabledSuffix> {
        self.disabled_suffix
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(DisabledSuffix::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
game_path = "/games/hs2"
chunk_size_mb = 4
disabled_suffix = ".disabled"

[connection]
address = "repo.example.org"
port = 2121
username = "sync"
password = "secret"
root_path = "/repo"
max_connections = 3
timeout_secs = 12

[[mapping]]
remote = "mods/Sideloader Modpack"
delete_client_files = true

[[mapping]]
remote = "UserData"
local = "UserData/chara"
"#;

    #[test]
    fn parses_a_full_file() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.connection.port, 2121);
        assert_eq!(config.connection.max_connections, 3);
        assert_eq!(config.connection.timeout_secs, 12);
        assert_eq!(config.chunk_size_bytes(), 4 * 1024 * 1024);
        assert!(config.variant_rule().is_some());

        let roots = config.roots();
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].remote_full_path(), "/repo/mods/Sideloader Modpack");
        assert_eq!(
            roots[0].local_full_path(),
            PathBuf::from("/games/hs2/mods/Sideloader Modpack")
        );
        assert!(roots[0].delete_client_files);
        assert_eq!(roots[1].local_full_path(), PathBuf::from("/games/hs2/UserData/chara"));
        assert!(!roots[1].delete_client_files);
    }

    #[test]
    fn defaults_fill_in_missing_fields() {
        let config = Config::from_toml_str(
            r#"
game_path = "g"
[[mapping]]
remote = "mods"
"#,
        )
        .unwrap();
        assert_eq!(config.connection.port, 21);
        assert_eq!(config.connection.root_path, "/");
        assert_eq!(config.connection.max_connections, 5);
        assert_eq!(config.connection.timeout_secs, 30);
        assert_eq!(config.connection.username, "anonymous");
        assert_eq!(config.chunk_size_mb, 10);
        assert!(config.variant_rule().is_none());
        assert_eq!(config.roots()[0].remote_full_path(), "/mods");
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Config::from_toml_str(r#"game_path = "g""#).is_err());
        let zero_conns = r#"
game_path = "g"
[connection]
max_connections = 0
[[mapping]]
remote = "mods"
"#;
        assert!(Config::from_toml_str(zero_conns).is_err());
        let zero_timeout = r#"
game_path = "g"
[connection]
timeout_secs = 0
[[mapping]]
remote = "mods"
"#;
        let err = Config::from_toml_str(zero_timeout).unwrap_err();
        assert!(err.to_string().contains("timeout_secs"));
        let huge_chunks = r#"
game_path = "g"
chunk_size_mb = 2048
[[mapping]]
remote = "mods"
"#;
        let err = Config::from_toml_str(huge_chunks).unwrap_err();
        assert!(err.to_string().contains("chunk_size_mb"));
        assert!(Config::from_toml_str("game_path = \"g\"\nbogus = 1\n").is_err());
    }

    #[test]
    fn load_reports_the_file_name() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope.toml");
        let err = Config::load(&missing).unwrap_err();
        assert!(format!("{err:#}").contains("nope.toml"));

        let path = tmp.path().join("sidesync.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(Config::load(&path).unwrap().mappings.len(), 2);
    }
}

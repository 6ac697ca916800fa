use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

/// Settings read from `config.toml`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub backup: BackupConfig,
    pub log: LogFileConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackupConfig {
    pub block_size: Option<usize>,
    pub jobs: Option<usize>,
    /// Extra attempts after a backup fails with an I/O error.
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogFileConfig {
    pub level: Option<String>,
    pub prefix: bool,
}

impl Default for LogFileConfig {
    fn default() -> Self {
        Self {
            level: None,
            prefix: true,
        }
    }
}

impl Config {
    /// Load `explicit` if given, which must exist, or else the per-user
    /// file if there is one.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load_file(path),
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::load_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.backup.block_size == Some(0) {
            bail!("backup.block_size must be positive");
        }
        if config.backup.jobs == Some(0) {
            bail!("backup.jobs must be positive");
        }
        Ok(config)
    }

    fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "conserve").map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(
            r#"
            [backup]
            block_size = 65536
            jobs = 2
            retries = 3

            [log]
            level = "debug"
            prefix = false
            "#,
        )
        .unwrap();
        assert_eq!(config.backup.block_size, Some(65536));
        assert_eq!(config.backup.jobs, Some(2));
        assert_eq!(config.backup.retries, 3);
        assert_eq!(config.log.level.as_deref(), Some("debug"));
        assert!(!config.log.prefix);
    }

    #[test]
    fn test_empty_config_is_default() {
        assert_eq!(Config::parse("").unwrap(), Config::default());
        assert!(Config::default().log.prefix);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::parse("[backup]\nblock_size = 0\n").is_err());
        assert!(Config::parse("[backup]\nblocksize = 10\n").is_err());
    }

    #[test]
    fn test_explicit_file_must_exist() {
        let dir = TempDir::new().unwrap();
        assert!(Config::load(Some(dir.path().join("missing.toml").as_path())).is_err());

        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[backup]\njobs = 3\n").unwrap();
        assert_eq!(Config::load(Some(path.as_path())).unwrap().backup.jobs, Some(3));
    }
}

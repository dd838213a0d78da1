//! Configuration loading and management

use anyhow::Context;
use kdb_core::{
    Compression, CryptoSettings, DataCipher, DatabaseFormat, KdbxVersion, KdfParameters,
    NewDatabase, SearchParameters,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// CLI configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub search: SearchParameters,
    #[serde(default)]
    pub new_database: NewDatabaseConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    /// File the configuration was read from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, used when `RUST_LOG` is unset
    pub level: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FormatChoice {
    Kdb,
    #[default]
    Kdbx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KdbxVersionChoice {
    #[serde(rename = "3.1")]
    V31,
    #[default]
    #[serde(rename = "4.0")]
    V40,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherChoice {
    #[default]
    Aes,
    Twofish,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDatabaseConfig {
    #[serde(default)]
    pub format: FormatChoice,
    #[serde(default)]
    pub kdbx_version: KdbxVersionChoice,
    #[serde(default)]
    pub cipher: CipherChoice,
    #[serde(default = "default_transform_rounds")]
    pub transform_rounds: u64,
    #[serde(default)]
    pub compression: Compression,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_max_items")]
    pub max_items: i32,
    #[serde(default = "default_history_max_size")]
    pub max_size: i64,
}

fn default_transform_rounds() -> u64 {
    kdb_core::crypto::kdf::DEFAULT_KDBX_ROUNDS
}

fn default_history_max_items() -> i32 {
    NewDatabase::default().history_max_items
}

fn default_history_max_size() -> i64 {
    NewDatabase::default().history_max_size
}

impl Default for NewDatabaseConfig {
    fn default() -> Self {
        Self {
            format: FormatChoice::default(),
            kdbx_version: KdbxVersionChoice::default(),
            cipher: CipherChoice::default(),
            transform_rounds: default_transform_rounds(),
            compression: Compression::default(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_items: default_history_max_items(),
            max_size: default_history_max_size(),
        }
    }
}

impl Config {
    /// Load configuration from `explicit`, the standard locations, or defaults
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let config_paths: Vec<PathBuf> = vec![Some(PathBuf::from("kdb.toml")), dirs_config_path()]
            .into_iter()
            .flatten()
            .collect();

        for path in config_paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Ok(Config::default())
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Settings for `kdb new`, with an optional format override
    pub fn new_database(&self, name: &str, format: Option<FormatChoice>) -> NewDatabase {
        let settings = &self.new_database;
        let format = match format.unwrap_or(settings.format) {
            FormatChoice::Kdb => DatabaseFormat::Kdb,
            FormatChoice::Kdbx => DatabaseFormat::Kdbx(match settings.kdbx_version {
                KdbxVersionChoice::V31 => KdbxVersion::Kdbx31,
                KdbxVersionChoice::V40 => KdbxVersion::Kdbx40,
            }),
        };
        let cipher = match settings.cipher {
            CipherChoice::Aes => DataCipher::Aes256,
            CipherChoice::Twofish => DataCipher::Twofish,
        };
        let compression = match format {
            DatabaseFormat::Kdb => Compression::None,
            DatabaseFormat::Kdbx(_) => settings.compression,
        };

        NewDatabase {
            name: name.to_string(),
            format,
            crypto: CryptoSettings {
                cipher,
                compression,
                kdf: KdfParameters::aes(settings.transform_rounds),
            },
            history_max_items: self.history.max_items,
            history_max_size: self.history.max_size,
        }
    }
}

fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("kdb").join("config.toml"))
}

/// Helper to get user's config directory
mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }

        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        }

        #[cfg(target_os = "windows")]
        {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
[logging]
level = "kdb_core=debug"

[search]
search_in_passwords = true

[new_database]
format = "kdb"
cipher = "twofish"
transform_rounds = 1000
"#,
        )
        .unwrap();
        assert_eq!(config.logging.level.as_deref(), Some("kdb_core=debug"));
        assert!(config.search.search_in_passwords);
        assert!(config.search.search_in_titles);
        assert_eq!(config.history.max_items, default_history_max_items());

        let options = config.new_database("Test", None);
        assert_eq!(options.format, DatabaseFormat::Kdb);
        assert_eq!(options.crypto.cipher, DataCipher::Twofish);
        assert_eq!(options.crypto.compression, Compression::None);
        assert_eq!(options.crypto.kdf.rounds(), 1000);
    }

    #[test]
    fn test_format_override() {
        let config = Config::default();
        let options = config.new_database("Test", Some(FormatChoice::Kdbx));
        assert_eq!(options.format, DatabaseFormat::Kdbx(KdbxVersion::Kdbx40));
        assert_eq!(options.crypto.compression, Compression::Gzip);
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kdb.toml");
        std::fs::write(&path, "[history]\nmax_items = 3\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.history.max_items, 3);
        assert_eq!(config.source.as_deref(), Some(path.as_path()));
    }
}

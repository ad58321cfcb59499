//! Executor configuration: optional YAML file, then CLI/env on top.

use std::path::{Path, PathBuf};

use ad4m_core::{AddressScheme, CoreConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cli::Cli;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:12000";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Duplicate language id: {0}")]
    DuplicateLanguage(String),
}

/// A language installed at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LanguageConfig {
    /// Content-addressed expression store
    Content {
        id: String,
        #[serde(default = "default_scheme")]
        scheme: AddressScheme,
    },
    /// In-process link language for shared perspectives
    Neighbourhood { id: String },
}

fn default_scheme() -> AddressScheme {
    AddressScheme::Hash
}

impl LanguageConfig {
    pub fn id(&self) -> &str {
        match self {
            LanguageConfig::Content { id, .. } | LanguageConfig::Neighbourhood { id } => id,
        }
    }
}

/// Shape of the YAML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub listen_addr: Option<String>,

    #[serde(default)]
    pub core: CoreConfig,

    #[serde(default)]
    pub languages: Vec<LanguageConfig>,
}

impl FileConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_yaml::from_str(&contents)?)
    }
}

/// Runtime configuration derived from file + CLI/env.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub listen_addr: String,
    pub core: CoreConfig,
    pub languages: Vec<LanguageConfig>,
}

impl ExecutorConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => FileConfig::from_file(path)?,
            None => FileConfig::default(),
        };
        Self::merge(file, cli)
    }

    fn merge(file: FileConfig, cli: &Cli) -> Result<Self, ConfigError> {
        let mut core = file.core;
        if let Some(data_path) = &cli.data_path {
            core.data_path = Some(data_path.clone());
        }
        if let Some(credential) = &cli.admin_credential {
            core.admin_credential = Some(credential.clone());
        }
        if let Some(secret) = &cli.jwt_secret {
            core.jwt_secret = Some(secret.clone());
        }
        if let Some(capacity) = cli.bus_capacity {
            core.bus_capacity = capacity;
        }
        core.data_path = core.data_path.map(absolute).transpose()?;

        let mut seen = std::collections::HashSet::new();
        for language in &file.languages {
            if !seen.insert(language.id()) {
                return Err(ConfigError::DuplicateLanguage(language.id().to_string()));
            }
        }

        Ok(Self {
            listen_addr: cli
                .listen_addr
                .clone()
                .or(file.listen_addr)
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
            core,
            languages: file.languages,
        })
    }
}

fn absolute(path: PathBuf) -> Result<PathBuf, ConfigError> {
    if path.is_relative() {
        Ok(std::env::current_dir()?.join(path))
    } else {
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    const YAML: &str = r#"
listen_addr: 0.0.0.0:4000
core:
  bus_capacity: 32
  pairing_code_ttl_secs: 60
  admin_credential: from-file
languages:
  - kind: content
    id: notes
  - kind: content
    id: log
    scheme: sequence
  - kind: neighbourhood
    id: chat
"#;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("ad4m-executor").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_yaml_file_fills_config() {
        let file: FileConfig = serde_yaml::from_str(YAML).unwrap();
        let config = ExecutorConfig::merge(file, &cli(&[])).unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0:4000");
        assert_eq!(config.core.bus_capacity, 32);
        assert_eq!(config.core.pairing_code_ttl_secs, 60);
        assert_eq!(config.core.admin_credential.as_deref(), Some("from-file"));
        assert_eq!(
            config.languages[1],
            LanguageConfig::Content {
                id: "log".into(),
                scheme: AddressScheme::Sequence
            }
        );
        assert_eq!(config.languages[0].id(), "notes");
        assert_eq!(config.languages[2], LanguageConfig::Neighbourhood { id: "chat".into() });
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: FileConfig = serde_yaml::from_str(YAML).unwrap();
        let cli = cli(&[
            "--listen-addr",
            "127.0.0.1:9000",
            "--admin-credential",
            "from-cli",
            "--data-path",
            "/var/lib/ad4m",
            "--bus-capacity",
            "4",
        ]);
        let config = ExecutorConfig::merge(file, &cli).unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.core.admin_credential.as_deref(), Some("from-cli"));
        assert_eq!(config.core.data_path, Some(PathBuf::from("/var/lib/ad4m")));
        assert_eq!(config.core.bus_capacity, 4);
    }

    #[test]
    fn test_defaults_without_file() {
        let config = ExecutorConfig::merge(FileConfig::default(), &cli(&[])).unwrap();
        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR);
        assert!(config.core.data_path.is_none());
        assert!(config.languages.is_empty());
    }

    #[test]
    fn test_duplicate_language_rejected() {
        let file: FileConfig = serde_yaml::from_str(
            "languages:\n  - kind: content\n    id: a\n  - kind: neighbourhood\n    id: a\n",
        )
        .unwrap();
        assert!(matches!(
            ExecutorConfig::merge(file, &cli(&[])),
            Err(ConfigError::DuplicateLanguage(id)) if id == "a"
        ));
    }
}

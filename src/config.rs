use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context as _;
use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "echowire.toml";
const DEFAULT_CONTROL_LISTEN: &str = "127.0.0.1:8080";
const DEFAULT_PROXY_LISTEN: &str = "127.0.0.1:9090";
const DEFAULT_DB_PATH: &str = "./data/echowire.sqlite";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub control: ControlConfig,
    pub proxy: ProxyConfig,
    pub storage: StorageConfig,
    pub upstream: UpstreamConfig,
    pub logging: Option<LoggingConfig>,
}

impl Config {
    /// Loads config from `path` if given, otherwise from `echowire.toml` in
    /// the working directory if present, otherwise built-in defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_path(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_path(default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

/// Listener for the control-plane API (projects, sessions, recording).
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub listen: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_CONTROL_LISTEN.to_owned(),
        }
    }
}

/// Listener for the forwarding proxy plane.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_PROXY_LISTEN.to_owned(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
        }
    }
}

/// Optional fallback target used when no recording is active and the request
/// names no project.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub default_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{Config, LogFormat};

    #[test]
    fn empty_toml_yields_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.control.listen, "127.0.0.1:8080");
        assert_eq!(config.proxy.listen, "127.0.0.1:9090");
        assert_eq!(config.storage.db_path, Path::new("./data/echowire.sqlite"));
        assert_eq!(config.upstream.default_url, None);
        assert!(config.logging.is_none());
    }

    #[test]
    fn full_config_parses() {
        let config = Config::from_toml_str(
            r#"
[control]
listen = "0.0.0.0:8081"

[proxy]
listen = "0.0.0.0:9091"

[storage]
db_path = "/var/lib/echowire/db.sqlite"

[upstream]
default_url = "http://fallback.example.com:8000"

[logging]
level = "debug"
format = "pretty"
"#,
        )
        .unwrap();

        assert_eq!(config.control.listen, "0.0.0.0:8081");
        assert_eq!(config.proxy.listen, "0.0.0.0:9091");
        assert_eq!(
            config.storage.db_path,
            Path::new("/var/lib/echowire/db.sqlite")
        );
        assert_eq!(
            config.upstream.default_url.as_deref(),
            Some("http://fallback.example.com:8000")
        );
        let logging = config.logging.unwrap();
        assert_eq!(logging.level.as_deref(), Some("debug"));
        assert_eq!(logging.format, Some(LogFormat::Pretty));
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = Config::from_toml_str(
            r#"
[proxy]
listen = "127.0.0.1:19090"
"#,
        )
        .unwrap();
        assert_eq!(config.proxy.listen, "127.0.0.1:19090");
        assert_eq!(config.control.listen, "127.0.0.1:8080");
    }

    #[test]
    fn malformed_toml_is_rejected() {
        let err = Config::from_toml_str("[proxy\nlisten = 1").unwrap_err();
        assert!(err.to_string().contains("parse config TOML"));
    }

    #[test]
    fn load_without_path_and_without_file_uses_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let missing = temp_dir.path().join("nope.toml");
        assert!(Config::from_path(&missing).is_err());

        let config = Config::load(None).unwrap();
        assert_eq!(config.proxy.listen, "127.0.0.1:9090");
    }
}

//! # Settings
//!
//! Loaded from an optional TOML file, then overridden by [`Cli`] flags and
//! their environment variables. Every field has a default, so an empty or
//! missing file yields a working local setup.
//!
//! | Variable            | Flag                  | Field                  |
//! |---------------------|-----------------------|------------------------|
//! | `BUMPER_DATA`       | `--data-dir`          | `data_dir`             |
//! | `LOG_LEVEL`         | `--log-level`         | `log_level`            |
//! | `BUMPER_PROXY_MQTT` | `--proxy-mqtt`        | `proxy.enabled`        |
//! | `PROXY_MQTT_DOMAIN` | `--proxy-mqtt-domain` | `proxy.domain`         |
//! | `USE_AUTH`          | `--use-auth`          | `mqtt.use_auth`        |
//! | `ALLOW_ANONYMOUS`   | `--allow-anonymous`   | `mqtt.allow_anonymous` |
//! | `SYNC_TIMEZONE`     | `--sync-timezone`     | `mqtt.sync_timezone`   |

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, Level};

use crate::cli::Cli;
use crate::mqtt::helper_bot::DEFAULT_COMMAND_TIMEOUT;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid log level '{0}'")]
    LogLevel(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct BindingConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub use_ssl: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct MqttSettings {
    pub bindings: Vec<BindingConfig>,
    pub user_realms: Vec<String>,
    pub allow_anonymous: bool,
    pub use_auth: bool,
    pub sync_timezone: bool,
    /// `username:hash` file, `passwd` in the data directory when unset
    pub password_file: Option<PathBuf>,
    pub command_timeout_secs: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            bindings: vec![BindingConfig {
                host: "0.0.0.0".to_string(),
                port: 8883,
                use_ssl: true,
            }],
            user_realms: vec!["ecouser.net".to_string()],
            allow_anonymous: false,
            use_auth: false,
            sync_timezone: true,
            password_file: None,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ProxySettings {
    pub enabled: bool,
    pub domain: String,
    pub port: u16,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            domain: "mq-ww.ecouser.net".to_string(),
            port: 8883,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct WebSettings {
    pub host: String,
    pub port: u16,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8007,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct CertSettings {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub log_level: String,
    pub mqtt: MqttSettings,
    pub proxy: ProxySettings,
    pub web: WebSettings,
    pub certs: CertSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            mqtt: MqttSettings::default(),
            proxy: ProxySettings::default(),
            web: WebSettings::default(),
            certs: CertSettings::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bumper")
}

impl Settings {
    /// Reads the file named by `cli` if any, then applies its overrides.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut settings = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => {
                debug!("No config file given, using defaults");
                Self::default()
            }
        };
        cli.merge_into(&mut settings);
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded configuration from {}", path.display());
        Ok(settings)
    }

    pub fn log_level(&self) -> Result<Level, ConfigError> {
        self.log_level
            .parse::<Level>()
            .map_err(|_| ConfigError::LogLevel(self.log_level.clone()))
    }

    pub fn password_file(&self) -> PathBuf {
        self.mqtt
            .password_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("passwd"))
    }

    pub fn store_file(&self) -> PathBuf {
        self.data_dir.join("bumper.toml")
    }

    pub fn cert_file(&self) -> PathBuf {
        self.certs
            .cert
            .clone()
            .unwrap_or_else(|| self.data_dir.join("certs").join("bumper.crt"))
    }

    pub fn key_file(&self) -> PathBuf {
        self.certs
            .key
            .clone()
            .unwrap_or_else(|| self.data_dir.join("certs").join("bumper.key"))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.mqtt.command_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.mqtt.bindings.len(), 1);
        assert_eq!(settings.mqtt.bindings[0].port, 8883);
        assert!(settings.mqtt.bindings[0].use_ssl);
        assert_eq!(settings.mqtt.user_realms, vec!["ecouser.net".to_string()]);
        assert!(settings.mqtt.sync_timezone);
        assert!(!settings.mqtt.allow_anonymous);
        assert!(!settings.proxy.enabled);
        assert_eq!(settings.proxy.domain, "mq-ww.ecouser.net");
        assert_eq!(settings.log_level().unwrap(), Level::INFO);
    }

    #[test]
    fn load_merges_cli_over_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[proxy]\nenabled = false\ndomain = \"mq.file\"").unwrap();
        let cli = Cli {
            config: Some(file.path().to_path_buf()),
            proxy_mqtt: Some(true),
            ..Cli::default()
        };

        let settings = Settings::load(&cli).unwrap();
        assert!(settings.proxy.enabled);
        assert_eq!(settings.proxy.domain, "mq.file");
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
log_level = "warn"

[mqtt]
allow_anonymous = true

[[mqtt.bindings]]
host = "127.0.0.1"
port = 1883
"#
        )
        .unwrap();

        let settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.log_level().unwrap(), Level::WARN);
        assert!(settings.mqtt.allow_anonymous);
        assert!(settings.mqtt.sync_timezone);
        assert_eq!(settings.mqtt.bindings[0].port, 1883);
        assert!(!settings.mqtt.bindings[0].use_ssl);
        assert_eq!(settings.web.port, 8007);
    }

    #[test]
    fn invalid_file_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "mqtt = 5").unwrap();
        assert!(matches!(
            Settings::from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            Settings::from_file(Path::new("/nonexistent/bumper.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn bad_log_level() {
        let settings = Settings {
            log_level: "loud".to_string(),
            ..Settings::default()
        };
        assert!(matches!(settings.log_level(), Err(ConfigError::LogLevel(_))));
    }
}

//! Command line and environment overrides, applied over the TOML settings.

use clap::builder::BoolishValueParser;
use clap::Parser;
use std::path::PathBuf;

use crate::config::Settings;

/// Local MQTT backend for robot vacuums.
#[derive(Parser, Debug, Default)]
#[command(name = "bumper")]
#[command(version)]
#[command(about = "Local MQTT broker, helper bot and vendor proxy for robot vacuums")]
pub struct Cli {
    /// Path to a TOML settings file
    pub config: Option<PathBuf>,

    /// Directory for the store snapshot, password file and certificates
    #[arg(long, env = "BUMPER_DATA")]
    pub data_dir: Option<PathBuf>,

    /// trace, debug, info, warn or error
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Mirror bot traffic to the vendor broker
    #[arg(long, env = "BUMPER_PROXY_MQTT", value_parser = BoolishValueParser::new())]
    pub proxy_mqtt: Option<bool>,

    /// Vendor broker host used in proxy mode
    #[arg(long, env = "PROXY_MQTT_DOMAIN")]
    pub proxy_mqtt_domain: Option<String>,

    /// Require a valid auth code from app clients
    #[arg(long, env = "USE_AUTH", value_parser = BoolishValueParser::new())]
    pub use_auth: Option<bool>,

    /// Accept sessions that fail authorization
    #[arg(long, env = "ALLOW_ANONYMOUS", value_parser = BoolishValueParser::new())]
    pub allow_anonymous: Option<bool>,

    /// Send setTimeZone to bots when they subscribe
    #[arg(long, env = "SYNC_TIMEZONE", value_parser = BoolishValueParser::new())]
    pub sync_timezone: Option<bool>,
}

impl Cli {
    /// Overrides every field of `settings` that was given on the command
    /// line or in the environment.
    pub fn merge_into(&self, settings: &mut Settings) {
        if let Some(dir) = &self.data_dir {
            settings.data_dir = dir.clone();
        }
        if let Some(level) = &self.log_level {
            settings.log_level = level.clone();
        }
        if let Some(enabled) = self.proxy_mqtt {
            settings.proxy.enabled = enabled;
        }
        if let Some(domain) = &self.proxy_mqtt_domain {
            settings.proxy.domain = domain.clone();
        }
        if let Some(use_auth) = self.use_auth {
            settings.mqtt.use_auth = use_auth;
        }
        if let Some(allow) = self.allow_anonymous {
            settings.mqtt.allow_anonymous = allow;
        }
        if let Some(sync) = self.sync_timezone {
            settings.mqtt.sync_timezone = sync;
        }
    }
}

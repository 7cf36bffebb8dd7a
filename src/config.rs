use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::mailer::MailerSettings;
use crate::mapper::leading_int;

// Defaults for the NUT connection and polling behaviour.
const HOST_IP: &str = "127.0.0.1";
const HOST_PORT: i64 = 3493; // upsd's registered port.
const UPS_NAME: &str = "ups";
const UPDATE_INTERVAL: u64 = 60; // Seconds between polls.
const MAX_UPDATE_INTERVAL: u64 = 2_147_483; // Longest wait, just under 25 days.
const IO_TIMEOUT: u64 = 10; // Seconds before a silent upsd counts as gone.
const CONTROL_LISTEN: &str = "127.0.0.1:3494";

/// A number that may also be written as a string in the config file.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Setting {
    Number(i64),
    Text(String),
}

impl Setting {
    /// The number, or the leading integer of the text ("3493/tcp" is 3493).
    fn as_int(&self) -> Option<i64> {
        match self {
            Setting::Number(n) => Some(*n),
            Setting::Text(s) => leading_int(s),
        }
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Setting::Number(n) => write!(f, "{}", n),
            Setting::Text(s) => write!(f, "{:?}", s),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Settings {
    pub host_ip: String,
    pub host_port: Setting,
    pub ups_name: String,
    pub update_interval: Setting,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub io_timeout: u64,
    pub control_listen: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mailer: Option<MailerSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            host_ip: HOST_IP.to_string(),
            host_port: Setting::Number(HOST_PORT),
            ups_name: UPS_NAME.to_string(),
            update_interval: Setting::Number(UPDATE_INTERVAL as i64),
            username: None,
            password: None,
            io_timeout: IO_TIMEOUT,
            control_listen: CONTROL_LISTEN.to_string(),
            mailer: None,
        }
    }
}

impl Settings {
    /// Defaults, then the TOML file if it exists, then `NUT_*` environment variables.
    pub fn load(path: &Path) -> Result<Settings, ConfigError> {
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("NUT_"))
            .extract()?;
        Ok(settings)
    }

    /// The upsd port. Anything outside 0..=65535 is unusable.
    pub fn port(&self) -> Result<u16, ConfigError> {
        self.host_port
            .as_int()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| ConfigError::InvalidPort(self.host_port.to_string()))
    }

    /// Time between polls, falling back to the default for unusable values
    /// and capped so the next deadline always fits in an `Instant`.
    pub fn update_interval(&self) -> Duration {
        let secs = match self.update_interval.as_int() {
            Some(n) if n > 0 => (n as u64).min(MAX_UPDATE_INTERVAL),
            _ => UPDATE_INTERVAL,
        };
        Duration::from_secs(secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout.max(1))
    }

    /// Username and password, when both are set.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }

    /// How upsmon names this UPS in its notifications.
    pub fn ups_identity(&self) -> String {
        format!("{}@{}", self.ups_name, self.host_ip)
    }

    pub fn control_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        let addr = self.control_listen.trim();
        if addr.is_empty() {
            return Ok(None);
        }
        addr.parse()
            .map(Some)
            .map_err(|e: std::net::AddrParseError| ConfigError::ControlAddress {
                addr: addr.to_string(),
                reason: e.to_string(),
            })
    }
}

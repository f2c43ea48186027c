use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::ConfigError;
use crate::transport::normalize_origin;

/// Settings for the connect flow. Every field has a default.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectConfig {
    pub connect_server_url: String,
    pub wallet_uri: String,
    /// Origin of this app, passed to wallets so they can answer
    pub local_origin: String,
    pub dweb_gateway: String,
    pub popup_width: u32,
    pub popup_height: u32,
    pub popup_poll_interval_ms: u64,
    pub error_close_grace_ms: u64,
    pub done_close_delay_ms: u64,
    pub network_timeout_ms: u64,
    pub pin_timeout_ms: u64,
    pub session_timeout_ms: u64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            connect_server_url: "https://dwn.tbddev.org/latest/connect".to_string(),
            wallet_uri: "web5://connect".to_string(),
            local_origin: "http://localhost".to_string(),
            dweb_gateway: "https://dweb".to_string(),
            popup_width: 500,
            popup_height: 600,
            popup_poll_interval_ms: 500,
            error_close_grace_ms: 500,
            done_close_delay_ms: 500,
            network_timeout_ms: 30_000,
            pin_timeout_ms: 120_000,
            session_timeout_ms: 300_000,
        }
    }
}

impl ConnectConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("connect_server_url", &self.connect_server_url),
            ("wallet_uri", &self.wallet_uri),
            ("dweb_gateway", &self.dweb_gateway),
        ] {
            Url::parse(value).map_err(|e| ConfigError::Invalid {
                key,
                reason: e.to_string(),
            })?;
        }
        if normalize_origin(&self.local_origin).is_none() {
            return Err(ConfigError::Invalid {
                key: "local_origin",
                reason: format!("{} is not a web origin", self.local_origin),
            });
        }
        for (key, value) in [
            ("popup_width", u64::from(self.popup_width)),
            ("popup_height", u64::from(self.popup_height)),
            ("popup_poll_interval_ms", self.popup_poll_interval_ms),
            ("error_close_grace_ms", self.error_close_grace_ms),
            ("done_close_delay_ms", self.done_close_delay_ms),
            ("network_timeout_ms", self.network_timeout_ms),
            ("pin_timeout_ms", self.pin_timeout_ms),
            ("session_timeout_ms", self.session_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    /// `local_origin` in serialized form, without path or trailing slash
    pub fn origin(&self) -> String {
        normalize_origin(&self.local_origin).unwrap_or_else(|| self.local_origin.clone())
    }

    pub fn popup_poll_interval(&self) -> Duration {
        Duration::from_millis(self.popup_poll_interval_ms)
    }

    pub fn error_close_grace(&self) -> Duration {
        Duration::from_millis(self.error_close_grace_ms)
    }

    pub fn done_close_delay(&self) -> Duration {
        Duration::from_millis(self.done_close_delay_ms)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn pin_timeout(&self) -> Duration {
        Duration::from_millis(self.pin_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }
}

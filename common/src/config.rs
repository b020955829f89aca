use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topics::{TOPIC_OVERRIDES_IN, TOPIC_RESULTS_OUT};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoopFailurePolicy {
    #[default]
    Restart,
    Exit,
}

/// Process configuration. Keys without a serde default are required and a
/// missing one fails deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Meter poll cadence, and main loop sleep while not injecting (seconds).
    pub sleep_time: u64,
    /// Dead band around zero grid power (watts).
    pub eps: u32,
    /// Pause after the initial actuation (seconds).
    pub min_change_interval: u64,
    /// Main loop sleep while injecting (seconds).
    pub hysteresis_interval: u64,
    /// Power meter status URL.
    pub url: String,

    #[serde(rename = "ECOFLOW_ACCESSKEY")]
    pub access_key: String,
    #[serde(rename = "ECOFLOW_SECRETKEY")]
    pub secret_key: String,
    #[serde(rename = "ECOFLOW_SN")]
    pub serial_number: String,
    #[serde(rename = "ECOFLOW_API_HTTP_URL")]
    pub api_url: String,

    #[serde(rename = "MQTT_BROKER_ADDRESS")]
    pub mqtt_host: String,
    #[serde(rename = "MQTT_PORT")]
    pub mqtt_port: u16,
    #[serde(rename = "MQTT_USER", default)]
    pub mqtt_user: String,
    #[serde(rename = "MQTT_PASS", default)]
    pub mqtt_pass: String,

    #[serde(default = "default_soc_refresh_interval")]
    pub soc_refresh_interval: u64,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default = "default_topic_in")]
    pub topic_in: String,
    #[serde(default = "default_topic_out")]
    pub topic_out: String,
    #[serde(default = "default_http_timeout")]
    pub http_timeout: u64,
    #[serde(default)]
    pub status_port: Option<u16>,
    #[serde(default)]
    pub loop_failure: LoopFailurePolicy,
    #[serde(default = "default_restart_delay")]
    pub restart_delay: u64,
}

fn default_soc_refresh_interval() -> u64 {
    240
}

fn default_topic_in() -> String {
    TOPIC_OVERRIDES_IN.to_string()
}

fn default_topic_out() -> String {
    TOPIC_RESULTS_OUT.to_string()
}

fn default_http_timeout() -> u64 {
    10
}

fn default_restart_delay() -> u64 {
    10
}

impl RuntimeConfig {
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    /// Broker settings from the environment win over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("MQTT_HOST") {
            self.mqtt_host = host;
        }
        if let Some(port) = std::env::var("MQTT_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
        {
            self.mqtt_port = port;
        }
        if let Ok(user) = std::env::var("MQTT_USER") {
            self.mqtt_user = user;
        }
        if let Ok(pass) = std::env::var("MQTT_PASS") {
            self.mqtt_pass = pass;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("sleep_time", self.sleep_time),
            ("hysteresis_interval", self.hysteresis_interval),
            ("soc_refresh_interval", self.soc_refresh_interval),
            ("http_timeout", self.http_timeout),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(invalid(key, "must be greater than zero"));
            }
        }

        let non_empty = [
            ("url", &self.url),
            ("ECOFLOW_ACCESSKEY", &self.access_key),
            ("ECOFLOW_SECRETKEY", &self.secret_key),
            ("ECOFLOW_SN", &self.serial_number),
            ("ECOFLOW_API_HTTP_URL", &self.api_url),
            ("MQTT_BROKER_ADDRESS", &self.mqtt_host),
        ];
        for (key, value) in non_empty {
            if value.trim().is_empty() {
                return Err(invalid(key, "must not be empty"));
            }
        }

        if self.mqtt_port == 0 {
            return Err(invalid("MQTT_PORT", "must be a valid port"));
        }

        self.timezone()?;
        Ok(())
    }

    pub fn timezone(&self) -> Result<Option<Tz>, ConfigError> {
        match &self.timezone {
            Some(name) => name
                .parse::<Tz>()
                .map(Some)
                .map_err(|_| invalid("timezone", &format!("unknown timezone {name}"))),
            None => Ok(None),
        }
    }

    pub fn sleep_time(&self) -> Duration {
        Duration::from_secs(self.sleep_time)
    }

    pub fn min_change_interval(&self) -> Duration {
        Duration::from_secs(self.min_change_interval)
    }

    pub fn hysteresis_interval(&self) -> Duration {
        Duration::from_secs(self.hysteresis_interval)
    }

    pub fn soc_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.soc_refresh_interval)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay)
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

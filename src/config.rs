use std::env;
use std::time::Duration;

use tracing::info;

use crate::error::{Error, Result};

const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;
const MIN_POLL_INTERVAL_SECS: u64 = 1;

/// Connection settings for one Envoy. The HTTP client itself is owned by
/// the hosting application and passed into every operation.
#[derive(Debug, Clone)]
pub struct EnvoyConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    pub serial_number: String,
    pub token: Option<String>,
    pub poll_interval: Duration,
}

impl EnvoyConfig {
    /// Builds a config from environment variables, mirroring how the rest
    /// of the deployment is configured.
    pub fn from_env() -> Result<Self> {
        let host = require_env("ENVOY_HOST")?;
        let username = require_env("ENLIGHTEN_USER")?;
        let password = require_env("ENLIGHTEN_PASS")?;
        let serial_number = require_env("ENVOY_SERIAL")?;
        let token = env::var("ENLIGHTEN_TOKEN").ok().filter(|t| !t.is_empty());

        let poll_secs = env::var("ENVOY_POLL_INTERVAL")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS)
            .max(MIN_POLL_INTERVAL_SECS);

        info!(
            host,
            serial = serial_number,
            poll_interval_secs = poll_secs,
            pre_seeded_token = token.is_some(),
            "envoy bridge config"
        );

        Ok(Self {
            host,
            username,
            password,
            serial_number,
            token,
            poll_interval: Duration::from_secs(poll_secs),
        })
    }

    /// Base URL for device endpoints. IPv6 hosts get bracketed; a host that
    /// already carries a scheme (test servers) is used as-is.
    pub fn base_url(&self) -> String {
        if self.host.starts_with("http://") || self.host.starts_with("https://") {
            self.host.trim_end_matches('/').to_string()
        } else if self.host.contains(':') && !self.host.starts_with('[') {
            format!("https://[{}]", self.host)
        } else {
            format!("https://{}", self.host)
        }
    }
}

fn require_env(name: &str) -> Result<String> {
    env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Config(format!("{name} is not set")))
}

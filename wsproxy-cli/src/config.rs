use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wsproxy::TunnelConfig;
use wsproxy::config::DEFAULT_TUNNEL_PATH;

use crate::sys;

const USER_PATH: &str = "wsproxy/config.toml";
const ENV_PREFIX: &str = "WSPROXY";

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 7769;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Server settings, merged from defaults, the user config file and `WSPROXY_*` variables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub tunnel_path: String,
    pub request_timeout_secs: u64,
}

impl Config {
    pub fn user_path() -> Option<PathBuf> {
        sys::config_dir().map(|config_dir| config_dir.join(USER_PATH))
    }

    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let user_path = Self::user_path();
        let path = path.or(user_path.as_deref());

        let mut builder = config::Config::builder()
            .set_default("host", DEFAULT_HOST)?
            .set_default("port", i64::from(DEFAULT_PORT))?
            .set_default("tunnel_path", DEFAULT_TUNNEL_PATH)?
            .set_default("request_timeout_secs", DEFAULT_REQUEST_TIMEOUT_SECS as i64)?;
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let mut config: Config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?
            .try_deserialize()?;
        config.password = config.password.filter(|p| !p.is_empty());
        Ok(config)
    }

    pub fn tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            tunnel_path: self.tunnel_path.clone(),
            ..TunnelConfig::default()
        }
        .with_password(self.password.clone())
        .with_request_timeout(Duration::from_secs(self.request_timeout_secs))
    }
}

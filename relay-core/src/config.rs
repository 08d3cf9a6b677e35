//! TOML configuration for the gateway and the provider directory.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::candidates::ProviderConfig;
use crate::dispatch::DispatchOptions;
use crate::error::{Error, ErrorDetails};
use crate::http::HttpClientConfig;
use crate::rate_limiting::{default_action_limits, ActionLimit, RateLimitAction};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Per-action overrides; actions absent here keep their defaults.
    #[serde(default)]
    pub rate_limits: HashMap<RateLimitAction, RateLimitConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Socket the gateway binds. `None` falls back to 0.0.0.0:3000.
    pub bind_address: Option<SocketAddr>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    #[serde(default)]
    pub http: HttpConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            debug: false,
            max_attempts: default_max_attempts(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            http: HttpConfig::default(),
        }
    }
}

fn default_max_attempts() -> usize {
    3
}

fn default_attempt_timeout_ms() -> u64 {
    300_000
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,
    #[serde(default)]
    pub proxy: Option<Url>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            timeout_ms: default_timeout_ms(),
            pool_max_idle_per_host: default_pool_max_idle(),
            proxy: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_pool_max_idle() -> usize {
    20
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_seconds: u64,
}

impl Config {
    pub fn load_from_path(path: &Path) -> Result<Config, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file `{}`: {e}", path.display()),
            })
        })?;
        let config: Config = toml::from_str(&contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file `{}`: {e}", path.display()),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that TOML parsing cannot express: unique ids at
    /// every level and a sane attempt budget.
    fn validate(&self) -> Result<(), Error> {
        if self.gateway.max_attempts == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "gateway.max_attempts must be at least 1".to_string(),
            }));
        }
        let mut provider_ids = HashSet::new();
        let mut endpoint_ids = HashSet::new();
        let mut key_ids = HashSet::new();
        for provider in &self.providers {
            if !provider_ids.insert(&provider.id) {
                return Err(duplicate_id("provider", &provider.id));
            }
            for endpoint in &provider.endpoints {
                if !endpoint_ids.insert(&endpoint.id) {
                    return Err(duplicate_id("endpoint", &endpoint.id));
                }
                for key in &endpoint.keys {
                    if !key_ids.insert(&key.id) {
                        return Err(duplicate_id("key", &key.id));
                    }
                }
                if endpoint.keys.is_empty() {
                    tracing::warn!(
                        "Endpoint `{}` has no keys and will never serve traffic",
                        endpoint.id
                    );
                }
            }
        }
        Ok(())
    }

    /// Configured action limits overlaid on the defaults.
    pub fn action_limits(&self) -> HashMap<RateLimitAction, ActionLimit> {
        let mut limits = default_action_limits();
        for (action, overridden) in &self.rate_limits {
            limits.insert(
                *action,
                ActionLimit::new(overridden.max_requests, overridden.window_seconds),
            );
        }
        limits
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            max_attempts: self.gateway.max_attempts,
            attempt_timeout: Duration::from_millis(self.gateway.attempt_timeout_ms),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            connect_timeout: Duration::from_millis(self.gateway.http.connect_timeout_ms),
            timeout: Duration::from_millis(self.gateway.http.timeout_ms),
            pool_max_idle_per_host: self.gateway.http.pool_max_idle_per_host,
            proxy: self.gateway.http.proxy.clone(),
        }
    }
}

fn duplicate_id(kind: &str, id: &str) -> Error {
    Error::new(ErrorDetails::Config {
        message: format!("Duplicate {kind} id `{id}`"),
    })
}

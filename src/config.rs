//! Configuration management for Slidegate.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! the environment. The environment names are the flat ones deployments
//! already use (`REQUESTS_LIMIT_PER_WINDOW`, `RATE_LIMIT_WINDOW_MS`,
//! `ALLOW_REQUESTS_IF_REDIS_DOWN`, `REDIS_URL`). Everything is read once at
//! startup.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SlidegateError};

/// Main configuration for the Slidegate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlidegateConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Shared counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Admission limits
    #[serde(default)]
    pub limiter: LimiterConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Key anonymous callers by the first `X-Forwarded-For` hop
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// Header an upstream authenticator sets to the caller's subject id
    #[serde(default = "default_identity_header")]
    pub identity_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            trust_forwarded_for: false,
            identity_header: default_identity_header(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_identity_header() -> String {
    "x-authenticated-user".to_string()
}

/// Where window records are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis instance, for limits that hold across replicas
    #[default]
    Redis,
    /// In-process map; limits hold per replica only
    Memory,
}

/// Shared counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Counter store implementation
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Upper bound on a single store round-trip, in milliseconds
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,

    /// Namespace prepended to every rate limit key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            timeout_ms: default_store_timeout(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_store_timeout() -> u64 {
    500
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

impl StoreConfig {
    /// A zero timeout would fail every store call and leave only the degraded policy.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(SlidegateError::InvalidConfiguration(
                "store timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-limiter admission settings.
///
/// Fixed once a limiter is built from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Requests admitted per key inside one window
    #[serde(default = "default_request_limit")]
    pub request_limit_per_window: u64,

    /// Length of the sliding window in milliseconds
    #[serde(default = "default_window_size")]
    pub window_size_ms: u64,

    /// Admit everything while the store is unreachable
    #[serde(default)]
    pub allow_if_store_down: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            request_limit_per_window: default_request_limit(),
            window_size_ms: default_window_size(),
            allow_if_store_down: false,
        }
    }
}

fn default_request_limit() -> u64 {
    10
}

fn default_window_size() -> u64 {
    60
}

impl LimiterConfig {
    /// Build a validated limiter configuration.
    pub fn new(
        request_limit_per_window: u64,
        window_size_ms: u64,
        allow_if_store_down: bool,
    ) -> Result<Self> {
        let config = Self {
            request_limit_per_window,
            window_size_ms,
            allow_if_store_down,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would silently turn limiting off.
    pub fn validate(&self) -> Result<()> {
        if self.request_limit_per_window == 0 {
            return Err(SlidegateError::InvalidConfiguration(
                "request_limit_per_window must be positive".to_string(),
            ));
        }
        if self.window_size_ms == 0 {
            return Err(SlidegateError::InvalidConfiguration(
                "window_size_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Flat environment names, as deployments set them.
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    #[serde(alias = "REQUESTS_LIMIT_PER_WINDOW")]
    requests_limit_per_window: Option<u64>,
    #[serde(alias = "RATE_LIMIT_WINDOW_MS")]
    rate_limit_window_ms: Option<u64>,
    #[serde(alias = "ALLOW_REQUESTS_IF_REDIS_DOWN")]
    allow_requests_if_redis_down: Option<bool>,
    #[serde(alias = "REDIS_URL")]
    redis_url: Option<String>,
    #[serde(alias = "STORE_BACKEND")]
    store_backend: Option<StoreBackend>,
}

impl SlidegateConfig {
    /// Load configuration from a YAML file only.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: SlidegateConfig =
            serde_yaml::from_str(&contents).map_err(|e| SlidegateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section that can make limiting silently ineffective.
    pub fn validate(&self) -> Result<()> {
        self.limiter.validate()?;
        self.store.validate()
    }

    /// Load configuration from defaults, an optional file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Same as [`SlidegateConfig::load`], with an explicit environment map in
    /// place of the process environment when `env` is `Some`.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }
        let mut config: SlidegateConfig = builder.build()?.try_deserialize()?;

        let overrides: EnvOverrides = Config::builder()
            .add_source(Environment::default().try_parsing(true).source(env))
            .build()?
            .try_deserialize()?;

        if let Some(limit) = overrides.requests_limit_per_window {
            config.limiter.request_limit_per_window = limit;
        }
        if let Some(window) = overrides.rate_limit_window_ms {
            config.limiter.window_size_ms = window;
        }
        if let Some(allow) = overrides.allow_requests_if_redis_down {
            config.limiter.allow_if_store_down = allow;
        }
        if let Some(url) = overrides.redis_url {
            config.store.redis_url = url;
        }
        if let Some(backend) = overrides.store_backend {
            config.store.backend = backend;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults() {
        let config = SlidegateConfig::load_with_env(None, env(&[])).unwrap();

        assert_eq!(config.limiter.request_limit_per_window, 10);
        assert_eq!(config.limiter.window_size_ms, 60);
        assert!(!config.limiter.allow_if_store_down);
        assert_eq!(config.store.timeout_ms, 500);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.key_prefix, "ratelimit");
        assert_eq!(config.server.identity_header, "x-authenticated-user");
    }

    #[test]
    fn test_environment_overrides() {
        let config = SlidegateConfig::load_with_env(
            None,
            env(&[
                ("REQUESTS_LIMIT_PER_WINDOW", "25"),
                ("RATE_LIMIT_WINDOW_MS", "1000"),
                ("ALLOW_REQUESTS_IF_REDIS_DOWN", "true"),
                ("REDIS_URL", "redis://cache:6380"),
            ]),
        )
        .unwrap();

        assert_eq!(config.limiter.request_limit_per_window, 25);
        assert_eq!(config.limiter.window_size_ms, 1000);
        assert!(config.limiter.allow_if_store_down);
        assert_eq!(config.store.redis_url, "redis://cache:6380");
    }

    #[test]
    fn test_zero_limit_is_fatal() {
        let result =
            SlidegateConfig::load_with_env(None, env(&[("REQUESTS_LIMIT_PER_WINDOW", "0")]));
        assert!(matches!(result, Err(SlidegateError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_zero_store_timeout_is_fatal() {
        let store = StoreConfig {
            timeout_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            store.validate(),
            Err(SlidegateError::InvalidConfiguration(_))
        ));

        let dir = std::env::temp_dir().join(format!("slidegate-timeout-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("slidegate.yaml");
        std::fs::write(&path, "store:\n  timeout_ms: 0\n").unwrap();

        assert!(matches!(
            SlidegateConfig::from_file(path.to_str().unwrap()),
            Err(SlidegateError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            SlidegateConfig::load_with_env(Some(path.as_path()), env(&[])),
            Err(SlidegateError::InvalidConfiguration(_))
        ));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_memory_backend_selection() {
        let config =
            SlidegateConfig::load_with_env(None, env(&[("STORE_BACKEND", "memory")])).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);

        let parsed: StoreConfig = serde_yaml::from_str("backend: memory\n").unwrap();
        assert_eq!(parsed.backend, StoreBackend::Memory);
        assert!(serde_yaml::from_str::<StoreConfig>("backend: etcd\n").is_err());
    }

    #[test]
    fn test_limiter_config_validation() {
        assert!(LimiterConfig::new(3, 1000, false).is_ok());
        assert!(matches!(
            LimiterConfig::new(3, 0, false),
            Err(SlidegateError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            LimiterConfig::new(0, 1000, true),
            Err(SlidegateError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_yaml_file() {
        let dir = std::env::temp_dir().join(format!("slidegate-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("slidegate.yaml");
        std::fs::write(
            &path,
            concat!(
                "limiter:\n  request_limit_per_window: 3\n  window_size_ms: 1000\n",
                "store:\n  key_prefix: edge\n",
            ),
        )
        .unwrap();

        let config = SlidegateConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.limiter.request_limit_per_window, 3);
        assert_eq!(config.limiter.window_size_ms, 1000);
        assert_eq!(config.store.key_prefix, "edge");
        assert_eq!(config.store.timeout_ms, 500);

        let layered = SlidegateConfig::load_with_env(
            Some(path.as_path()),
            env(&[("RATE_LIMIT_WINDOW_MS", "250")]),
        )
        .unwrap();
        assert_eq!(layered.limiter.request_limit_per_window, 3);
        assert_eq!(layered.limiter.window_size_ms, 250);

        std::fs::remove_dir_all(&dir).ok();
    }
}

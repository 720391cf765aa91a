use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

use super::defaults;

/// Top-level configuration for the jailguard proxy.
/// Deserializes from a TOML configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "defaults::default_server_config")]
    pub server: ServerConfig,

    #[serde(default = "defaults::default_upstream_config")]
    pub upstream: UpstreamConfig,

    #[serde(default = "defaults::default_logging_config")]
    pub logging: LoggingConfig,

    #[serde(default = "defaults::default_rules_config")]
    pub rules: RulesConfig,

    #[serde(default)]
    pub allowlist: ListConfig,

    #[serde(default)]
    pub denylist: ListConfig,

    /// Deprecated alias of `allowlist`.
    #[serde(default)]
    pub whitelist: ListConfig,

    /// Deprecated alias of `denylist`.
    #[serde(default)]
    pub blacklist: ListConfig,

    #[serde(default)]
    pub trusted_proxies: TrustedProxiesConfig,

    #[serde(default = "defaults::default_backend_config")]
    pub backend: BackendConfig,
}

impl Settings {
    /// Load configuration from a TOML file at the given path.
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        Self::from_toml(&content).with_context(|| format!("Failed to parse config file: {}", path))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content)?;
        Ok(settings)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: defaults::default_server_config(),
            upstream: defaults::default_upstream_config(),
            logging: defaults::default_logging_config(),
            rules: defaults::default_rules_config(),
            allowlist: ListConfig::default(),
            denylist: ListConfig::default(),
            whitelist: ListConfig::default(),
            blacklist: ListConfig::default(),
            trusted_proxies: TrustedProxiesConfig::default(),
            backend: defaults::default_backend_config(),
        }
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "defaults::default_bind")]
    pub bind: String,

    #[serde(default = "defaults::default_max_connections")]
    pub max_connections: usize,
}

/// Upstream backend server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "defaults::default_upstream_address")]
    pub address: String,

    #[serde(default = "defaults::default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Level for jailguard's own targets; other crates log at `info`.
    /// `RUST_LOG` overrides both.
    #[serde(default = "defaults::default_log_level")]
    pub level: String,

    /// Log file path; empty disables file output.
    #[serde(default)]
    pub file: String,
}

/// Ban rules as written by the operator. Compiled by
/// [`crate::protection::rules::RuleSet::compile`].
#[derive(Debug, Clone, Deserialize)]
pub struct RulesConfig {
    #[serde(default = "defaults::default_rules_enabled")]
    pub enabled: bool,

    #[serde(default = "defaults::default_bantime")]
    pub bantime: String,

    #[serde(default = "defaults::default_findtime")]
    pub findtime: String,

    /// Absent or zero disables ban tracking.
    #[serde(default)]
    pub maxretry: Option<i64>,

    /// Backend status codes counted as failures, e.g. `"400,401,403,500-599"`.
    #[serde(default)]
    pub statuscode: Option<String>,

    #[serde(default)]
    pub urlregexps: Vec<UrlRegexpConfig>,
}

/// One URL rule; `mode` is `allow` or `block`.
#[derive(Debug, Clone, Deserialize)]
pub struct UrlRegexpConfig {
    pub regexp: String,

    #[serde(default = "defaults::default_url_mode")]
    pub mode: String,
}

/// An IP list given inline and/or as files with one entry per line.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListConfig {
    #[serde(default)]
    pub ip: Vec<String>,

    #[serde(default)]
    pub files: Vec<String>,
}

impl ListConfig {
    pub fn is_empty(&self) -> bool {
        self.ip.is_empty() && self.files.is_empty()
    }
}

/// Peers whose client-address headers are believed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrustedProxiesConfig {
    #[serde(default)]
    pub ips: Vec<String>,

    /// Header names consulted in order, e.g. `["X-Real-IP", "X-Forwarded-For"]`.
    #[serde(default)]
    pub headers: Vec<String>,
}

/// Ban store selection.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// `memory` or `redis`; anything else falls back to `memory`.
    #[serde(rename = "type", default = "defaults::default_backend_type")]
    pub kind: String,

    /// Deadline for a single shared-backend operation.
    #[serde(default = "defaults::default_backend_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "defaults::default_redis_config")]
    pub redis: RedisConfig,
}

/// Connection parameters of the shared backend.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "defaults::default_redis_host")]
    pub host: String,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub db: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings.server.bind, "0.0.0.0:8000");
        assert_eq!(settings.rules.bantime, "300s");
        assert_eq!(settings.rules.findtime, "120s");
        assert!(settings.rules.enabled);
        assert!(settings.rules.maxretry.is_none());
        assert_eq!(settings.backend.kind, "memory");
        assert_eq!(settings.backend.timeout_ms, 500);
    }

    #[test]
    fn test_full_config() {
        let settings = Settings::from_toml(
            r#"
            [rules]
            bantime = "3h"
            findtime = "10m"
            maxretry = 4
            statuscode = "400,401,403-499"

            [[rules.urlregexps]]
            regexp = "/no"
            mode = "block"

            [[rules.urlregexps]]
            regexp = "/yes"
            mode = "allow"

            [allowlist]
            ip = ["::1", "127.0.0.1"]

            [denylist]
            ip = ["192.168.0.0/24"]
            files = ["/etc/jailguard/deny.txt"]

            [trusted_proxies]
            ips = ["10.0.0.0/8"]
            headers = ["X-Real-IP"]

            [backend]
            type = "redis"
            timeout_ms = 250

            [backend.redis]
            host = "redis:6379"
            password = "secret"
            db = 3
            "#,
        )
        .unwrap();

        assert_eq!(settings.rules.maxretry, Some(4));
        assert_eq!(settings.rules.urlregexps.len(), 2);
        assert_eq!(settings.rules.urlregexps[1].mode, "allow");
        assert_eq!(settings.allowlist.ip, vec!["::1", "127.0.0.1"]);
        assert_eq!(settings.denylist.files.len(), 1);
        assert_eq!(settings.trusted_proxies.headers, vec!["X-Real-IP"]);
        assert_eq!(settings.backend.kind, "redis");
        assert_eq!(settings.backend.redis.db, 3);
        assert_eq!(settings.backend.redis.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_url_rule_mode_defaults_to_block() {
        let settings = Settings::from_toml(
            r#"
            [[rules.urlregexps]]
            regexp = "/wp-login"
            "#,
        )
        .unwrap();
        assert_eq!(settings.rules.urlregexps[0].mode, "block");
    }
}

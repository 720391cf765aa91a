use super::settings::{BackendConfig, LoggingConfig, RedisConfig, RulesConfig, ServerConfig, UpstreamConfig};

// ---------------------------------------------------------------------------
// Top-level struct defaults
// ---------------------------------------------------------------------------

pub fn default_server_config() -> ServerConfig {
    ServerConfig {
        bind: default_bind(),
        max_connections: default_max_connections(),
    }
}

pub fn default_upstream_config() -> UpstreamConfig {
    UpstreamConfig {
        address: default_upstream_address(),
        response_timeout_ms: default_response_timeout_ms(),
    }
}

pub fn default_logging_config() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        file: String::new(),
    }
}

pub fn default_rules_config() -> RulesConfig {
    RulesConfig {
        enabled: default_rules_enabled(),
        bantime: default_bantime(),
        findtime: default_findtime(),
        maxretry: None,
        statuscode: None,
        urlregexps: Vec::new(),
    }
}

pub fn default_backend_config() -> BackendConfig {
    BackendConfig {
        kind: default_backend_type(),
        timeout_ms: default_backend_timeout_ms(),
        redis: default_redis_config(),
    }
}

pub fn default_redis_config() -> RedisConfig {
    RedisConfig {
        host: default_redis_host(),
        password: None,
        db: 0,
    }
}

// ---------------------------------------------------------------------------
// ServerConfig / UpstreamConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

pub fn default_max_connections() -> usize {
    10_000
}

pub fn default_upstream_address() -> String {
    "127.0.0.1:8080".to_string()
}

pub fn default_response_timeout_ms() -> u64 {
    60_000
}

// ---------------------------------------------------------------------------
// LoggingConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_log_level() -> String {
    "debug".to_string()
}

// ---------------------------------------------------------------------------
// RulesConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_rules_enabled() -> bool {
    true
}

pub fn default_bantime() -> String {
    "300s".to_string()
}

pub fn default_findtime() -> String {
    "120s".to_string()
}

pub fn default_url_mode() -> String {
    "block".to_string()
}

// ---------------------------------------------------------------------------
// BackendConfig field defaults
// ---------------------------------------------------------------------------

pub fn default_backend_type() -> String {
    "memory".to_string()
}

pub fn default_backend_timeout_ms() -> u64 {
    500
}

pub fn default_redis_host() -> String {
    "127.0.0.1:6379".to_string()
}

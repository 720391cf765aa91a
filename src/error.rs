//! Error types shared by the rule compiler, the list matchers, the proxy
//! resolver and the ban stores.

use std::fmt;

/// Result type for startup-time compilation of rules and lists.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Result type for ban store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised while compiling configuration. Always fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A `bantime` / `findtime` value could not be parsed.
    InvalidDuration { field: &'static str, value: String },

    /// A URL regular expression failed to compile.
    InvalidPattern { pattern: String, reason: String },

    /// A URL rule carried a mode other than `allow` or `block`.
    InvalidMode { pattern: String, mode: String },

    /// A `maxretry` that is negative or does not fit a counter.
    InvalidThreshold(i64),

    /// An allow/deny/trusted-proxy entry that is neither an address nor a CIDR.
    InvalidAddress(String),

    /// A malformed `statuscode` list.
    InvalidStatusCode(String),

    /// A configured header name that is not a valid HTTP header name.
    InvalidHeader(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDuration { field, value } => {
                write!(f, "invalid duration for {field}: {value:?}")
            }
            Self::InvalidPattern { pattern, reason } => {
                write!(f, "invalid url pattern {pattern:?}: {reason}")
            }
            Self::InvalidMode { pattern, mode } => {
                write!(f, "invalid mode {mode:?} for url pattern {pattern:?} (expected allow or block)")
            }
            Self::InvalidThreshold(n) => write!(f, "invalid maxretry {n}: must be zero or a positive count"),
            Self::InvalidAddress(entry) => write!(f, "invalid IP address or CIDR: {entry:?}"),
            Self::InvalidStatusCode(list) => write!(f, "invalid status code list: {list:?}"),
            Self::InvalidHeader(name) => write!(f, "invalid header name: {name:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// The connection address of a request could not be split into host and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    MalformedAddress(String),
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedAddress(addr) => write!(f, "malformed connection address: {addr:?}"),
        }
    }
}

impl std::error::Error for ResolveError {}

/// Failures of a ban store backend. Recovered locally by the chain (fail-open).
#[derive(Debug)]
pub enum StoreError {
    /// The backend returned an error or could not be reached.
    Backend(String),

    /// The backend did not answer within the configured deadline.
    Timeout,

    /// A stored field could not be decoded.
    Corrupt { field: &'static str, value: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend(msg) => write!(f, "ban store backend error: {msg}"),
            Self::Timeout => write!(f, "ban store backend timed out"),
            Self::Corrupt { field, value } => {
                write!(f, "ban store field {field} holds undecodable value {value:?}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// A chain stage could not reach a decision. The chain logs it and moves on.
#[derive(Debug)]
pub enum StageError {
    Store(StoreError),
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for StageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
        }
    }
}

impl From<StoreError> for StageError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_error_names_offender() {
        let err = ConfigError::InvalidPattern {
            pattern: "/admin(".to_string(),
            reason: "unclosed group".to_string(),
        };
        assert!(err.to_string().contains("/admin("));
    }

    #[test]
    fn test_duration_error_names_field() {
        let err = ConfigError::InvalidDuration {
            field: "bantime",
            value: "forever".to_string(),
        };
        assert_eq!(err.to_string(), "invalid duration for bantime: \"forever\"");
    }
}

use regex::Regex;

use crate::error::{ConfigError, ConfigResult};

/// Ordered list of compiled URL patterns. The first match wins.
#[derive(Debug, Clone, Default)]
pub struct UrlList {
    patterns: Vec<Regex>,
}

impl UrlList {
    /// Compile `patterns`, keeping their order.
    pub fn new<I, S>(patterns: I) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| compile_pattern(p.as_ref()))
            .collect::<ConfigResult<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub(crate) fn from_compiled(patterns: Vec<Regex>) -> Self {
        Self { patterns }
    }

    /// Source of the first pattern matching `url`, if any.
    pub fn find(&self, url: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|re| re.is_match(url))
            .map(Regex::as_str)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

pub(crate) fn compile_pattern(pattern: &str) -> ConfigResult<Regex> {
    Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

//! Compilation of operator-written rules into the immutable [`RuleSet`]
//! shared by every request.

use std::ops::RangeInclusive;
use std::time::Duration;

use tracing::info;

use crate::config::settings::RulesConfig;
use crate::error::{ConfigError, ConfigResult};

use super::url_filter::{compile_pattern, UrlList};

/// Thresholds driving a ban store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BanPolicy {
    /// Failures within `find_time` that trigger a ban. Always at least 1.
    pub max_retry: u32,
    pub ban_time: Duration,
    pub find_time: Duration,
}

/// Compiled, read-only rules.
#[derive(Debug, Clone)]
pub struct RuleSet {
    /// `None` when ban tracking is disabled.
    pub max_retry: Option<u32>,
    pub ban_time: Duration,
    pub find_time: Duration,
    pub deny_urls: UrlList,
    pub allow_urls: UrlList,
    pub status_codes: Option<StatusCodes>,
}

impl RuleSet {
    pub fn compile(config: &RulesConfig) -> ConfigResult<Self> {
        let ban_time = parse_duration(&config.bantime).ok_or_else(|| ConfigError::InvalidDuration {
            field: "bantime",
            value: config.bantime.clone(),
        })?;
        let find_time =
            parse_duration(&config.findtime).ok_or_else(|| ConfigError::InvalidDuration {
                field: "findtime",
                value: config.findtime.clone(),
            })?;

        let max_retry = match config.maxretry {
            None | Some(0) => None,
            Some(n) => Some(u32::try_from(n).map_err(|_| ConfigError::InvalidThreshold(n))?),
        };

        let mut deny = Vec::new();
        let mut allow = Vec::new();
        for rule in &config.urlregexps {
            let regex = compile_pattern(&rule.regexp)?;
            match rule.mode.trim().to_ascii_lowercase().as_str() {
                "block" => deny.push(regex),
                "allow" => allow.push(regex),
                _ => {
                    return Err(ConfigError::InvalidMode {
                        pattern: rule.regexp.clone(),
                        mode: rule.mode.clone(),
                    })
                }
            }
        }

        let status_codes = match config.statuscode.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(list) => Some(StatusCodes::parse(list)?),
        };

        let rules = Self {
            max_retry,
            ban_time,
            find_time,
            deny_urls: UrlList::from_compiled(deny),
            allow_urls: UrlList::from_compiled(allow),
            status_codes,
        };

        info!(
            bantime = %config.bantime,
            findtime = %config.findtime,
            maxretry = ?rules.max_retry,
            deny_urls = rules.deny_urls.len(),
            allow_urls = rules.allow_urls.len(),
            statuscode = ?config.statuscode,
            "Rules compiled"
        );

        Ok(rules)
    }

    /// Policy for the ban store, or `None` when ban tracking is disabled.
    pub fn ban_policy(&self) -> Option<BanPolicy> {
        self.max_retry.map(|max_retry| BanPolicy {
            max_retry,
            ban_time: self.ban_time,
            find_time: self.find_time,
        })
    }
}

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

/// Set of HTTP status codes written as `"400,401,403-499"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCodes {
    ranges: Vec<RangeInclusive<u16>>,
}

impl StatusCodes {
    pub fn parse(list: &str) -> ConfigResult<Self> {
        let invalid = || ConfigError::InvalidStatusCode(list.to_string());

        let mut ranges = Vec::new();
        for part in list.split(',').map(str::trim) {
            let (lo, hi) = match part.split_once('-') {
                Some((lo, hi)) => (lo.trim(), hi.trim()),
                None => (part, part),
            };
            let lo = parse_status(lo).ok_or_else(invalid)?;
            let hi = parse_status(hi).ok_or_else(invalid)?;
            if lo > hi {
                return Err(invalid());
            }
            ranges.push(lo..=hi);
        }

        Ok(Self { ranges })
    }

    pub fn contains(&self, status: u16) -> bool {
        self.ranges.iter().any(|r| r.contains(&status))
    }
}

fn parse_status(s: &str) -> Option<u16> {
    s.parse::<u16>().ok().filter(|code| (100..=599).contains(code))
}

// ---------------------------------------------------------------------------
// Durations
// ---------------------------------------------------------------------------

const UNITS: &[(&str, u128)] = &[
    ("ns", 1),
    ("us", 1_000),
    ("\u{b5}s", 1_000),
    ("\u{3bc}s", 1_000),
    ("ms", 1_000_000),
    ("s", 1_000_000_000),
    ("m", 60_000_000_000),
    ("h", 3_600_000_000_000),
];

/// Parse a duration such as `300s`, `1h30m` or `1.5h`.
///
/// The input is a sequence of decimal numbers, each with an optional
/// fraction and a mandatory unit (`ns`, `us`, `µs`, `ms`, `s`, `m`, `h`).
/// The unit-less string `0` is also accepted. Negative durations are not.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let mut rest = input.trim();
    if rest == "0" {
        return Some(Duration::ZERO);
    }
    if rest.is_empty() {
        return None;
    }

    let mut total: u128 = 0;
    while !rest.is_empty() {
        let int_len = rest.bytes().take_while(u8::is_ascii_digit).count();
        let (int_part, after) = rest.split_at(int_len);

        let (frac_part, after) = match after.strip_prefix('.') {
            Some(tail) => {
                let frac_len = tail.bytes().take_while(u8::is_ascii_digit).count();
                tail.split_at(frac_len)
            }
            None => ("", after),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return None;
        }

        let (unit, scale) = UNITS
            .iter()
            .filter(|(name, _)| after.starts_with(name))
            .max_by_key(|(name, _)| name.len())?;
        rest = &after[unit.len()..];

        let whole: u128 = if int_part.is_empty() { 0 } else { int_part.parse().ok()? };
        let mut nanos = whole.checked_mul(*scale)?;
        if !frac_part.is_empty() {
            // Digits past nanosecond precision cannot contribute.
            let digits = &frac_part[..frac_part.len().min(18)];
            let frac: u128 = digits.parse().ok()?;
            nanos = nanos.checked_add(frac * scale / 10u128.pow(digits.len() as u32))?;
        }
        total = total.checked_add(nanos)?;
    }

    u64::try_from(total).ok().map(Duration::from_nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::UrlRegexpConfig;

    fn config() -> RulesConfig {
        crate::config::defaults::default_rules_config()
    }

    fn url_rule(regexp: &str, mode: &str) -> UrlRegexpConfig {
        UrlRegexpConfig {
            regexp: regexp.to_string(),
            mode: mode.to_string(),
        }
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("300s"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("10m"), Some(Duration::from_secs(600)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5_400)));
        assert_eq!(parse_duration("1.5h"), Some(Duration::from_secs(5_400)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("3µs"), Some(Duration::from_micros(3)));
        assert_eq!(parse_duration(".5s"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("0"), Some(Duration::ZERO));
        assert_eq!(parse_duration(" 2h "), Some(Duration::from_secs(7_200)));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        for bad in ["", "300", "s", "5d", "-5s", "1h 30m", "1.s.", "forever", "1e3s"] {
            assert_eq!(parse_duration(bad), None, "{bad:?} should not parse");
        }
    }

    #[test]
    fn test_parse_duration_overflow() {
        assert_eq!(parse_duration("99999999999999999999999h"), None);
    }

    #[test]
    fn test_compile_defaults() {
        let rules = RuleSet::compile(&config()).unwrap();
        assert_eq!(rules.ban_time, Duration::from_secs(300));
        assert_eq!(rules.find_time, Duration::from_secs(120));
        assert_eq!(rules.max_retry, None);
        assert!(rules.ban_policy().is_none());
        assert!(rules.deny_urls.is_empty());
        assert!(rules.status_codes.is_none());
    }

    #[test]
    fn test_compile_splits_url_rules_in_order() {
        let mut cfg = config();
        cfg.maxretry = Some(3);
        cfg.urlregexps = vec![
            url_rule("/wp-login", "block"),
            url_rule("/health", "allow"),
            url_rule(r"\.env$", "BLOCK"),
        ];

        let rules = RuleSet::compile(&cfg).unwrap();
        assert_eq!(rules.deny_urls.len(), 2);
        assert_eq!(rules.allow_urls.len(), 1);
        assert_eq!(rules.deny_urls.find("/.env"), Some(r"\.env$"));
        assert_eq!(
            rules.ban_policy(),
            Some(BanPolicy {
                max_retry: 3,
                ban_time: Duration::from_secs(300),
                find_time: Duration::from_secs(120),
            })
        );
    }

    #[test]
    fn test_compile_errors() {
        let mut cfg = config();
        cfg.bantime = "five minutes".to_string();
        assert_eq!(
            RuleSet::compile(&cfg).unwrap_err(),
            ConfigError::InvalidDuration {
                field: "bantime",
                value: "five minutes".to_string(),
            }
        );

        let mut cfg = config();
        cfg.findtime = "10".to_string();
        assert!(matches!(
            RuleSet::compile(&cfg),
            Err(ConfigError::InvalidDuration { field: "findtime", .. })
        ));

        let mut cfg = config();
        cfg.maxretry = Some(-1);
        assert_eq!(RuleSet::compile(&cfg).unwrap_err(), ConfigError::InvalidThreshold(-1));

        let mut cfg = config();
        cfg.urlregexps = vec![url_rule("[", "block")];
        assert!(matches!(
            RuleSet::compile(&cfg),
            Err(ConfigError::InvalidPattern { pattern, .. }) if pattern == "["
        ));

        let mut cfg = config();
        cfg.urlregexps = vec![url_rule("/x", "maybe")];
        assert!(matches!(RuleSet::compile(&cfg), Err(ConfigError::InvalidMode { .. })));

        let mut cfg = config();
        cfg.statuscode = Some("400,abc".to_string());
        assert!(matches!(RuleSet::compile(&cfg), Err(ConfigError::InvalidStatusCode(_))));
    }

    #[test]
    fn test_zero_maxretry_disables_tracking() {
        let mut cfg = config();
        cfg.maxretry = Some(0);
        assert!(RuleSet::compile(&cfg).unwrap().ban_policy().is_none());
    }

    #[test]
    fn test_status_codes() {
        let codes = StatusCodes::parse("400, 401,403-499,500-599").unwrap();
        assert!(codes.contains(400));
        assert!(codes.contains(401));
        assert!(!codes.contains(402));
        assert!(codes.contains(404));
        assert!(codes.contains(599));
        assert!(!codes.contains(200));

        assert!(StatusCodes::parse("499-400").is_err());
        assert!(StatusCodes::parse("600").is_err());
        assert!(StatusCodes::parse("400,").is_err());
    }

    #[test]
    fn test_blank_statuscode_is_absent() {
        let mut cfg = config();
        cfg.statuscode = Some("  ".to_string());
        assert!(RuleSet::compile(&cfg).unwrap().status_codes.is_none());
    }
}

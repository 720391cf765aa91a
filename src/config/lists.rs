//! Gathering of allow/deny entries from inline configuration and files.

use std::fs;

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::settings::{ListConfig, Settings};

/// Collect every entry of `list`: the lines of each file first, then the
/// inline entries. Blank lines and `#` comments are skipped.
pub fn import_ips(list: &ListConfig) -> Result<Vec<String>> {
    let mut entries = Vec::new();

    for path in &list.files {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read IP list file: {}", path))?;
        let before = entries.len();
        entries.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
        info!(file = %path, entries = entries.len() - before, "Loaded IP list file");
    }

    entries.extend(list.ip.iter().cloned());
    Ok(entries)
}

/// Entries of the allow list, including the deprecated `whitelist` section.
pub fn allow_entries(settings: &Settings) -> Result<Vec<String>> {
    let mut entries = import_ips(&settings.allowlist).context("Failed to import allowlist")?;
    if !settings.whitelist.is_empty() {
        warn!("'whitelist' is deprecated, please use 'allowlist' instead");
        entries.extend(import_ips(&settings.whitelist).context("Failed to import whitelist")?);
    }
    Ok(entries)
}

/// Entries of the deny list, including the deprecated `blacklist` section.
pub fn deny_entries(settings: &Settings) -> Result<Vec<String>> {
    let mut entries = import_ips(&settings.denylist).context("Failed to import denylist")?;
    if !settings.blacklist.is_empty() {
        warn!("'blacklist' is deprecated, please use 'denylist' instead");
        entries.extend(import_ips(&settings.blacklist).context("Failed to import blacklist")?);
    }
    Ok(entries)
}

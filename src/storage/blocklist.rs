use std::collections::HashSet;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;

use crate::error::{ConfigError, ConfigResult};

// ---------------------------------------------------------------------------
// IpList – compiled set of addresses and CIDR ranges
// ---------------------------------------------------------------------------

/// An immutable set of literal addresses plus address ranges.
///
/// Used for the allow list, the deny list and the trusted-proxy set. The
/// only question ever asked is membership, so ranges are scanned linearly
/// and no longest-prefix bookkeeping is kept.
#[derive(Debug, Clone, Default)]
pub struct IpList {
    addrs: HashSet<IpAddr>,
    cidrs: Vec<IpNet>,
}

impl IpList {
    /// Compile a list of entries. Blank entries are skipped; anything else
    /// must be an IP address or a CIDR.
    pub fn new<I, S>(entries: I) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::default();

        for raw in entries {
            let entry = raw.as_ref().trim();
            if entry.is_empty() {
                continue;
            }

            if entry.contains('/') {
                let net = IpNet::from_str(entry)
                    .map_err(|_| ConfigError::InvalidAddress(entry.to_string()))?;
                list.cidrs.push(net.trunc());
            } else {
                let ip = IpAddr::from_str(entry)
                    .map_err(|_| ConfigError::InvalidAddress(entry.to_string()))?;
                list.addrs.insert(ip);
            }
        }

        Ok(list)
    }

    /// Whether `ip` is a member. Identities that are not IP addresses are
    /// never members.
    pub fn contains(&self, ip: &str) -> bool {
        match IpAddr::from_str(ip.trim()) {
            Ok(addr) => self.contains_addr(&addr),
            Err(_) => false,
        }
    }

    fn contains_addr(&self, ip: &IpAddr) -> bool {
        if self.addrs.contains(ip) {
            return true;
        }
        self.cidrs.iter().any(|net| net.contains(ip))
    }

    pub fn len(&self) -> usize {
        self.addrs.len() + self.cidrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

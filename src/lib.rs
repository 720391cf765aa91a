//! Fail2ban-style request filtering for HTTP reverse proxies.
//!
//! A [`protection::chain::Chain`] resolves the client behind trusted
//! proxies, runs it through static IP and URL allow/deny lists and checks
//! it against a [`storage::BanStore`] that bans clients after repeated
//! failures within a time window.

pub mod config;
pub mod error;
pub mod models;
pub mod protection;
pub mod proxy;
pub mod storage;

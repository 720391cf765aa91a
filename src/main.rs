use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use jailguard::config::lists;
use jailguard::config::settings::{LoggingConfig, Settings};
use jailguard::protection::chain::Chain;
use jailguard::protection::resolver::TrustedProxies;
use jailguard::protection::rules::RuleSet;
use jailguard::protection::status::StatusObserver;
use jailguard::proxy::http_handler::HttpHandler;
use jailguard::proxy::server::ProxyServer;
use jailguard::storage::blocklist::IpList;
use jailguard::storage::memory::MemoryStore;
use jailguard::storage::{self, Backend};

/// Parse the `--config` CLI flag. Defaults to `/etc/jailguard/jailguard.toml`.
fn parse_config_path() -> String {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = String::from("/etc/jailguard/jailguard.toml");

    let mut i = 1;
    while i < args.len() {
        if args[i] == "--config" {
            if let Some(path) = args.get(i + 1) {
                config_path = path.clone();
            }
            i += 2;
        } else {
            i += 1;
        }
    }

    config_path
}

/// Initialise the `tracing` subscriber: stdout always, plus a file when
/// `logging.file` is set. The returned guard flushes the file on drop.
fn init_tracing(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,jailguard={}", logging.level)));

    let stdout_layer = fmt::layer().with_writer(std::io::stdout).with_target(true);

    if logging.file.is_empty() {
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
        return Ok(None);
    }

    if let Some(dir) = std::path::Path::new(&logging.file).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
        }
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&logging.file)
        .with_context(|| format!("Failed to open log file: {}", logging.file))?;
    let (writer, guard) = tracing_appender::non_blocking(log_file);

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Ok(Some(guard))
}

/// Background task that periodically evicts expired records from the
/// in-memory ban store.
async fn cleanup_loop(memory: Arc<MemoryStore>) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let removed = memory.cleanup();
        if removed > 0 {
            info!(removed, remaining = memory.len(), "Expired ban records evicted");
        }
    }
}

/// Compile the configuration into a chain and, when status codes are
/// configured, the observer that feeds backend statuses into the store.
fn build_chain(settings: &Settings) -> Result<(Chain, Option<StatusObserver>, Option<Arc<MemoryStore>>)> {
    let rules = RuleSet::compile(&settings.rules).context("Invalid rules")?;

    let allow = IpList::new(lists::allow_entries(settings)?).context("Invalid allowlist")?;
    let deny = IpList::new(lists::deny_entries(settings)?).context("Invalid denylist")?;
    let proxies =
        TrustedProxies::from_config(&settings.trusted_proxies).context("Invalid trusted proxies")?;
    info!(
        allow = allow.len(),
        deny = deny.len(),
        trusted_headers = settings.trusted_proxies.headers.len(),
        "IP lists loaded"
    );

    let Backend { store, memory } =
        storage::open(&settings.backend, rules.ban_policy()).context("Failed to open ban store")?;

    let observer = rules
        .status_codes
        .clone()
        .map(|codes| StatusObserver::new(codes, store.clone()));

    let chain = Chain::builder()
        .trusted_proxies(proxies)
        .deny_ips(deny)
        .allow_ips(allow)
        .rules(&rules)
        .store(store)
        .build();
    info!(stages = ?chain.stage_names(), "Evaluation chain built");

    Ok((chain, observer, memory))
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---------------------------------------------------------------
    // 1. Configuration
    // ---------------------------------------------------------------
    let config_path = parse_config_path();
    let settings = Settings::load(&config_path)?;

    // ---------------------------------------------------------------
    // 2. Logging
    // ---------------------------------------------------------------
    let _log_guard = init_tracing(&settings.logging)?;

    info!("Starting jailguard");
    info!("Config loaded from {}", config_path);

    // ---------------------------------------------------------------
    // 3. Rules, lists and ban store
    // ---------------------------------------------------------------
    let (chain, observer, memory) = if settings.rules.enabled {
        let (chain, observer, memory) = build_chain(&settings)?;
        (Some(Arc::new(chain)), observer.map(Arc::new), memory)
    } else {
        info!("Rules disabled, forwarding every request");
        (None, None, None)
    };

    // ---------------------------------------------------------------
    // 4. Proxy
    // ---------------------------------------------------------------
    let handler = Arc::new(HttpHandler::new(
        chain,
        observer,
        settings.upstream.address.clone(),
        Duration::from_millis(settings.upstream.response_timeout_ms),
    ));
    info!(upstream = %settings.upstream.address, "Upstream configured");

    let proxy_server = ProxyServer::new(
        settings.server.bind.clone(),
        settings.server.max_connections,
        handler,
    );

    // ---------------------------------------------------------------
    // 5. Spawn everything
    // ---------------------------------------------------------------
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy_server.run().await {
            error!("Proxy server error: {:#}", e);
        }
    });

    let cleanup_handle = memory.map(|memory| tokio::spawn(cleanup_loop(memory)));

    info!("jailguard is running. Press Ctrl+C to shut down.");

    // ---------------------------------------------------------------
    // 6. Wait for shutdown signal
    // ---------------------------------------------------------------
    tokio::signal::ctrl_c().await?;
    info!("Shutting down jailguard...");

    proxy_handle.abort();
    if let Some(handle) = cleanup_handle {
        handle.abort();
    }

    info!("jailguard shut down gracefully");
    Ok(())
}

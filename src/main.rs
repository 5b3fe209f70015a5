use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tenantgate::config::Config;
use tenantgate::manager::InstanceManager;
use tenantgate::pool::{ConnectionPool, PoolConfig};
use tenantgate::proxy::ProxyServer;
use tenantgate::tenant::TenantResolver;
use tenantgate::{PKG_NAME, VERSION};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tenantgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("tenantgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: config.server.pool_idle_timeout(),
        backend_host: config.backend.host.clone(),
    }));

    let pool_stats = pool.stats();
    let manager = InstanceManager::from_config(&config, Arc::clone(&pool))?;

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::new(
        bind_addr,
        Arc::clone(&manager),
        TenantResolver::new(config.server.min_host_labels),
        pool,
        shutdown_rx,
    )
    .with_request_timeout(config.server.request_timeout());

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    info!("Press Ctrl+C to stop");
    wait_for_shutdown_signal().await;

    let _ = shutdown_tx.send(true);

    if config.server.stop_backends_on_shutdown {
        info!("Stopping all backends...");
        manager.stop_all().await;
    } else {
        let running = manager.len().await;
        if running > 0 {
            warn!(instances = running, "Leaving tenant backends running");
        }
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;

    let stats = manager.stats();
    let relay = pool_stats.as_ref();
    info!(
        cold_starts = stats.get_attempts(),
        created = stats.get_created(),
        failed = stats.get_failed(),
        relayed = relay.relayed(),
        relay_failures = relay.relay_failures(),
        probes = relay.probes(),
        "Final statistics"
    );

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, only Ctrl+C will stop the proxy");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), shutting down...");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting tenant router");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        min_host_labels = config.server.min_host_labels,
        request_timeout_secs = ?config.server.request_timeout_secs,
        stop_backends_on_shutdown = config.server.stop_backends_on_shutdown,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        command = %config.backend.command,
        args = ?config.backend.args,
        host = %config.backend.host,
        "Backend command"
    );
    info!(
        health_path = %config.backend.health_path,
        probe_attempts = config.backend.probe_attempts,
        probe_interval_ms = config.backend.probe_interval_ms,
        probe_timeout_ms = config.backend.probe_timeout_ms,
        probe_budget_ms = config.backend.probe_budget().as_millis() as u64,
        "Readiness probe settings"
    );
}

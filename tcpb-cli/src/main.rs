//! tcp-balance
//!
//! Command line entry point: resolves the configuration, starts the balancer
//! and serves clients until SIGINT or SIGTERM.

mod args;

use anyhow::{Context, Result};
use args::Cli;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tcpb_core::Config;
use tcpb_loadbalance::Balancer;
use tcpb_relay::Listener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// `--check` 模式下等待首次探测完成的最长时间
const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let config = match cli.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return Err(e);
        }
    };

    if cli.check {
        return check(&config).await;
    }

    serve(config).await
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn serve(config: Config) -> Result<()> {
    let bind = config.bind_address();
    let balancer = Arc::new(Balancer::from_config(&config));

    let listener = Listener::bind(&bind, balancer.clone(), &config.settings)
        .await
        .with_context(|| format!("Failed to start listener on {}", bind))?;

    info!(
        "Balancing {} upstreams with {} strategy on {}",
        config.upstreams.len(),
        config.strategy,
        listener.local_addr()?
    );

    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn(listener.run(shutdown.clone()));

    let result = tokio::select! {
        result = &mut server => result,
        _ = shutdown_signal() => {
            shutdown.cancel();
            server.await
        }
    };

    balancer.clear_upstreams();
    result.context("Listener task failed")??;

    info!("Stopped");
    Ok(())
}

/// 打印配置摘要，等待每个上游完成首次探测后打印健康状态
async fn check(config: &Config) -> Result<()> {
    println!("Configuration is valid");
    println!("  - bind: {}", config.bind_address());
    println!("  - strategy: {}", config.strategy);
    println!("  - probe interval: {}s", config.settings.probe_interval_seconds);
    println!("  - {} upstreams configured", config.upstreams.len());

    let balancer = Balancer::from_config(config);
    let pool = balancer.pool();

    let probed = tokio::time::timeout(CHECK_TIMEOUT, async {
        while pool.snapshot().iter().any(|u| u.last_check().is_none()) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;

    if probed.is_err() {
        println!("Some upstreams did not answer within {}s", CHECK_TIMEOUT.as_secs());
    }

    for status in balancer.upstream_statuses() {
        let state = if status.alive { "up" } else { "down" };
        println!("  {}:{} (weight {}) is {}", status.host, status.port, status.weight, state);
    }

    let stats = balancer.health_stats();
    info!(
        "Health: {}/{} upstreams alive ({:.0}%)",
        stats.alive_upstreams,
        stats.total_upstreams,
        stats.health_ratio * 100.0
    );
    balancer.clear_upstreams();

    if !stats.is_healthy() && stats.total_upstreams > 0 {
        anyhow::bail!("No upstream is reachable");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
}

//! Combainer daemon
//!
//! Usage:
//!   # Single node
//!   combainerd --configs /etc/combaine --start-as-leader
//!
//!   # Joining node of a three-node cluster
//!   combainerd --node-id combainer-02 \
//!     --seeds combainer-01:7946 \
//!     --bootstrap-expect 3 \
//!     --data-dir /var/lib/combainer

use anyhow::Context;
use clap::Parser;
use combainer_cluster::{init_metrics, ClusterConfig, ClusterContext, FilesystemRepository, Repository};
use combainerd::{ApiState, Cli};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = cli.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let repo = Arc::new(
        FilesystemRepository::new(&cli.configs)
            .with_context(|| format!("open config repository {}", cli.configs.display()))?,
    );
    let defaults = repo
        .get_combainer_config()
        .context("read combaine.yaml")?;
    let config = cli
        .to_cluster_config(&defaults.main().cluster)
        .map_err(anyhow::Error::msg)?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("create data dir {}", config.data_dir.display()))?;

    print_banner(&cli, &config);

    init_metrics(cli.metrics_addr).map_err(|e| anyhow::anyhow!("init metrics: {}", e))?;

    let raft_addr = config.raft_addr;
    let ctx = ClusterContext::new(config, repo)
        .await
        .context("build cluster context")?;

    // raft peers must reach us before the group can form
    let http_shutdown = CancellationToken::new();
    let mut http = tokio::spawn(combainerd::serve(
        raft_addr,
        ApiState::new(ctx.clone()),
        http_shutdown.clone(),
    ));

    if combainerd::start_or_shutdown(ctx.start(), wait_for_shutdown_signal()).await? {
        tokio::select! {
            _ = wait_for_shutdown_signal() => {
                tracing::info!("Shutdown signal received, initiating graceful shutdown...");
            }
            res = &mut http => {
                match res {
                    Ok(Ok(())) => tracing::warn!("HTTP API stopped unexpectedly"),
                    Ok(Err(e)) => tracing::error!(error = %e, "HTTP API failed"),
                    Err(e) => tracing::error!(error = %e, "HTTP API task panicked"),
                }
            }
        }
    } else {
        tracing::info!("Shutdown signal received during startup");
    }

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, ctx.shutdown()).await {
        Ok(Ok(())) => tracing::info!("Cluster context shut down gracefully"),
        Ok(Err(e)) => tracing::error!(error = %e, "Error during shutdown"),
        Err(_) => tracing::warn!(
            "Shutdown timed out after {:?}, forcing exit",
            SHUTDOWN_TIMEOUT
        ),
    }

    http_shutdown.cancel();
    if !http.is_finished() {
        let _ = tokio::time::timeout(Duration::from_secs(5), http).await;
    }

    tracing::info!("Goodbye!");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

fn print_banner(cli: &Cli, config: &ClusterConfig) {
    let seeds = if config.seeds.is_empty() {
        "none".to_string()
    } else {
        config.seeds.join(", ")
    };

    eprintln!(
        r#"
combainer {}

  Node:             {}
  Gossip:           {}
  Raft / HTTP:      {}
  Configs:          {}
  Data Dir:         {}
  Seeds:            {}
  Bootstrap Expect: {}
  Start As Leader:  {}
"#,
        env!("CARGO_PKG_VERSION"),
        config.node_id,
        config.bind_addr,
        config.raft_addr,
        cli.configs.display(),
        config.data_dir.display(),
        seeds,
        config.bootstrap_expect,
        config.start_as_leader,
    );
}

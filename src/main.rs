use anyhow::Result;
use clap::Parser;
use crsync::cli::{Cli, Commands, SyncArgs};
use crsync::image::DockerCli;
use crsync::metrics;
use crsync::sync::{SyncConfig, Syncer};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting crsync");

    let token = CancellationToken::new();
    spawn_signal_listener(token.clone());

    match cli.command {
        Commands::Sync(args) => run_sync(args, token).await,
    }
}

fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        let terminate = async {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(err) => {
                    error!(error = %err, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received, shutting down"),
            _ = terminate => info!("SIGTERM received, shutting down"),
        }

        token.cancel();
    });
}

async fn run_sync(args: SyncArgs, token: CancellationToken) -> Result<()> {
    if args.metrics_port != 0 {
        let port = args.metrics_port;
        tokio::spawn(async move {
            if let Err(err) = metrics::serve(port).await {
                error!(error = format!("{err:#}"), "metrics server failed");
            }
        });
    }

    let image_tool = Arc::new(DockerCli::new());
    let src = args.build_source(image_tool.clone())?;
    let dst = args.build_destination(image_tool.clone())?;

    let config = SyncConfig {
        src_credentials: args.src_credentials(),
        dst_credentials: args.dst_credentials(),
        loop_mode: args.loop_mode,
        sync_interval: Duration::from_secs(args.sync_interval),
    };

    Syncer::new(src, dst, image_tool, config).run(token).await
}

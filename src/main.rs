use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use clap::Parser;
use smol_macros::main;

mod app;
mod client;
mod net;
mod pipeline;
mod shared;
mod source;

use app::{Deps, Supervisor};
use shared::clock::SystemClock;
use shared::config;
use shared::creds::CredentialsStore;

#[derive(Parser)]
#[command(
    name = "scrobble-relay",
    version,
    about = "Fan plays out from many sources to many scrobble clients"
)]
struct Args {
    /// Directory holding config.json, per-type configs, and credentials.
    #[arg(long)]
    config_dir: Option<PathBuf>,
    /// Port the ingress routes should be mounted on.
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    log_level: Option<String>,
}

main! {
    async fn main() {
        let args = Args::parse();

        let log_level = args
            .log_level
            .or_else(|| std::env::var("LOG_LEVEL").ok())
            .unwrap_or_else(|| "info".to_string());
        let level = tracing::Level::from_str(&log_level).unwrap_or(tracing::Level::INFO);
        tracing_subscriber::fmt().with_max_level(level).init();

        tracing::info!("starting scrobble-relay");

        let config_dir = args.config_dir.unwrap_or_else(config::config_dir);
        let config = match config::load(&config_dir) {
            Ok(config) => config,
            Err(err) => {
                tracing::error!("could not load config from {}: {err}", config_dir.display());
                std::process::exit(1);
            }
        };

        let port = args
            .port
            .or_else(|| std::env::var("PORT").ok().and_then(|p| p.parse().ok()))
            .unwrap_or(config.port);
        tracing::info!(
            "{} sources, {} clients configured; ingress contract expects port {port}",
            config.sources.len(),
            config.clients.len()
        );

        let deps = Deps {
            creds: Arc::new(CredentialsStore::new(config_dir)),
            clock: Arc::new(SystemClock),
        };
        let supervisor = match Supervisor::start(config, deps).await {
            Ok(supervisor) => supervisor,
            Err(err) => {
                tracing::error!("startup failed: {err:#}");
                std::process::exit(1);
            }
        };

        // The service runs until the process is told to stop; the HTTP layer
        // that mounts the ingress routes drives `supervisor.ingest`.
        let _supervisor = supervisor;
        futures::future::pending::<()>().await;
    }
}

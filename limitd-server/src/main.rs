//! `limitd-server`: serve a bucket configuration over JSON lines on TCP.

mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use limitd::{spawn_evictor, Buckets, InMemoryKvStore, LimitdConfig, LimitdService};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON bucket configuration.
    #[clap(short, long)]
    config: PathBuf,
    /// Address to listen on.
    #[clap(short, long, default_value = "127.0.0.1:9231")]
    bind: String,
}

fn setup_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_tracing();

    let raw = tokio::fs::read_to_string(&args.config)
        .await
        .with_context(|| format!("reading {}", args.config.display()))?;
    let config = LimitdConfig::from_json_str(&raw)
        .with_context(|| format!("parsing {}", args.config.display()))?;

    let buckets = Arc::new(
        Buckets::new(Arc::new(InMemoryKvStore::new()), &config).context("invalid bucket configuration")?,
    );
    let evictor = spawn_evictor(buckets.clone(), buckets.sweep_interval());
    let service = LimitdService::new(buckets);

    let listener = TcpListener::bind(&args.bind).await.with_context(|| format!("binding {}", args.bind))?;
    info!(target: "limitd::server", addr = %listener.local_addr()?, "listening");

    server::serve(listener, service, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    evictor.shutdown().await;
    Ok(())
}

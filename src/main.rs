use clap::Parser;
use persistor::{config::Config, server};

/// Message-addressable document store persistor
#[derive(Parser, Debug)]
#[command(name = "persistor", version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "PERSISTOR_CONFIG")]
    config: Option<String>,

    /// Listen address (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Bus address to answer on
    #[arg(short, long)]
    address: Option<String>,

    /// Serve from the in-memory store
    #[arg(long)]
    fake: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    // Initialize logging with env filter, e.g.: RUST_LOG=info,persistor=debug
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        .init();

    let args = Args::parse();
    let mut cfg = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(listen) = args.listen {
        cfg.listen_addr = listen;
    }
    if let Some(address) = args.address {
        cfg.address = address;
    }
    if args.fake {
        cfg.fake = true;
    }
    tracing::info!(listen_addr = %cfg.listen_addr, address = %cfg.address, fake = cfg.fake, "starting persistor");

    if let Err(e) = server::run(cfg).await {
        tracing::error!(error = %e, "server terminated with error");
        return Err(e.into());
    }

    Ok(())
}

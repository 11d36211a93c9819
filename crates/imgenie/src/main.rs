// imgenie/crates/imgenie/src/main.rs

#[cfg(feature = "cli")]
use clap::Parser;
#[cfg(feature = "cli")]
use imgenie::{config::Config, run_server};

/// Control plane for local text-to-image and image-to-text models.
#[cfg(feature = "cli")]
#[derive(Debug, Parser)]
#[command(name = "imgenie-server", version, about)]
struct Args {
    /// Model catalog (YAML). Overrides IMGENIE_CONFIG.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Listen address. Overrides API_HOST.
    #[arg(long)]
    host: Option<String>,

    /// Listen port. Overrides API_PORT.
    #[arg(long)]
    port: Option<u16>,

    /// `http` or `simulated`. Overrides BACKEND.
    #[arg(long)]
    backend: Option<String>,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut cfg = Config::from_env()?;

    if let Some(path) = args.config {
        cfg.catalog_path = path;
    }
    if let Some(host) = args.host {
        cfg.api_host = host;
    }
    if let Some(port) = args.port {
        cfg.api_port = port;
    }
    if let Some(backend) = args.backend {
        cfg.backend = backend.parse()?;
    }

    println!("🚀 Starting imgenie control plane");
    run_server(cfg).await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}

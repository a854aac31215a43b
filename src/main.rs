//! NSC Proxy command line tool
//!
//! Bridges a local listener into the mesh until interrupted.

use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;

use nsc_proxy::common::{init_logger, MeshUrl, Result};
use nsc_proxy::config::duration::parse_duration;
use nsc_proxy::config::{log_config, ConfigLoader, ConfigMerger, ConfigOverrides, ProxyConfig};
use nsc_proxy::{new_proxy_client, run_proxy_client, Context, APP_NAME, VERSION};

/// NSC Proxy: local bridge into a Network Service Mesh
#[derive(Parser, Debug)]
#[clap(author, version = VERSION, about, long_about = None)]
struct Args {
    /// Load configuration from a JSON file
    #[clap(short, long)]
    config_file: Option<PathBuf>,

    /// Name of this proxy in connection paths
    #[clap(short, long)]
    name: Option<String>,

    /// Upstream mesh endpoint (tcp://host:port)
    #[clap(long)]
    connect_to: Option<MeshUrl>,

    /// Local listen address (tcp://host:port, port 0 for ephemeral)
    #[clap(short, long)]
    listen_on: Option<MeshUrl>,

    /// Maximum lifetime of issued tokens (e.g. 1h, 10m, 30s)
    #[clap(long, value_parser = parse_lifetime)]
    max_token_lifetime: Option<std::time::Duration>,

    /// Workload certificate (PEM)
    #[clap(long)]
    cert: Option<PathBuf>,

    /// Workload private key (PEM)
    #[clap(long)]
    key: Option<PathBuf>,

    /// Trust bundle (PEM)
    #[clap(long)]
    bundle: Option<PathBuf>,

    /// Log level
    #[clap(long)]
    log_level: Option<String>,
}

fn parse_lifetime(s: &str) -> std::result::Result<std::time::Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

impl From<Args> for ConfigOverrides {
    fn from(args: Args) -> Self {
        ConfigOverrides {
            name: args.name,
            connect_to: args.connect_to,
            listen_on: args.listen_on,
            max_token_lifetime: args.max_token_lifetime,
            cert_path: args.cert,
            key_path: args.key,
            bundle_path: args.bundle,
            log_level: args.log_level,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration: defaults < file < environment < command line
    let config_file = args.config_file.clone();
    let config = ProxyConfig::load(config_file.as_deref())?.merge(args.into());

    // Initialize logger
    init_logger(&config.log_level);
    info!("Starting {} v{}", APP_NAME, VERSION);
    log_config(&config);

    let config = Arc::new(config);
    let ctx = Context::background();

    let (server, mesh) = new_proxy_client(&ctx, Arc::clone(&config)).await?;
    info!("Proxy {} ready on {}, press Ctrl+C to stop", config.name, server.listen_url());

    let mut errors = run_proxy_client(&ctx, &config, server, mesh);

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Cannot listen for Ctrl+C: {}", e);
                }
                info!("Shutting down");
                ctx.cancel();
                break;
            }
            err = errors.recv() => match err {
                Some(err) => error!("{}", err),
                None => break,
            },
        }
    }

    // drain until the proxy has fully stopped
    while let Some(err) = errors.recv().await {
        error!("{}", err);
    }
    if errors.dropped() > 0 {
        warn!("{} error(s) were dropped under backpressure", errors.dropped());
    }

    info!("{} stopped", APP_NAME);
    Ok(())
}

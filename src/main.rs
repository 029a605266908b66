use anyhow::Result;
use callrelay::config::{self, Config};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Twilio Media Streams ↔ OpenAI Realtime call relay.
#[derive(Parser, Debug)]
#[command(name = "callrelay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file (default: $CONFIG_DIR/callrelay/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the webhook and media stream gateway
    Serve {
        /// Bind address (overrides [gateway] host)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides [gateway] port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print the effective configuration with secrets masked
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialise logging: {e}"))?;

    // TLS for the upstream WebSocket.
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("TLS crypto provider already installed");
    }

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            config.require_api_key()?;
            callrelay::gateway::run_gateway(config).await
        }
        Commands::CheckConfig => {
            let source = cli
                .config
                .clone()
                .or_else(config::default_config_path)
                .filter(|p| p.exists())
                .map_or_else(|| "defaults".to_string(), |p| p.display().to_string());
            println!("# source: {source} (+ environment)");
            print!("{}", config.to_redacted_toml()?);
            Ok(())
        }
    }
}

//! Voicelink server entry point

use clap::Parser;

use voicelink::config::Config;

/// Realtime voice conversation server
#[derive(Parser, Debug)]
#[command(name = "voicelink", version)]
struct Args {
    /// Bind host (overrides HOST)
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// WebSocket port (overrides PORT)
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Health/API port (overrides HEALTH_PORT)
    #[arg(long, env = "HEALTH_PORT")]
    health_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env first so EnvFilter and Config both see it
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(health_port) = args.health_port {
        config.server.health_port = health_port;
    }

    voicelink::server::start(config).await
}

//! Voice server demo.
//!
//! Serves the voicelink protocol with canned speech stages:
//!
//!   cargo run -p voicelink-demo-server -- --bind 127.0.0.1:8000
//!
//! Then point `voicelink-demo-client` at it.

mod mock;

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use voicelink_core::ServerConfig;
use voicelink_server::{Collaborators, Server};

#[derive(Parser, Debug)]
#[command(
    name = "voice-server",
    about = "voicelink demo server with mock speech stages",
    long_about = None
)]
struct Args {
    /// TOML file with `bind`, `name` and a `[websocket]` table.
    #[arg(short, long, value_name = "FILE", env = "VOICELINK_SERVER_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Name sent in the greeting.
    #[arg(long)]
    name: Option<String>,

    /// Run voice turns through the (always accepting) speaker check.
    #[arg(long)]
    verify_speaker: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("voicelink_demo_server=info".parse()?)
                .add_directive("voicelink_server=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(name) = args.name {
        config.name = name;
    }

    let mut collaborators = Collaborators::new(mock::CannedReplies)
        .with_recognizer(mock::CannedTranscripts)
        .with_synthesizer(mock::MarkerAudio);
    if args.verify_speaker {
        collaborators = collaborators.with_verifier(mock::AcceptAll);
    }

    tracing::info!("Starting {} on {}", config.name, config.bind);
    let server = Server::bind(config, collaborators).await?;
    server
        .serve_with_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    tracing::info!("Stopped");
    Ok(())
}

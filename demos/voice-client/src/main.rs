//! Voice client demo.
//!
//! Connects with failover and sends prompts, one per argument or one per
//! line of stdin:
//!
//!   cargo run -p voicelink-demo-client -- --url ws://127.0.0.1:8000 "你好小千"
//!   cargo run -p voicelink-demo-client -- --config client.toml --audio hello.wav

use clap::Parser;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use voicelink_client::{ClientEvent, ConnectionManager};
use voicelink_core::{ClientConfig, Endpoint, Turn};

#[derive(Parser, Debug)]
#[command(name = "voice-client", about = "voicelink demo client", long_about = None)]
struct Args {
    /// TOML file with `[[servers]]`, `[retry]`, `[request]`, ... tables.
    #[arg(short, long, value_name = "FILE", env = "VOICELINK_CLIENT_CONFIG")]
    config: Option<PathBuf>,

    /// Server URLs in priority order; replace the configured list.
    #[arg(long = "url", value_name = "URL")]
    urls: Vec<String>,

    /// Send this file as a voice turn instead of text prompts.
    #[arg(long, value_name = "FILE")]
    audio: Option<PathBuf>,

    /// Write a JSON connection status snapshot here before exiting.
    #[arg(long, value_name = "FILE")]
    status: Option<PathBuf>,

    /// Prompts to send. Read from stdin when none are given.
    prompts: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("voicelink_demo_client=info".parse()?)
                .add_directive("voicelink_client=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    if !args.urls.is_empty() {
        config.servers = args
            .urls
            .iter()
            .enumerate()
            .map(|(i, url)| {
                Endpoint::new(url.clone(), format!("server-{}", i + 1), i as u32 + 1)
            })
            .collect();
    }

    let manager = ConnectionManager::new(config);
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ClientEvent::Status { message, .. } => tracing::info!("Server: {}", message),
                ClientEvent::Failed => tracing::error!("Gave up reconnecting"),
                other => tracing::debug!("{:?}", other),
            }
        }
    });

    if !manager.connect().await {
        anyhow::bail!("could not reach any server");
    }

    if let Some(path) = &args.audio {
        let audio = tokio::fs::read(path).await?;
        let reply = manager.voice_turn(audio).await?;
        println!("heard: {}", reply.asr_result);
        println!("reply: {}", reply.llm_response);
        if let Some(audio) = reply.audio_response {
            println!("audio: {} bytes", audio.as_bytes().len());
        }
    } else if args.prompts.is_empty() {
        let mut history = Vec::new();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let prompt = line.trim();
            if prompt.is_empty() {
                continue;
            }
            ask(&manager, prompt, &mut history).await;
        }
    } else {
        let mut history = Vec::new();
        for prompt in &args.prompts {
            ask(&manager, prompt, &mut history).await;
        }
    }

    let stats = manager.stats();
    if let Some(path) = &args.status {
        tokio::fs::write(path, manager.status().to_json()?).await?;
        tracing::info!("Status written to {}", path.display());
    }
    manager.disconnect().await;
    println!(
        "requests: {} sent, {} ok, {} failed; connects: {} of {} attempts",
        stats.requests_sent,
        stats.requests_succeeded,
        stats.requests_failed,
        stats.successes,
        stats.attempts
    );
    Ok(())
}

/// Send one prompt, keeping the conversation going on success.
async fn ask(manager: &ConnectionManager, prompt: &str, history: &mut Vec<Turn>) {
    match manager.infer(prompt, history.clone()).await {
        Ok(answer) => {
            println!("> {prompt}\n{answer}");
            history.push(Turn {
                role: "user".into(),
                content: prompt.to_string(),
            });
            history.push(Turn {
                role: "assistant".into(),
                content: answer,
            });
        }
        Err(e) => eprintln!("> {prompt}\nerror: {e}"),
    }
}

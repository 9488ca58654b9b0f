//! Orbit - console front-end
//!
//! Runs a voice session against the Gemini Live API using the default
//! PulseAudio devices. Type `s` to start, `x` to stop and `q` to quit.

use anyhow::Context;
use clap::Parser;
use orbit::audio::PulseBackend;
use orbit::config::{self, AssistantConfig};
use orbit::credentials::{CredentialChain, KeyStore};
use orbit::events::{EventStream, SessionEvent};
use orbit::gemini_client::GeminiConnector;
use orbit::session::{self, Session};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "orbit", version, about = "Voice assistant for the Gemini Live API")]
struct Cli {
    /// Settings file (JSON)
    #[arg(long, env = "ORBIT_SETTINGS")]
    settings: Option<PathBuf>,

    /// Model name, overrides the settings file
    #[arg(long)]
    model: Option<String>,

    /// Prebuilt voice name; an empty string lets the service choose
    #[arg(long)]
    voice: Option<String>,

    /// Do not offer web search to the model
    #[arg(long)]
    no_search: bool,

    /// Record each session as WAV files under this directory
    #[arg(long, value_name = "DIR")]
    record: Option<PathBuf>,

    /// PulseAudio source to capture from
    #[arg(long, value_name = "SOURCE")]
    input_device: Option<String>,

    /// Store an API key in the local key store and exit
    #[arg(long, value_name = "KEY")]
    set_api_key: Option<String>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "orbit=info",
        1 => "orbit=debug",
        _ => "orbit=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<AssistantConfig> {
    let mut config = match cli.settings.clone().or_else(config::default_settings_path) {
        Some(path) => AssistantConfig::load(&path)?,
        None => {
            warn!("No configuration directory, using default settings");
            AssistantConfig::default()
        }
    };

    if let Some(model) = &cli.model {
        config.model_name = model.clone();
    }
    if let Some(voice) = &cli.voice {
        config.voice_name = voice.clone();
    }
    if cli.no_search {
        config.enable_google_search = false;
    }
    if let Some(dir) = &cli.record {
        config.record_dir = Some(dir.clone());
    }
    if let Some(device) = &cli.input_device {
        config.input_device = Some(device.clone());
    }
    Ok(config)
}

async fn print_events(mut events: EventStream) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::StateChanged(state) => println!("[{:?}]", state),
            SessionEvent::TranscriptFinalized(entry) => {
                println!("{:>4}: {}", entry.speaker, entry.text)
            }
            SessionEvent::ToolCall(update) => println!("🛠️  {}", update.to_json()),
            SessionEvent::Error(message) => eprintln!("Error: {}", message),
            SessionEvent::Transcription(_) | SessionEvent::InProgress(_) => {}
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(key) = &cli.set_api_key {
        let store = KeyStore::default_location().context("no configuration directory available")?;
        store.save(key)?;
        println!("API key saved to {}", store.path().display());
        return Ok(());
    }

    let config = load_config(&cli)?;
    info!("Starting orbit with model {}", config.model_name);

    let session = Session::new(
        config,
        CredentialChain::standard(),
        Arc::new(GeminiConnector::new()),
        Arc::new(PulseBackend::new("orbit")),
    );
    let (handle, driver) = session::spawn(session);

    println!("Commands: s = start, x = stop, q = quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "s" => {
                        tokio::spawn(print_events(handle.start()));
                    }
                    "x" => handle.stop(),
                    "q" => break,
                    "" => {}
                    other => println!("Unknown command: {}", other),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    handle.shutdown();
    driver.await?;
    info!("orbit stopped");
    Ok(())
}

use std::io::Write;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::mpsc;

use voxflow_core::config::{Config, expand_path};
use voxflow_core::types::StreamItem;
use voxflow_providers::{ChatHistory, ChatMessage, CompletionClient};
use voxflow_speech::StreamSession;
use voxflow_speech::playback::Player;

mod logging;

#[derive(Parser)]
#[command(
    name = "voxflow",
    about = "Low-latency streaming text-to-speech with reconnect resync",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Speak text (reads stdin when TEXT is omitted)
    Speak { text: Option<String> },

    /// Chat with a language model and hear the replies as they stream
    Chat,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Diagnose common issues
    Doctor,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Write the default configuration unless a file already exists
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)?;

    logging::init(&config.logging(), cli.verbose);
    tracing::debug!(path = %config_path.display(), "Loaded config");

    match cli.command {
        Commands::Speak { text } => speak(&config, text).await?,
        Commands::Chat => chat(&config).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Init => {
                if config_path.exists() {
                    anyhow::bail!("{} already exists", config_path.display());
                }
                if let Some(parent) = config_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Config::default().save(&config_path)?;
                println!("Wrote {}", config_path.display());
            }
        },
        Commands::Doctor => doctor(&config, &config_path)?,
    }

    Ok(())
}

async fn speak(config: &Config, text: Option<String>) -> anyhow::Result<()> {
    let text = match text {
        Some(text) => text,
        None => {
            let mut input = String::new();
            tokio::io::stdin().read_to_string(&mut input).await?;
            input
        }
    };
    if text.trim().is_empty() {
        anyhow::bail!("nothing to speak");
    }

    let player = Arc::new(Player::new(&config.playback())?);
    let session = StreamSession::new(config, player)?;

    let (tx, rx) = mpsc::unbounded_channel();
    for line in text.split_inclusive('\n') {
        tx.send(StreamItem::Item(line.to_string()))?;
    }
    tx.send(StreamItem::End)?;

    let report = session.speak(rx).await?;
    tracing::info!(
        id = %report.utterance_id,
        attempts = report.attempts,
        chunks = report.audio_chunks,
        bytes = report.audio_bytes,
        "Spoke utterance"
    );
    Ok(())
}

async fn chat(config: &Config) -> anyhow::Result<()> {
    let completion = config.completion();
    let client = CompletionClient::new(&completion);
    let player = Arc::new(Player::new(&config.playback())?);
    let session = StreamSession::new(config, player)?;
    let mut history = ChatHistory::new(completion.max_history);

    println!("voxflow chat ({}). Type 'exit' to quit.", client.model());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" {
            break;
        }

        history.push(ChatMessage::user(line));

        let (tx, rx) = mpsc::unbounded_channel();
        let print_delta = |delta: &str| {
            print!("{delta}");
            let _ = std::io::stdout().flush();
        };
        let (reply, spoken) = tokio::join!(
            client.stream_to_session(history.messages(), tx, print_delta),
            session.speak(rx),
        );
        println!();

        match reply {
            Ok(message) => history.push(message),
            Err(e) => tracing::error!(error = %e, "Completion failed"),
        }
        if let Err(e) = spoken {
            tracing::error!(error = %e, "Speech failed");
        }
    }

    Ok(())
}

fn doctor(config: &Config, config_path: &std::path::Path) -> anyhow::Result<()> {
    println!("voxflow v{}", env!("CARGO_PKG_VERSION"));

    if config_path.exists() {
        println!("[ok]   config file: {}", config_path.display());
    } else {
        println!("[info] config file: {} (not found, using defaults)", config_path.display());
    }

    let playback = config.playback();
    match Player::new(&playback) {
        Ok(player) => println!("[ok]   playback: {}", player.program().display()),
        Err(e) => println!("[fail] playback: {e}"),
    }

    let tts = config.tts();
    println!("[info] TTS voice {} with model {}", tts.voice_id, tts.model_id);
    if tts.resolve_api_key().is_some() {
        println!("[ok]   TTS API key");
    }

    let completion = config.completion();
    println!("[info] completion model {}", completion.model);
    if completion.resolve_api_key().is_some() {
        println!("[ok]   completion API key");
    }

    let (warnings, errors) = config.validate();
    for warning in &warnings {
        println!("[warn] {warning}");
    }
    for error in &errors {
        println!("[fail] {error}");
    }

    if !errors.is_empty() {
        anyhow::bail!("{} config error(s)", errors.len());
    }
    Ok(())
}

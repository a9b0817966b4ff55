use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use waav_live::{
    ClientConfig, Conversation, ConversationEvent, LiveSession, Modality, SessionEvent,
    TranscriptionSource,
};

/// WaaV Live - real-time multimodal sessions from the terminal
#[derive(Parser, Debug)]
#[command(name = "waav-live")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the model id
    #[arg(short = 'm', long = "model")]
    model: Option<String>,

    /// Resume a previous session by handle
    #[arg(long = "resume", value_name = "HANDLE")]
    resume: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Text chat: one turn per stdin line, replies printed as they stream
    Chat,

    /// Voice session through the default microphone and speakers
    Talk,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ClientConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ClientConfig::from_env()?,
    };
    if let Some(model) = cli.model {
        config.session.model = model;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Initialize crypto provider for TLS connections
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    match cli.command {
        Commands::Chat => {
            config.session.generation.response_modalities = vec![Modality::Text];
            config.validate()?;
            let mut session = LiveSession::new(config.session)?;
            if let Some(handle) = cli.resume {
                session.resume_with(handle);
            }
            run_chat(Conversation::new(session)).await
        }
        Commands::Talk => {
            config.validate()?;
            run_talk(config, cli.resume).await
        }
    }
}

enum Input {
    Line(String),
    Eof,
    Interrupt,
    Event(Option<ConversationEvent>),
}

async fn run_chat(mut conversation: Conversation) -> anyhow::Result<()> {
    let (line_tx, mut line_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    conversation.connect().await?;
    info!("Connected, waiting for setup");

    loop {
        let input = tokio::select! {
            line = line_rx.recv() => match line {
                Some(line) => Input::Line(line),
                None => Input::Eof,
            },
            _ = tokio::signal::ctrl_c() => Input::Interrupt,
            event = conversation.next_event() => Input::Event(event),
        };

        match input {
            Input::Line(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    break;
                }
                if let Err(e) = conversation.session().send_text(line, true) {
                    eprintln!("[not sent: {}]", e);
                }
            }
            Input::Eof | Input::Interrupt => break,
            Input::Event(None) => break,
            Input::Event(Some(event)) => {
                if !print_event(&event) {
                    break;
                }
            }
        }
    }

    conversation.disconnect().await;
    report_resumption(&conversation);
    Ok(())
}

/// Print one event. Returns false once the session has closed.
fn print_event(event: &ConversationEvent) -> bool {
    let mut stdout = std::io::stdout();
    match event {
        ConversationEvent::Session(SessionEvent::SetupComplete) => {
            eprintln!("[ready]");
        }
        ConversationEvent::Session(SessionEvent::Content(parts)) => {
            for text in parts.iter().filter_map(|p| p.as_text()) {
                let _ = write!(stdout, "{}", text);
            }
            let _ = stdout.flush();
        }
        ConversationEvent::Session(SessionEvent::Transcription { source, text }) => {
            let who = match source {
                TranscriptionSource::Input => "you",
                TranscriptionSource::Output => "model",
            };
            eprintln!("[{}] {}", who, text);
        }
        ConversationEvent::Session(SessionEvent::Interrupted) => eprintln!("[interrupted]"),
        ConversationEvent::Session(SessionEvent::ToolCall(calls)) => {
            for call in calls {
                eprintln!("[tool call] {}({})", call.name, call.args);
            }
        }
        ConversationEvent::Session(SessionEvent::GoAway { time_left }) => {
            eprintln!(
                "[server closing soon: {}]",
                time_left.as_deref().unwrap_or("unknown")
            );
        }
        ConversationEvent::Session(SessionEvent::Error(message)) => {
            eprintln!("[error] {}", message);
        }
        ConversationEvent::Session(SessionEvent::Close(reason)) => {
            eprintln!("[closed: {}]", reason);
            return false;
        }
        ConversationEvent::TurnComplete(_) => {
            let _ = writeln!(stdout);
        }
        ConversationEvent::VoiceStart { .. } => eprintln!("[listening]"),
        ConversationEvent::SilenceDetected { .. } => eprintln!("[end of speech]"),
        _ => {}
    }
    true
}

fn report_resumption(conversation: &Conversation) {
    if let Some(handle) = conversation.session().session_resumption_handle() {
        eprintln!("Resume with: waav-live --resume {}", handle);
    }
}

#[cfg(feature = "device-cpal")]
async fn run_talk(config: ClientConfig, resume: Option<String>) -> anyhow::Result<()> {
    use waav_live::core::capture::CpalInputDevice;
    use waav_live::core::playback::CpalSink;
    use waav_live::{AudioCapture, PlaybackHandle};

    let sink = CpalSink::open(config.playback.sample_rate)?;
    let (playback, playback_events) = PlaybackHandle::spawn(sink, config.playback.clone())?;
    let (capture, capture_events) = AudioCapture::new(config.capture.clone(), CpalInputDevice::new())?;

    let mut session = LiveSession::new(config.session)?;
    if let Some(handle) = resume {
        session.resume_with(handle);
    }
    let mut conversation = Conversation::new(session)
        .with_playback(playback.clone(), playback_events)
        .with_capture(capture, capture_events);

    conversation.connect().await?;
    eprintln!("[speak; Ctrl-C to quit]");

    loop {
        let input = tokio::select! {
            _ = tokio::signal::ctrl_c() => Input::Interrupt,
            event = conversation.next_event() => Input::Event(event),
        };
        match input {
            Input::Event(Some(event)) => {
                if !print_event(&event) {
                    break;
                }
            }
            _ => break,
        }
    }

    let captured = conversation.disconnect().await;
    info!("Captured {} bytes of microphone audio", captured.len());
    let _ = playback.shutdown();
    report_resumption(&conversation);
    Ok(())
}

#[cfg(not(feature = "device-cpal"))]
async fn run_talk(_config: ClientConfig, _resume: Option<String>) -> anyhow::Result<()> {
    Err(anyhow!(
        "voice sessions need audio devices; rebuild with --features device-cpal"
    ))
}

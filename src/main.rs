use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voxchat::audio::{
    AudioSink, CommandSynthesizer, ErrorCallback, PlaybackHandle, PlaybackWorker, SpeechSynthesizer,
};
use voxchat::chat::HttpChatClient;
use voxchat::integration::{AppConfig, ChatSession, SettingsStore};
use voxchat::speech::{socket_origin, Speaker, TtsClient, VoiceSocket};
use voxchat::storage::{ChatHistory, ExportFormat, FileStore, KeyValueStore};
use voxchat::ui::{format_model_list, Repl};
use voxchat::VoxError;

#[derive(Parser)]
#[command(name = "voxchat")]
#[command(about = "Voice-enabled chat with a local model server", version)]
struct Cli {
    /// Config file (default: config_dir/voxchat/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// API base URL, overriding config and settings
    #[arg(long, global = true, env = "VOXCHAT_API_URL")]
    api_url: Option<String>,

    /// Do not open an audio device
    #[arg(long, global = true)]
    no_audio: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat (default)
    Chat,
    /// List the models the backend offers
    Models,
    /// List the voices the TTS backend offers
    Voices {
        /// Only voices of this locale, e.g. en-GB
        #[arg(short, long)]
        locale: Option<String>,
    },
    /// Speak text and wait until it has been played
    Say {
        text: Vec<String>,
    },
    /// Print a stored conversation
    Export {
        /// Conversation id
        id: String,
        #[arg(short, long, value_enum, default_value = "md")]
        format: Format,
    },
    /// Show or reset the stored settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Md,
}

impl From<Format> for ExportFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Json => ExportFormat::Json,
            Format::Md => ExportFormat::Markdown,
        }
    }
}

#[derive(Subcommand)]
enum SettingsAction {
    Show,
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voxchat=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).context("loading config")?;
    if let Some(url) = cli.api_url {
        config = config.with_api_url(url);
    }
    if cli.no_audio {
        config = config.without_audio_output();
    }
    config.validate()?;

    let data_dir = match &config.data_dir {
        Some(dir) => dir.clone(),
        None => FileStore::default_dir()?,
    };
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&data_dir)?);
    let settings = SettingsStore::load(Arc::clone(&store))?;
    let history = ChatHistory::new(store);
    info!("Data in {}", data_dir.display());

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Chat => chat(&config, settings, history).await,
        Commands::Models => {
            let client = chat_client(&config, &settings)?;
            let session = ChatSession::new(settings, history, Arc::new(client))?;
            let models = session.refresh_models().await?;
            println!("{}", format_model_list(&models, &session.settings().snapshot().model));
            Ok(())
        }
        Commands::Voices { locale } => {
            let client = TtsClient::new(api_url(&config, &settings), settings.snapshot().request_timeout())?;
            let current = settings.snapshot().tts.voice.clone();
            for voice in client.voices(locale.as_deref()).await? {
                let marker = if voice.short_name == current { '*' } else { ' ' };
                let gender = voice.gender.as_deref().unwrap_or("-");
                println!("{} {:<28} {:<8} {}", marker, voice.short_name, voice.locale, gender);
            }
            Ok(())
        }
        Commands::Say { text } => say(&config, &settings, &text.join(" ")).await,
        Commands::Export { id, format } => {
            println!("{}", history.export(&id, format.into())?);
            Ok(())
        }
        Commands::Settings { action } => {
            let current = match action {
                SettingsAction::Show => settings.snapshot(),
                SettingsAction::Reset => settings.reset()?,
            };
            println!("{}", serde_json::to_string_pretty(current.as_ref())?);
            Ok(())
        }
    }
}

fn api_url(config: &AppConfig, settings: &SettingsStore) -> String {
    config
        .api_url
        .clone()
        .unwrap_or_else(|| settings.snapshot().api_endpoint.clone())
}

fn chat_client(config: &AppConfig, settings: &SettingsStore) -> Result<HttpChatClient> {
    let chat_config = settings
        .snapshot()
        .chat_config()
        .with_base_url(api_url(config, settings));
    Ok(HttpChatClient::new(chat_config)?)
}

#[cfg(feature = "audio-io")]
fn open_sink(enabled: bool) -> voxchat::Result<Box<dyn AudioSink>> {
    if !enabled {
        return Err(VoxError::AudioDeviceError("audio output disabled".into()));
    }
    Ok(Box::new(voxchat::audio::RodioSink::try_default()?))
}

#[cfg(not(feature = "audio-io"))]
fn open_sink(_enabled: bool) -> voxchat::Result<Box<dyn AudioSink>> {
    Err(VoxError::AudioDeviceError("built without audio output".into()))
}

/// Playback worker plus the speaker in front of it
fn speaker(config: &AppConfig, settings: &SettingsStore) -> Result<(Speaker, PlaybackHandle)> {
    let fallback: Option<Box<dyn SpeechSynthesizer>> = if config.enable_speech_fallback {
        CommandSynthesizer::detect().map(|s| Box::new(s) as Box<dyn SpeechSynthesizer>)
    } else {
        None
    };
    let fallback_available = fallback.is_some();

    let on_error: ErrorCallback = Arc::new(|e: &VoxError| println!("  ! {}", e.user_message()));
    let enabled = config.enable_audio_output;
    let playback = PlaybackWorker::spawn(move || open_sink(enabled), fallback, Some(Arc::clone(&on_error)))?;

    let snapshot = settings.snapshot();
    let url = api_url(config, settings);
    let client = TtsClient::new(url.clone(), snapshot.request_timeout())?;
    let mut speaker = Speaker::new(client, playback.clone(), snapshot.tts.clone())
        .with_fallback_available(fallback_available);

    if config.use_voice_socket {
        let socket = VoiceSocket::connect(&socket_origin(&url), playback.clone(), Some(on_error));
        info!("Voice socket {}", socket.url());
        speaker = speaker.with_socket(socket);
    }
    Ok((speaker, playback))
}

async fn chat(config: &AppConfig, settings: SettingsStore, history: ChatHistory) -> Result<()> {
    let client = chat_client(config, &settings)?;
    if let Err(e) = client.health().await {
        warn!("Backend health check failed: {}", e);
    }

    let (speaker, playback) = speaker(config, &settings)?;
    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    let session = ChatSession::new(settings, history, Arc::new(client))?
        .with_events(events_tx)
        .with_speaker(speaker);

    let session = Arc::new(session);
    if let Err(e) = session.refresh_models().await {
        warn!("Could not list models: {}", e);
    }

    let result = Repl::new(session, events_rx).run().await;
    if let Err(e) = playback.shutdown() {
        warn!("{}", e);
    }
    Ok(result?)
}

/// Time allowed for queued audio to start before `say` gives up waiting
const START_GRACE: Duration = Duration::from_secs(2);

async fn say(config: &AppConfig, settings: &SettingsStore, text: &str) -> Result<()> {
    let (speaker, playback) = speaker(config, settings)?;
    speaker.speak(text).await?;

    let started = Instant::now();
    let mut seen_busy = false;
    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = playback.status();
        let busy = status.playing || status.queued > 0;
        seen_busy |= busy;
        if (seen_busy && !busy) || (!seen_busy && started.elapsed() > START_GRACE) {
            break;
        }
    }

    playback.shutdown()?;
    Ok(())
}

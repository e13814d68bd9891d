use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chatrelay_agents::{LlmProvider, OpenAiProvider};
use chatrelay_channels::{
    ChannelLifecycle, TelegramChannel, TelegramTransport, Transport, event_callback,
};
use chatrelay_config::{AppConfig, ConfigLoader, ConfigOverrides, LogConfig};
use chatrelay_db::{ConversationStore, SqliteStore, StoreOptions};
use chatrelay_gateway::{
    ConcurrencyCoordinator, PipelineParts, PipelineSettings, RelayHandler, RequestPipeline,
};
use chatrelay_media::FfmpegConverter;
use chatrelay_security::{Cryptor, RedactingWriter};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chatrelay", version, about = "Relay Telegram chats to a hosted chat-completion model")]
struct Cli {
    /// Path to a YAML or TOML configuration file
    #[arg(short, long, env = "CHATRELAY_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// OpenAI API token (overrides OPENAI_TOKEN)
    #[arg(long, global = true)]
    openai_token: Option<String>,

    /// Telegram bot token (overrides TELEGRAM_BOT_TOKEN)
    #[arg(long, global = true)]
    telegram_bot_token: Option<String>,

    /// Directory holding the conversation database
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Secret mixed into every transcript key (overrides ENCRYPTION_PASSWORD)
    #[arg(long, global = true)]
    encryption_password: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the relay until interrupted (default)
    Run,
    /// Check that the completion service accepts the configured token
    Check,
    /// Create or upgrade the database schema and exit
    Migrate,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            openai_token: self.openai_token.clone(),
            telegram_bot_token: self.telegram_bot_token.clone(),
            data_dir: self.data_dir.clone(),
            encryption_password: self.encryption_password.clone(),
        }
    }

    fn load_config(&self) -> anyhow::Result<AppConfig> {
        ConfigLoader::new()
            .with_file(self.config.clone())
            .with_overrides(self.overrides())
            .load()
            .context("failed to load configuration")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = cli.load_config()?;
    init_tracing(&config.log);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Check => check(&config).await,
        Command::Migrate => migrate(&config).await,
    }
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(RedactingWriter::stderr());
    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_store(config: &AppConfig) -> anyhow::Result<Arc<SqliteStore>> {
    let options = StoreOptions {
        default_invite_code: config.security.default_invite_code.clone(),
    };
    let store = SqliteStore::open(&config.storage.db_path(), options)
        .context("failed to open conversation store")?;
    Ok(Arc::new(store))
}

fn provider(config: &AppConfig) -> Arc<OpenAiProvider> {
    Arc::new(
        OpenAiProvider::new(config.openai.api_key.clone(), config.openai.base_url.clone())
            .with_transcription_model(config.openai.transcription_model.clone()),
    )
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    let cryptor = Arc::new(
        Cryptor::new(
            config.security.encryption_password.clone(),
            config.security.kdf_iterations,
        )
        .context("failed to set up encryption")?,
    );
    let provider = provider(&config);
    let converter = Arc::new(FfmpegConverter::new(
        config.media.ffmpeg_path.clone(),
        config.media.timeout(),
    ));

    let telegram = TelegramTransport::from_token(&config.telegram.bot_token);
    let bot = telegram.bot();
    let transport: Arc<dyn Transport> = Arc::new(telegram);

    let coordinator = Arc::new(ConcurrencyCoordinator::new());
    let pipeline = RequestPipeline::new(
        PipelineParts {
            store: store.clone(),
            cryptor,
            provider: provider.clone(),
            transcriber: provider,
            converter,
            transport: Arc::clone(&transport),
        },
        config.storage.dialog_retention(),
        PipelineSettings::from_config(&config),
    );
    let handler = Arc::new(RelayHandler::new(
        Arc::clone(&coordinator),
        store.clone(),
        transport,
        pipeline,
        &config.conversation.models,
    ));

    let on_event = event_callback(move |event| {
        let handler = Arc::clone(&handler);
        async move { handler.handle(event).await }
    });
    let mut channel = TelegramChannel::new(bot, on_event);
    channel
        .connect()
        .await
        .context("failed to connect to Telegram")?;
    info!(
        "chatrelay started (model={}, streaming={}, db={})",
        config.openai.default_model,
        config.conversation.streaming,
        config.storage.db_path().display()
    );

    shutdown_signal().await;

    coordinator.begin_drain();
    match config.shutdown_timeout() {
        Some(limit) => {
            if tokio::time::timeout(limit, coordinator.await_drain_complete())
                .await
                .is_err()
            {
                warn!(
                    "{} turns still running after {limit:?}, shutting down anyway",
                    coordinator.in_flight()
                );
            }
        }
        None => coordinator.await_drain_complete().await,
    }

    if let Err(e) = channel.disconnect().await {
        error!("failed to disconnect from Telegram: {e}");
    }
    store.close().await.context("failed to close store")?;
    info!("chatrelay stopped");
    Ok(())
}

async fn check(config: &AppConfig) -> anyhow::Result<()> {
    let provider = provider(config);
    if provider.health_check().await? {
        info!("completion service is reachable");
        Ok(())
    } else {
        anyhow::bail!("completion service rejected the request or is unreachable")
    }
}

async fn migrate(config: &AppConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    store.close().await?;
    info!("database at {} is up to date", config.storage.db_path().display());
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received Ctrl+C, shutting down"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("received Ctrl+C, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received Ctrl+C, shutting down");
    }
}

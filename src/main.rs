//! Hearthbot CLI entry point.

use anyhow::Context as _;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hearthbot")]
#[command(about = "A Discord community bot backed by local generation endpoints")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Arc::new(
        hearthbot::config::Config::load().context("failed to load configuration")?,
    );
    tracing::info!(data_dir = %config.data_dir.display(), "configuration loaded");

    // Disk stores.
    let guilds = Arc::new(hearthbot::store::GuildStore::load(config.guilds_path()));
    let profiles = Arc::new(hearthbot::store::ProfileStore::load(config.profiles_path()));
    let transcript = Arc::new(hearthbot::store::TranscriptLog::new(
        config.transcript_path(),
        config.transcript_max_bytes,
    ));

    // In-memory context, seeded from the persisted transcript.
    let contexts = Arc::new(hearthbot::context::ContextStore::new(config.max_context_turns));
    let histories = transcript.load_histories();
    tracing::info!(channels = histories.len(), "chat history loaded");
    contexts.seed(histories).await;

    // Generation and image services.
    let dispatcher = Arc::new(hearthbot::llm::Dispatcher::new(
        hearthbot::llm::ChatClient::new(&config.chat),
        hearthbot::llm::WorkerPool::new(config.generation_workers),
        Arc::clone(&contexts),
        Arc::clone(&guilds),
    ));
    let images = Arc::new(hearthbot::comfy::ImageClient::new(
        config.comfy.http_base(),
        config.comfy.ws_base(),
    ));

    let services = hearthbot::Services {
        moderation: Arc::new(hearthbot::moderation::WordFilter::new(
            config.banned_words.clone(),
        )),
        activity: Arc::new(hearthbot::watchdog::ActivityTracker::new()),
        dialogs: Arc::new(hearthbot::setup::DialogRouter::new()),
        emojis: Arc::new(hearthbot::discord::EmojiCache::new()),
        config,
        contexts,
        guilds,
        profiles,
        transcript,
        dispatcher,
        images,
    };

    tokio::select! {
        result = hearthbot::discord::run(services) => {
            result.context("discord client stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    tracing::info!("hearthbot stopped");
    Ok(())
}

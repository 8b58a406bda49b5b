//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;

/// Default safe-mode persona used when a guild has no configuration.
pub const DEFAULT_PERSONA: &str =
    "Your name is Hearth. Always answer with short, direct answers. State that you are running in safe mode.";

/// Hearthbot configuration, resolved from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory for the JSON/text stores.
    pub data_dir: std::path::PathBuf,

    /// Discord bot token.
    pub discord_token: String,

    /// Chat-completion endpoint settings.
    pub chat: ChatConfig,

    /// ComfyUI image-generation settings.
    pub comfy: ComfyConfig,

    /// Transcript log byte ceiling before the half-trim kicks in.
    pub transcript_max_bytes: u64,

    /// Minutes of channel silence before the watchdog nudges.
    pub inactivity_threshold_mins: i64,

    /// Number of concurrent generation workers. Overflow queues.
    pub generation_workers: usize,

    /// Optional cap on in-memory turns per channel. `None` means unbounded;
    /// the on-disk transcript trim is independent either way.
    pub max_context_turns: Option<usize>,

    /// Lowercased banned words. Empty disables moderation.
    pub banned_words: Vec<String>,
}

/// Chat-completion endpoint configuration.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Full URL of the OpenAI-compatible completions endpoint.
    pub endpoint: String,

    /// Model name sent with every request.
    pub model: String,

    /// Fixed sampling temperature.
    pub temperature: f32,
}

/// ComfyUI server configuration.
#[derive(Debug, Clone)]
pub struct ComfyConfig {
    pub host: String,
    pub port: u16,
}

impl ComfyConfig {
    pub fn http_base(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn ws_base(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let discord_token = std::env::var("DISCORD_BOT_TOKEN")
            .map_err(|_| ConfigError::MissingKey("DISCORD_BOT_TOKEN".into()))?;

        let data_dir = match std::env::var("HEARTHBOT_DATA_DIR") {
            Ok(dir) => std::path::PathBuf::from(dir),
            Err(_) => dirs::data_dir()
                .map(|d| d.join("hearthbot"))
                .unwrap_or_else(|| std::path::PathBuf::from("./data")),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))
            .map_err(ConfigError::Other)?;

        let chat = ChatConfig {
            endpoint: std::env::var("HEARTHBOT_CHAT_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:1234/v1/chat/completions".into()),
            model: std::env::var("HEARTHBOT_CHAT_MODEL")
                .unwrap_or_else(|_| "local-model".into()),
            temperature: env_parsed("HEARTHBOT_CHAT_TEMPERATURE", 0.9)?,
        };

        let comfy = ComfyConfig {
            host: std::env::var("COMFYUI_SERVER_ADDRESS").unwrap_or_else(|_| "127.0.0.1".into()),
            port: env_parsed("COMFYUI_SERVER_PORT", 8188)?,
        };

        let max_context_turns = match std::env::var("HEARTHBOT_MAX_CONTEXT_TURNS") {
            Ok(raw) => Some(raw.parse::<usize>().map_err(|_| {
                ConfigError::Invalid(format!("HEARTHBOT_MAX_CONTEXT_TURNS: '{raw}' is not a number"))
            })?),
            Err(_) => None,
        };

        let banned_words = std::env::var("HEARTHBOT_BANNED_WORDS")
            .map(|raw| {
                raw.split(',')
                    .map(|w| w.trim().to_lowercase())
                    .filter(|w| !w.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            data_dir,
            discord_token,
            chat,
            comfy,
            transcript_max_bytes: env_parsed("HEARTHBOT_TRANSCRIPT_MAX_BYTES", 10 * 1024 * 1024)?,
            inactivity_threshold_mins: env_parsed("HEARTHBOT_INACTIVITY_MINS", 260)?,
            generation_workers: env_parsed("HEARTHBOT_GENERATION_WORKERS", 5)?,
            max_context_turns,
            banned_words,
        })
    }

    /// Path of the guild configuration map.
    pub fn guilds_path(&self) -> std::path::PathBuf {
        self.data_dir.join("guilds.json")
    }

    /// Path of the rolling chat transcript.
    pub fn transcript_path(&self) -> std::path::PathBuf {
        self.data_dir.join("transcript.log")
    }

    /// Path of the user profile map.
    pub fn profiles_path(&self) -> std::path::PathBuf {
        self.data_dir.join("profiles.json")
    }

    /// Path of the "what's new" notes file.
    pub fn whatsnew_path(&self) -> std::path::PathBuf {
        self.data_dir.join("whatsnew.txt")
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid(format!("{key}: cannot parse '{raw}'")).into()),
        Err(_) => Ok(default),
    }
}

//! Hearthbot: a self-hosted Discord community bot backed by a local
//! chat-completion endpoint and a ComfyUI image-generation service.

pub mod comfy;
pub mod config;
pub mod context;
pub mod discord;
pub mod error;
pub mod llm;
pub mod moderation;
pub mod setup;
pub mod store;
pub mod watchdog;

pub use error::{Error, Result};

use std::sync::Arc;

/// Guild identifier (Discord snowflake).
pub type GuildId = u64;

/// Channel identifier (Discord snowflake).
pub type ChannelId = u64;

/// User identifier (Discord snowflake).
pub type UserId = u64;

/// Shared dependency bundle handed to every component.
///
/// The state the bot mutates at runtime (contexts, guild configs, activity
/// markers, emoji pools) lives in these service objects, constructed once at
/// startup and passed by handle. Nothing in the crate reaches for ambient
/// globals.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<config::Config>,
    pub contexts: Arc<context::ContextStore>,
    pub guilds: Arc<store::guilds::GuildStore>,
    pub profiles: Arc<store::profiles::ProfileStore>,
    pub transcript: Arc<store::transcript::TranscriptLog>,
    pub dispatcher: Arc<llm::Dispatcher>,
    pub images: Arc<comfy::ImageClient>,
    pub activity: Arc<watchdog::ActivityTracker>,
    pub moderation: Arc<moderation::WordFilter>,
    pub dialogs: Arc<setup::DialogRouter>,
    pub emojis: Arc<discord::EmojiCache>,
}

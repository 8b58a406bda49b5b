//! Flat-file persistence: guild configuration, chat transcript, user profiles.

pub mod guilds;
pub mod profiles;
pub mod transcript;

pub use guilds::{GuildConfig, GuildStore, OperatingHours};
pub use profiles::{ProfileStore, UserProfile};
pub use transcript::TranscriptLog;

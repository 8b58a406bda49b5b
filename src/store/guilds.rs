//! Guild configuration store and operating-hours windows.

use crate::error::{ConfigError, Result};
use crate::GuildId;
use anyhow::Context as _;
use chrono::NaiveTime;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

/// Per-guild bot configuration, created by the setup dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildConfig {
    /// Free-text description of the bot's function in this guild.
    pub description: String,

    /// Advisory timezone label. Never used for real conversion.
    pub timezone: String,

    /// Free-text special instructions from the setup dialog.
    pub special_instructions: String,

    /// Daily window during which scheduled actions may fire.
    #[serde(default)]
    pub operating_hours: Option<OperatingHours>,

    /// System preamble prepended to every generation for this guild.
    pub personality: String,
}

/// A daily time window, possibly wrapping midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatingHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl OperatingHours {
    /// Parse a `HH:MM-HH:MM` window string.
    pub fn parse(raw: &str) -> Result<Self> {
        let (start_raw, end_raw) = raw.split_once('-').ok_or_else(|| {
            ConfigError::Invalid(format!("operating hours '{raw}': expected 'HH:MM-HH:MM'"))
        })?;
        Ok(Self {
            start: parse_hhmm(start_raw.trim())?,
            end: parse_hhmm(end_raw.trim())?,
        })
    }

    /// Whether `now` falls inside the window.
    ///
    /// `start <= end` is a same-day window (inclusive on both ends);
    /// `start > end` wraps midnight and contains `now >= start || now <= end`.
    pub fn contains(&self, now: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= now && now <= self.end
        } else {
            now >= self.start || now <= self.end
        }
    }
}

/// Parse a `HH:MM` time-of-day string (24-hour).
pub fn parse_hhmm(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .map_err(|_| ConfigError::Invalid(format!("'{raw}' is not a HH:MM time")).into())
}

impl std::fmt::Display for OperatingHours {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}",
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

impl Serialize for OperatingHours {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for OperatingHours {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        OperatingHours::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// JSON-backed map of guild id to [`GuildConfig`].
///
/// Loaded once at startup, written back in full on every mutation. Keys are
/// stringified snowflakes for JSON compatibility.
pub struct GuildStore {
    path: PathBuf,
    configs: RwLock<HashMap<String, GuildConfig>>,
}

impl GuildStore {
    /// Load the store from disk. A missing file starts empty; a corrupt file
    /// is logged and starts empty rather than failing startup.
    pub fn load(path: PathBuf) -> Self {
        let configs = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(map) => map,
                Err(error) => {
                    tracing::error!(path = %path.display(), %error, "could not parse guild config file");
                    HashMap::new()
                }
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "no guild config file, starting empty");
                HashMap::new()
            }
        };
        Self { path, configs: RwLock::new(configs) }
    }

    /// Fetch a guild's configuration, if set up.
    pub fn get(&self, guild_id: GuildId) -> Option<GuildConfig> {
        self.configs
            .read()
            .expect("guild store lock poisoned")
            .get(&guild_id.to_string())
            .cloned()
    }

    /// Insert or replace a guild's configuration and persist the map.
    pub fn set(&self, guild_id: GuildId, config: GuildConfig) -> Result<()> {
        let snapshot = {
            let mut configs = self.configs.write().expect("guild store lock poisoned");
            configs.insert(guild_id.to_string(), config);
            configs.clone()
        };
        let raw = serde_json::to_string_pretty(&snapshot)
            .context("failed to serialize guild configs")
            .map_err(crate::Error::Other)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("failed to write {}", self.path.display()))
            .map_err(crate::Error::Other)?;
        tracing::info!(guild_id, "guild configuration saved");
        Ok(())
    }
}

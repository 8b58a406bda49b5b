//! User profile store.

use crate::error::Result;
use crate::UserId;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

/// Lightweight per-user record, overwritten on every observed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: String,
    /// UTC timestamp of the last observed message, `YYYY-MM-DD HH:MM:SS`.
    pub last_seen: String,
}

/// JSON-backed map of user id to [`UserProfile`].
pub struct ProfileStore {
    path: PathBuf,
    profiles: RwLock<HashMap<String, UserProfile>>,
}

impl ProfileStore {
    pub fn load(path: PathBuf) -> Self {
        let profiles = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(map) => map,
                Err(error) => {
                    tracing::error!(path = %path.display(), %error, "could not parse profile file");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self { path, profiles: RwLock::new(profiles) }
    }

    /// Record that a user was just seen and persist the map.
    pub fn observe(&self, user_id: UserId, display_name: &str) -> Result<()> {
        let profile = UserProfile {
            name: display_name.to_owned(),
            last_seen: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        };
        let snapshot = {
            let mut profiles = self.profiles.write().expect("profile store lock poisoned");
            profiles.insert(user_id.to_string(), profile);
            profiles.clone()
        };
        let raw = serde_json::to_string_pretty(&snapshot)
            .context("failed to serialize profiles")
            .map_err(crate::Error::Other)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("failed to write {}", self.path.display()))
            .map_err(crate::Error::Other)?;
        Ok(())
    }

    pub fn get(&self, user_id: UserId) -> Option<UserProfile> {
        self.profiles
            .read()
            .expect("profile store lock poisoned")
            .get(&user_id.to_string())
            .cloned()
    }
}

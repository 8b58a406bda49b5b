//! Per-channel conversation context.

use crate::ChannelId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Speaker role of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged message entry in a channel's rolling history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }
}

/// In-memory map of channel id to ordered turn list.
///
/// Channels are created lazily on first append and live for the process
/// lifetime. The system preamble is never stored here; the dispatcher
/// prepends it transiently at call time. An optional `max_turns` cap drops
/// the oldest turns on append; when unset the history grows unbounded and
/// only the on-disk transcript is trimmed.
pub struct ContextStore {
    channels: RwLock<HashMap<ChannelId, Vec<Turn>>>,
    max_turns: Option<usize>,
}

impl ContextStore {
    pub fn new(max_turns: Option<usize>) -> Self {
        Self { channels: RwLock::new(HashMap::new()), max_turns }
    }

    /// Seed the store from persisted transcript history at startup.
    pub async fn seed(&self, histories: HashMap<ChannelId, Vec<Turn>>) {
        let mut channels = self.channels.write().await;
        for (channel_id, mut turns) in histories {
            if let Some(cap) = self.max_turns {
                if turns.len() > cap {
                    turns.drain(..turns.len() - cap);
                }
            }
            channels.insert(channel_id, turns);
        }
    }

    /// Append a turn to a channel's history. Never fails.
    pub async fn append(&self, channel_id: ChannelId, turn: Turn) {
        let mut channels = self.channels.write().await;
        let turns = channels.entry(channel_id).or_default();
        turns.push(turn);
        if let Some(cap) = self.max_turns {
            if turns.len() > cap {
                let excess = turns.len() - cap;
                turns.drain(..excess);
            }
        }
    }

    /// Full ordered turn sequence for a channel, empty if unseen.
    pub async fn snapshot(&self, channel_id: ChannelId) -> Vec<Turn> {
        self.channels
            .read()
            .await
            .get(&channel_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_preserves_order() {
        let store = ContextStore::new(None);
        store.append(1, Turn::user("hello")).await;
        store.append(1, Turn::assistant("hi there")).await;

        let turns = store.snapshot(1).await;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0], Turn::user("hello"));
        assert_eq!(turns[1], Turn::assistant("hi there"));
    }

    #[tokio::test]
    async fn unseen_channel_is_empty() {
        let store = ContextStore::new(None);
        assert!(store.snapshot(42).await.is_empty());
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let store = ContextStore::new(None);
        store.append(1, Turn::user("a")).await;
        store.append(2, Turn::user("b")).await;

        assert_eq!(store.snapshot(1).await.len(), 1);
        assert_eq!(store.snapshot(2).await.len(), 1);
        assert_eq!(store.snapshot(1).await[0].content, "a");
    }

    #[tokio::test]
    async fn cap_drops_oldest_turns() {
        let store = ContextStore::new(Some(2));
        store.append(1, Turn::user("one")).await;
        store.append(1, Turn::user("two")).await;
        store.append(1, Turn::user("three")).await;

        let turns = store.snapshot(1).await;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "two");
        assert_eq!(turns[1].content, "three");
    }

    #[tokio::test]
    async fn seed_respects_cap() {
        let store = ContextStore::new(Some(1));
        let mut histories = HashMap::new();
        histories.insert(7, vec![Turn::user("old"), Turn::user("new")]);
        store.seed(histories).await;

        let turns = store.snapshot(7).await;
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].content, "new");
    }
}

//! Inactivity watchdog and hourly digest loops.
//!
//! Both loops run for the process lifetime, spawned once the gateway is
//! ready. Every action is gated by the guild's operating-hours window, and a
//! failure in one guild or channel never stops the sweep: the external calls
//! they make are bounded by the dispatcher/coordinator timeouts, so
//! sequential awaiting cannot starve the loop indefinitely.

use crate::discord::{send_images, send_long_message};
use crate::{ChannelId, Services};
use chrono::{DateTime, Local, Utc};
use rand::seq::IndexedRandom as _;
use serenity::all::{ChannelType, Context as SerenityContext};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// Inactivity scan interval.
const INACTIVITY_POLL: Duration = Duration::from_secs(60);

/// Digest interval.
const DIGEST_INTERVAL: Duration = Duration::from_secs(3600);

const ICEBREAKERS: &[&str] = &[
    "Hey everyone! How's your day going?",
    "What's something exciting you're working on?",
    "Need any help or have any questions?",
];

/// Last-observed-activity timestamps per channel.
///
/// Only channels that have produced at least one message are tracked; a
/// channel that has been silent since startup never triggers engagement.
pub struct ActivityTracker {
    last_seen: RwLock<HashMap<ChannelId, DateTime<Utc>>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self { last_seen: RwLock::new(HashMap::new()) }
    }

    /// Record activity in a channel (also used to suppress repeat nudges).
    pub fn mark(&self, channel_id: ChannelId) {
        self.last_seen
            .write()
            .expect("activity tracker lock poisoned")
            .insert(channel_id, Utc::now());
    }

    pub fn last_seen(&self, channel_id: ChannelId) -> Option<DateTime<Utc>> {
        self.last_seen
            .read()
            .expect("activity tracker lock poisoned")
            .get(&channel_id)
            .copied()
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a channel last seen at `last` has been idle past the threshold.
fn is_idle(now: DateTime<Utc>, last: DateTime<Utc>, threshold_mins: i64) -> bool {
    now - last > chrono::Duration::minutes(threshold_mins)
}

/// Whether scheduled actions may run for this guild right now.
fn within_operating_hours(services: &Services, guild_id: crate::GuildId) -> bool {
    match services.guilds.get(guild_id).and_then(|c| c.operating_hours) {
        Some(window) => window.contains(Local::now().time()),
        None => true,
    }
}

/// Perpetual inactivity scan.
pub async fn run_inactivity_loop(ctx: SerenityContext, services: Services) {
    tracing::info!("inactivity watchdog started");
    loop {
        inactivity_tick(&ctx, &services).await;
        tokio::time::sleep(INACTIVITY_POLL).await;
    }
}

async fn inactivity_tick(ctx: &SerenityContext, services: &Services) {
    let now = Utc::now();
    let threshold = services.config.inactivity_threshold_mins;

    for guild_id in ctx.cache.guilds() {
        if !within_operating_hours(services, guild_id.get()) {
            continue;
        }

        // Collect ids before awaiting; cache refs cannot cross await points.
        let channel_ids: Vec<ChannelId> = match ctx.cache.guild(guild_id) {
            Some(guild) => guild
                .channels
                .values()
                .filter(|channel| channel.kind == ChannelType::Text)
                .map(|channel| channel.id.get())
                .collect(),
            None => continue,
        };

        for channel_id in channel_ids {
            let Some(last) = services.activity.last_seen(channel_id) else {
                continue;
            };
            if !is_idle(now, last, threshold) {
                continue;
            }
            tracing::info!(guild_id = guild_id.get(), channel_id, "channel idle, engaging");
            proactive_engagement(ctx, services, guild_id.get(), channel_id).await;
            services.activity.mark(channel_id);
        }
    }
}

/// Nudge an idle channel: try a generated image icebreaker, fall back to a
/// plain text prompt when image generation fails.
async fn proactive_engagement(
    ctx: &SerenityContext,
    services: &Services,
    guild_id: crate::GuildId,
    channel_id: ChannelId,
) {
    let prompt = ICEBREAKERS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(ICEBREAKERS[0]);

    match services.images.generate(prompt).await {
        Ok(images) => {
            let caption = format!("Here is a generated image to spark the conversation: {prompt}");
            if let Err(error) = send_images(ctx, channel_id, &caption, images).await {
                tracing::error!(channel_id, %error, "failed to send proactive image");
            }
        }
        Err(error) => {
            tracing::warn!(channel_id, %error, "icebreaker image failed, sending text nudge");
            let mut nudge =
                String::from("No one has been active lately. Let's get the conversation going!");
            if let Some(emoji) = services.emojis.pick(guild_id) {
                nudge.push(' ');
                nudge.push_str(&emoji);
            }
            if let Err(error) = send_long_message(ctx, channel_id, &nudge).await {
                tracing::error!(channel_id, %error, "failed to send proactive message");
            }
        }
    }
}

/// Perpetual hourly digest.
pub async fn run_digest_loop(ctx: SerenityContext, services: Services) {
    tracing::info!("digest loop started");
    loop {
        tokio::time::sleep(DIGEST_INTERVAL).await;
        digest_tick(&ctx, &services).await;
    }
}

async fn digest_tick(ctx: &SerenityContext, services: &Services) {
    for guild_id in ctx.cache.guilds() {
        if !within_operating_hours(services, guild_id.get()) {
            continue;
        }

        let general = ctx.cache.guild(guild_id).and_then(|guild| {
            guild
                .channels
                .values()
                .find(|channel| channel.kind == ChannelType::Text && channel.name == "general")
                .map(|channel| channel.id.get())
        });
        let Some(channel_id) = general else { continue };

        // One guild's failure must not stop the other digests this tick.
        let result = services
            .dispatcher
            .generate(
                "Provide a daily summary or reminder for the server.",
                Some(guild_id.get()),
                channel_id,
            )
            .await;
        match result {
            Ok(summary) => {
                if let Err(error) = send_long_message(ctx, channel_id, &summary).await {
                    tracing::error!(guild_id = guild_id.get(), %error, "failed to send digest");
                }
            }
            Err(error) => {
                tracing::error!(guild_id = guild_id.get(), %error, "digest generation failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_check_uses_strict_threshold() {
        let now = Utc::now();
        let threshold = 260;
        assert!(!is_idle(now, now, threshold));
        assert!(!is_idle(now, now - chrono::Duration::minutes(260), threshold));
        assert!(is_idle(now, now - chrono::Duration::minutes(261), threshold));
    }

    #[test]
    fn tracker_marks_and_reads_back() {
        let tracker = ActivityTracker::new();
        assert_eq!(tracker.last_seen(5), None);
        tracker.mark(5);
        let seen = tracker.last_seen(5).unwrap();
        assert!(Utc::now() - seen < chrono::Duration::seconds(5));
    }
}

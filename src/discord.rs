//! Discord platform adapter: gateway events, `!!` commands, outbound sends.

use crate::comfy::GeneratedImage;
use crate::context::Turn;
use crate::setup::{SetupDialog, SetupOutcome};
use crate::Services;
use async_trait::async_trait;
use rand::seq::IndexedRandom as _;
use serenity::all::{
    ChannelId as SerenityChannelId, ChannelType, Client, Context, CreateAttachment, CreateMessage,
    EventHandler, GatewayIntents, GuildId as SerenityGuildId, Member, Mentionable as _, Message,
    OnlineStatus, Reaction, Ready,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// Discord's hard message length limit.
const MESSAGE_CHAR_LIMIT: usize = 2000;

/// Command prefix, kept from the original deployment.
const COMMAND_PREFIX: &str = "!!";

/// Name trigger: messages mentioning the bot by name get a reply.
const NAME_TRIGGER: &str = "hearth";

const STANDARD_EMOJIS: &[&str] = &["😀", "🎉", "❤️", "✨", "🔥", "👍", "🙌", "🌟", "🤖", "💬"];

const GENERATION_APOLOGY: &str = "Sorry, I couldn't come up with a response just now.";

/// Per-guild custom emoji pool, with a standard fallback.
pub struct EmojiCache {
    pools: RwLock<HashMap<crate::GuildId, Vec<String>>>,
}

impl EmojiCache {
    pub fn new() -> Self {
        Self { pools: RwLock::new(HashMap::new()) }
    }

    pub fn populate(&self, guild_id: crate::GuildId, emojis: Vec<String>) {
        tracing::debug!(guild_id, count = emojis.len(), "cached guild emojis");
        self.pools
            .write()
            .expect("emoji cache lock poisoned")
            .insert(guild_id, emojis);
    }

    /// A random emoji for the guild: its own pool when present, otherwise
    /// one of the standard set.
    pub fn pick(&self, guild_id: crate::GuildId) -> Option<String> {
        let pools = self.pools.read().expect("emoji cache lock poisoned");
        let custom = pools.get(&guild_id).filter(|pool| !pool.is_empty());
        match custom {
            Some(pool) => pool.choose(&mut rand::rng()).cloned(),
            None => STANDARD_EMOJIS
                .choose(&mut rand::rng())
                .map(|s| (*s).to_owned()),
        }
    }
}

impl Default for EmojiCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Send a message, chunking at Discord's length limit.
pub async fn send_long_message(
    ctx: &Context,
    channel_id: crate::ChannelId,
    content: &str,
) -> crate::Result<()> {
    let channel = SerenityChannelId::new(channel_id);
    if content.chars().count() <= MESSAGE_CHAR_LIMIT {
        channel.say(&ctx.http, content).await?;
        return Ok(());
    }

    let chars: Vec<char> = content.chars().collect();
    for chunk in chars.chunks(MESSAGE_CHAR_LIMIT) {
        channel.say(&ctx.http, chunk.iter().collect::<String>()).await?;
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
    Ok(())
}

/// Send a caption plus generated images as attachments.
pub async fn send_images(
    ctx: &Context,
    channel_id: crate::ChannelId,
    caption: &str,
    images: Vec<GeneratedImage>,
) -> crate::Result<()> {
    let channel = SerenityChannelId::new(channel_id);
    let mut message = CreateMessage::new().content(caption);
    for image in images {
        message = message.add_file(CreateAttachment::bytes(image.png, image.filename));
    }
    channel.send_message(&ctx.http, message).await?;
    Ok(())
}

pub struct Handler {
    services: Services,
    watchdog_started: AtomicBool,
}

impl Handler {
    pub fn new(services: Services) -> Self {
        Self { services, watchdog_started: AtomicBool::new(false) }
    }

    /// Generate a reply and send it, degrading to an apology on failure.
    async fn reply_generated(
        &self,
        ctx: &Context,
        channel_id: crate::ChannelId,
        guild_id: Option<crate::GuildId>,
        prompt: &str,
        apology: &str,
    ) {
        let typing = SerenityChannelId::new(channel_id).start_typing(&ctx.http);
        let result = self
            .services
            .dispatcher
            .generate(prompt, guild_id, channel_id)
            .await;
        typing.stop();

        let outgoing = match &result {
            Ok(reply) => reply.as_str(),
            Err(error) => {
                tracing::error!(channel_id, %error, "generation failed");
                apology
            }
        };
        if let Err(error) = send_long_message(ctx, channel_id, outgoing).await {
            tracing::error!(channel_id, %error, "failed to send reply");
        }
    }

    async fn handle_command(&self, ctx: &Context, msg: &Message, invocation: &str) {
        let (command, rest) = match invocation.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (invocation, ""),
        };
        let channel_id = msg.channel_id.get();
        let guild_id = msg.guild_id.map(|id| id.get());
        tracing::info!(channel_id, command, "handling command");

        match command.to_lowercase().as_str() {
            "operatinghours" => self.cmd_operating_hours(ctx, msg).await,
            "timecheck" => self.cmd_timecheck(ctx, channel_id).await,
            "members" => self.cmd_members(ctx, msg).await,
            "whatsnew" => self.cmd_whatsnew(ctx, msg).await,
            "setup" => self.cmd_setup(ctx, msg).await,
            "genimg" => self.cmd_genimg(ctx, msg, rest).await,
            _ => {
                // Unknown prefixed messages still get a conversational reply.
                let prompt = format!("{} has said: {}", msg.author.display_name(), msg.content);
                self.reply_generated(ctx, channel_id, guild_id, &prompt, GENERATION_APOLOGY)
                    .await;
            }
        }
    }

    async fn cmd_operating_hours(&self, ctx: &Context, msg: &Message) {
        let channel_id = msg.channel_id.get();
        let Some(guild_id) = msg.guild_id.map(|id| id.get()) else {
            let _ = send_long_message(ctx, channel_id, "Operating hours only apply within a server.").await;
            return;
        };
        let Some(config) = self.services.guilds.get(guild_id) else {
            let _ = send_long_message(
                ctx,
                channel_id,
                "Operating hours are not configured for this server.",
            )
            .await;
            return;
        };

        let hours = config
            .operating_hours
            .map(|window| window.to_string())
            .unwrap_or_else(|| "Not set".into());
        let prompt = format!(
            "{} has asked what your operating hours are. After looking it up, you now know \
             that your hours of operation are {hours}.",
            msg.author.display_name()
        );
        self.reply_generated(
            ctx,
            channel_id,
            Some(guild_id),
            &prompt,
            "Sorry, I couldn't retrieve my operating hours at the moment.",
        )
        .await;
    }

    async fn cmd_timecheck(&self, ctx: &Context, channel_id: crate::ChannelId) {
        let response = format!(
            "**Current UTC Time:** {}\n**Current Local Time:** {}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S"),
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        );
        if let Err(error) = send_long_message(ctx, channel_id, &response).await {
            tracing::error!(channel_id, %error, "failed to send timecheck");
        }
    }

    async fn cmd_members(&self, ctx: &Context, msg: &Message) {
        let channel_id = msg.channel_id.get();
        let statuses = match msg.guild_id {
            Some(guild_id) => member_statuses(ctx, guild_id),
            None => "No members are currently online.".into(),
        };
        let _ = send_long_message(ctx, channel_id, &format!("**Online Members:**\n{statuses}")).await;
    }

    async fn cmd_whatsnew(&self, ctx: &Context, msg: &Message) {
        let channel_id = msg.channel_id.get();
        let notes = tokio::fs::read_to_string(self.services.config.whatsnew_path())
            .await
            .unwrap_or_default();
        if notes.trim().is_empty() {
            let _ = send_long_message(ctx, channel_id, "There are no new updates at the moment.").await;
            return;
        }

        let prompt = format!(
            "{} wants to know what's new. You have the following updates to share:\n{}",
            msg.author.display_name(),
            notes.trim()
        );
        self.reply_generated(
            ctx,
            channel_id,
            msg.guild_id.map(|id| id.get()),
            &prompt,
            "Sorry, I couldn't retrieve the latest updates at the moment.",
        )
        .await;
    }

    async fn cmd_setup(&self, ctx: &Context, msg: &Message) {
        let channel_id = msg.channel_id.get();
        let Some(guild_id) = msg.guild_id else {
            let _ = send_long_message(ctx, channel_id, "Configuration can only be done within a server.").await;
            return;
        };
        if !is_admin(ctx, guild_id, msg).await {
            let _ = send_long_message(
                ctx,
                channel_id,
                "Configuration requires the Administrator permission.",
            )
            .await;
            return;
        }

        let user_id = msg.author.id.get();
        let mut replies = self.services.dialogs.begin(channel_id, user_id);
        let mut dialog = SetupDialog::new();

        let outcome = loop {
            if let Err(error) = send_long_message(ctx, channel_id, dialog.prompt()).await {
                tracing::error!(channel_id, %error, "failed to send setup prompt");
                break SetupOutcome::Aborted("Configuration aborted.".into());
            }
            match tokio::time::timeout(dialog.step_timeout(), replies.recv()).await {
                Err(_) => break dialog.timed_out(),
                Ok(None) => break SetupOutcome::Aborted("Configuration cancelled.".into()),
                Ok(Some(reply)) => match dialog.advance(&reply) {
                    SetupOutcome::Continue => continue,
                    outcome => break outcome,
                },
            }
        };
        self.services.dialogs.end(channel_id, user_id);

        match outcome {
            SetupOutcome::Complete(config) => {
                match self.services.guilds.set(guild_id.get(), config) {
                    Ok(()) => {
                        let _ = send_long_message(
                            ctx,
                            channel_id,
                            "Configuration complete! Hearth is now set up and ready to use.",
                        )
                        .await;
                    }
                    Err(error) => {
                        tracing::error!(guild_id = guild_id.get(), %error, "failed to save configuration");
                        let _ = send_long_message(
                            ctx,
                            channel_id,
                            "Something went wrong saving the configuration. Please try again later.",
                        )
                        .await;
                    }
                }
            }
            SetupOutcome::Aborted(reason) => {
                tracing::warn!(guild_id = guild_id.get(), %reason, "setup dialog aborted");
                let _ = send_long_message(ctx, channel_id, &reason).await;
            }
            SetupOutcome::Continue => unreachable!("loop exits only on a terminal outcome"),
        }
    }

    async fn cmd_genimg(&self, ctx: &Context, msg: &Message, prompt: &str) {
        let channel_id = msg.channel_id.get();
        if prompt.is_empty() {
            let _ = send_long_message(ctx, channel_id, "Usage: `!!genimg <your prompt here>`").await;
            return;
        }

        let _ = send_long_message(
            ctx,
            channel_id,
            &format!("Generating an image for prompt: `{prompt}`. This may take a moment..."),
        )
        .await;

        match self.services.images.generate(prompt).await {
            Ok(images) => {
                let renamed = images
                    .into_iter()
                    .enumerate()
                    .map(|(index, image)| GeneratedImage {
                        filename: format!("generated_image_{}.png", index + 1),
                        png: image.png,
                    })
                    .collect();
                if let Err(error) = send_images(ctx, channel_id, "Here you go:", renamed).await {
                    tracing::error!(channel_id, %error, "failed to send generated images");
                }
            }
            Err(error) => {
                tracing::error!(channel_id, %error, "image generation failed");
                let _ = send_long_message(
                    ctx,
                    channel_id,
                    &format!("An error occurred while generating the image: {error}"),
                )
                .await;
            }
        }
    }
}

/// Online, non-bot members of a guild from the presence cache.
fn member_statuses(ctx: &Context, guild_id: SerenityGuildId) -> String {
    let Some(guild) = ctx.cache.guild(guild_id) else {
        return "No members are currently online.".into();
    };

    let mut lines = Vec::new();
    for (user_id, presence) in &guild.presences {
        if presence.status == OnlineStatus::Offline {
            continue;
        }
        if let Some(member) = guild.members.get(user_id) {
            if member.user.bot {
                continue;
            }
            lines.push(format!("{} ({})", member.display_name(), presence.status.name()));
        }
    }

    if lines.is_empty() {
        "No members are currently online.".into()
    } else {
        lines.join("\n")
    }
}

/// Whether the message author holds the Administrator permission.
async fn is_admin(ctx: &Context, guild_id: SerenityGuildId, msg: &Message) -> bool {
    let Ok(member) = guild_id.member(&ctx.http, msg.author.id).await else {
        return false;
    };
    match ctx.cache.guild(guild_id) {
        Some(guild) => guild.member_permissions(&member).administrator(),
        None => false,
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!(user = %ready.user.name, guilds = ready.guilds.len(), "gateway ready");

        // Ready fires again on reconnect; the loops must only start once.
        if !self.watchdog_started.swap(true, Ordering::SeqCst) {
            tokio::spawn(crate::watchdog::run_inactivity_loop(
                ctx.clone(),
                self.services.clone(),
            ));
            tokio::spawn(crate::watchdog::run_digest_loop(ctx, self.services.clone()));
        }
    }

    async fn guild_create(&self, _ctx: Context, guild: serenity::all::Guild, _is_new: Option<bool>) {
        let emojis: Vec<String> = guild.emojis.values().map(|emoji| emoji.to_string()).collect();
        self.services.emojis.populate(guild.id.get(), emojis);
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        let channel_id = msg.channel_id.get();
        let user_id = msg.author.id.get();
        let guild_id = msg.guild_id.map(|id| id.get());

        // A pending setup dialog owns this user's replies in this channel.
        if self.services.dialogs.route(channel_id, user_id, &msg.content).await {
            return;
        }

        let author_name = msg.author.display_name().to_owned();
        if let Some(guild_id) = guild_id {
            if let Err(error) =
                self.services.transcript.append(guild_id, channel_id, &author_name, &msg.content)
            {
                tracing::error!(channel_id, %error, "failed to log transcript line");
            }
        }
        self.services.contexts.append(channel_id, Turn::user(&msg.content)).await;
        if let Err(error) = self.services.profiles.observe(user_id, &author_name) {
            tracing::error!(user_id, %error, "failed to update user profile");
        }
        self.services.activity.mark(channel_id);

        if !self.services.moderation.is_allowed(&msg.content) {
            tracing::info!(channel_id, user_id, "removing disallowed message");
            if let Err(error) = msg.delete(&ctx.http).await {
                tracing::error!(channel_id, %error, "failed to delete disallowed message");
            }
            let warning = format!(
                "Sorry {}, your message contained inappropriate language.",
                msg.author.mention()
            );
            let _ = send_long_message(&ctx, channel_id, &warning).await;
            return;
        }

        if let Some(invocation) = msg.content.strip_prefix(COMMAND_PREFIX) {
            self.handle_command(&ctx, &msg, invocation.trim()).await;
            return;
        }

        if msg.content.to_lowercase().contains(NAME_TRIGGER) {
            let prompt = format!("{author_name} has said: {}", msg.content);
            self.reply_generated(&ctx, channel_id, guild_id, &prompt, GENERATION_APOLOGY)
                .await;
        }
    }

    async fn reaction_add(&self, ctx: Context, reaction: Reaction) {
        let bot_id = ctx.cache.current_user().id;
        if reaction.user_id == Some(bot_id) {
            return;
        }

        // Only acknowledge reactions on the bot's own messages.
        let Ok(message) = reaction.message(&ctx.http).await else {
            return;
        };
        if message.author.id != bot_id {
            return;
        }

        let reactor = match reaction.user(&ctx.http).await {
            Ok(user) if !user.bot => user,
            _ => return,
        };

        let prompt = format!(
            "{} reacted with {} to my message. Acknowledge their reaction.",
            reactor.display_name(),
            reaction.emoji
        );
        self.reply_generated(
            &ctx,
            reaction.channel_id.get(),
            reaction.guild_id.map(|id| id.get()),
            &prompt,
            GENERATION_APOLOGY,
        )
        .await;
    }

    async fn guild_member_addition(&self, ctx: Context, member: Member) {
        let welcome_channel = ctx.cache.guild(member.guild_id).and_then(|guild| {
            guild
                .channels
                .values()
                .find(|channel| channel.kind == ChannelType::Text && channel.name == "welcome")
                .map(|channel| channel.id.get())
        });
        let Some(channel_id) = welcome_channel else {
            return;
        };

        let prompt = format!(
            "Welcome {} to the server! Make them feel at home.",
            member.display_name()
        );
        self.reply_generated(
            &ctx,
            channel_id,
            Some(member.guild_id.get()),
            &prompt,
            GENERATION_APOLOGY,
        )
        .await;
    }
}

/// Connect to the gateway and run until the client stops.
pub async fn run(services: Services) -> crate::Result<()> {
    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::GUILD_MESSAGE_REACTIONS
        | GatewayIntents::GUILD_PRESENCES;

    let token = services.config.discord_token.clone();
    let mut client = Client::builder(&token, intents)
        .event_handler(Handler::new(services))
        .await?;
    client.start().await?;
    Ok(())
}

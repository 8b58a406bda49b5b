//! Generation dispatcher: persona resolution, context assembly, pool dispatch.

use crate::config::DEFAULT_PERSONA;
use crate::context::{ContextStore, Turn};
use crate::error::GenerationError;
use crate::llm::{ChatClient, WorkerPool};
use crate::store::guilds::GuildStore;
use crate::{ChannelId, GuildId};
use std::sync::Arc;

/// Builds prompt payloads and routes completion calls through the pool.
///
/// There is no per-channel lock: two concurrent generations for the same
/// channel may interleave their context appends. Accepted limitation.
pub struct Dispatcher {
    client: ChatClient,
    pool: WorkerPool,
    contexts: Arc<ContextStore>,
    guilds: Arc<GuildStore>,
}

impl Dispatcher {
    pub fn new(
        client: ChatClient,
        pool: WorkerPool,
        contexts: Arc<ContextStore>,
        guilds: Arc<GuildStore>,
    ) -> Self {
        Self { client, pool, contexts, guilds }
    }

    /// Resolve the guild's persona, falling back to the safe-mode default.
    fn persona(&self, guild_id: Option<GuildId>) -> String {
        guild_id
            .and_then(|id| self.guilds.get(id))
            .map(|config| config.personality)
            .filter(|personality| !personality.is_empty())
            .unwrap_or_else(|| DEFAULT_PERSONA.to_owned())
    }

    /// Generate a reply to `prompt` in the given channel.
    ///
    /// Appends the user turn before the call and the assistant turn after a
    /// successful one. The system preamble is prepended transiently and never
    /// stored. Failures append nothing.
    pub async fn generate(
        &self,
        prompt: &str,
        guild_id: Option<GuildId>,
        channel_id: ChannelId,
    ) -> Result<String, GenerationError> {
        let persona = self.persona(guild_id);

        self.contexts.append(channel_id, Turn::user(prompt)).await;

        let history = self.contexts.snapshot(channel_id).await;
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(Turn::system(persona));
        messages.extend(history);

        tracing::debug!(channel_id, turns = messages.len(), "dispatching generation");

        let client = self.client.clone();
        let reply = self
            .pool
            .submit(async move { client.complete(messages).await })
            .await
            .map_err(|_| GenerationError::Network("generation worker dropped".into()))??;

        self.contexts
            .append(channel_id, Turn::assistant(reply.clone()))
            .await;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChatConfig;
    use crate::context::Role;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn dispatcher(endpoint: String, guilds_path: std::path::PathBuf) -> Dispatcher {
        let client = ChatClient::new(&ChatConfig {
            endpoint,
            model: "local-model".into(),
            temperature: 0.9,
        });
        Dispatcher::new(
            client,
            WorkerPool::new(2),
            Arc::new(ContextStore::new(None)),
            Arc::new(GuildStore::load(guilds_path)),
        )
    }

    fn reply_body(content: &str) -> serde_json::Value {
        serde_json::json!({ "choices": [{ "message": { "content": content } }] })
    }

    #[tokio::test]
    async fn success_appends_both_turns() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply_body("hello back")))
            .mount(&server)
            .await;

        let dispatcher = dispatcher(
            format!("{}/v1/chat/completions", server.uri()),
            dir.path().join("guilds.json"),
        );

        let reply = dispatcher.generate("hello", None, 10).await.unwrap();
        assert_eq!(reply, "hello back");

        let turns = dispatcher.contexts.snapshot(10).await;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0], Turn::user("hello"));
        assert_eq!(turns[1], Turn::assistant("hello back"));
    }

    #[tokio::test]
    async fn preamble_is_sent_but_never_stored() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply_body("ok")))
            .mount(&server)
            .await;

        let dispatcher = dispatcher(server.uri(), dir.path().join("guilds.json"));
        dispatcher.generate("first", None, 5).await.unwrap();

        // The outgoing payload leads with the system preamble.
        let requests = server.received_requests().await.unwrap();
        let sent: serde_json::Value = requests[0].body_json().unwrap();
        assert_eq!(sent["messages"][0]["role"], "system");
        assert_eq!(sent["messages"][1]["content"], "first");
        assert_eq!(sent["temperature"], 0.9);

        // But the stored context holds no system turn.
        let turns = dispatcher.contexts.snapshot(5).await;
        assert!(turns.iter().all(|turn| turn.role != Role::System));
    }

    #[tokio::test]
    async fn non_2xx_is_protocol_error_and_appends_no_assistant_turn() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dispatcher = dispatcher(server.uri(), dir.path().join("guilds.json"));
        let error = dispatcher.generate("hello", None, 10).await.unwrap_err();
        assert!(matches!(error, GenerationError::Protocol { status: 500 }));

        let turns = dispatcher.contexts.snapshot(10).await;
        assert_eq!(turns.len(), 1, "user turn stays, assistant turn absent");
        assert_eq!(turns[0].role, Role::User);
    }

    #[tokio::test]
    async fn empty_body_is_empty_response() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(""))
            .mount(&server)
            .await;

        let dispatcher = dispatcher(server.uri(), dir.path().join("guilds.json"));
        let error = dispatcher.generate("hello", None, 10).await.unwrap_err();
        assert!(matches!(error, GenerationError::EmptyResponse));
    }

    #[tokio::test]
    async fn malformed_json_is_parse_error() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let dispatcher = dispatcher(server.uri(), dir.path().join("guilds.json"));
        let error = dispatcher.generate("hello", None, 10).await.unwrap_err();
        assert!(matches!(error, GenerationError::Parse(_)));
    }

    #[tokio::test]
    async fn guild_personality_overrides_default() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply_body("ok")))
            .mount(&server)
            .await;

        let guilds = GuildStore::load(dir.path().join("guilds.json"));
        guilds
            .set(
                99,
                crate::store::guilds::GuildConfig {
                    description: "pirate".into(),
                    timezone: "Local Time".into(),
                    special_instructions: "none".into(),
                    operating_hours: None,
                    personality: "You are a pirate.".into(),
                },
            )
            .unwrap();

        let client = ChatClient::new(&ChatConfig {
            endpoint: server.uri(),
            model: "local-model".into(),
            temperature: 0.9,
        });
        let dispatcher = Dispatcher::new(
            client,
            WorkerPool::new(1),
            Arc::new(ContextStore::new(None)),
            Arc::new(guilds),
        );

        dispatcher.generate("ahoy", Some(99), 3).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let sent: serde_json::Value = requests[0].body_json().unwrap();
        assert_eq!(sent["messages"][0]["content"], "You are a pirate.");
    }
}

use async_trait::async_trait;
use indoc::formatdoc;
use mcp_core::protocol::{CreateMessageParams, CreateMessageResult, SamplingMessage};
use mcp_core::role::Role;
use mcp_core::{Content, Tool};
use mcp_server::{Peer, PeerError};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::registry::Catalog;

/// Reply that means the model found no match.
const UNKNOWN: &str = "unknown";

const SYSTEM_PROMPT: &str =
    "You map a user's intent onto the tools of an Azure MCP server. Reply with a single JSON object and nothing else.";

#[derive(Error, Debug)]
pub enum SamplingError {
    #[error("sampling request failed: {0}")]
    Peer(#[from] PeerError),
    #[error("sampling reply has no text content")]
    NoText,
}

/// Something that can run one LLM completion on the router's behalf,
/// normally the connected client through `sampling/createMessage`.
#[async_trait]
pub trait Sampler: Send + Sync {
    async fn create_message(
        &self,
        params: CreateMessageParams,
    ) -> Result<CreateMessageResult, SamplingError>;
}

#[async_trait]
impl Sampler for Peer {
    async fn create_message(
        &self,
        params: CreateMessageParams,
    ) -> Result<CreateMessageResult, SamplingError> {
        Ok(Peer::create_message(self, params).await?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderPick {
    pub provider: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandPick {
    pub command: String,
    pub parameters: Value,
}

/// Turns a free-text intent into a provider or a command with parameters
/// using one sampling round trip. Every failure is a miss.
#[derive(Debug, Clone)]
pub struct IntentResolver {
    max_tokens: u32,
}

impl IntentResolver {
    pub fn new(max_tokens: u32) -> Self {
        Self { max_tokens }
    }

    pub async fn pick_provider(
        &self,
        sampler: &dyn Sampler,
        intent: &str,
        catalog: &Catalog,
    ) -> Option<ProviderPick> {
        let reply = self
            .ask(sampler, provider_prompt(intent, &catalog.listing()))
            .await?;
        let pick = parse_provider_pick(&reply);
        tracing::debug!(?pick, "Resolved intent to provider");
        pick
    }

    pub async fn pick_command(
        &self,
        sampler: &dyn Sampler,
        intent: &str,
        provider: &str,
        capabilities: &[Tool],
    ) -> Option<CommandPick> {
        let schemas = serde_json::to_string_pretty(capabilities).ok()?;
        let reply = self
            .ask(sampler, command_prompt(intent, provider, &schemas))
            .await?;
        let pick = parse_command_pick(&reply);
        tracing::debug!(provider, ?pick, "Resolved intent to command");
        pick
    }

    async fn ask(&self, sampler: &dyn Sampler, prompt: String) -> Option<String> {
        let params = CreateMessageParams {
            messages: vec![SamplingMessage {
                role: Role::User,
                content: Content::text(prompt),
            }],
            system_prompt: Some(SYSTEM_PROMPT.to_string()),
            temperature: Some(0.0),
            max_tokens: self.max_tokens,
        };

        let reply = sampler
            .create_message(params)
            .await
            .and_then(|result| {
                result
                    .content
                    .as_text()
                    .map(str::to_string)
                    .ok_or(SamplingError::NoText)
            });
        match reply {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::debug!(error = %e, "Sampling unavailable, falling back to learn result");
                None
            }
        }
    }
}

pub fn provider_prompt(intent: &str, listing: &str) -> String {
    formatdoc! {r#"
        Select the one tool that best matches the intent below.

        Intent: {intent}

        Available tools:
        {listing}

        Respond with only a JSON object of the form {{"tool": "<tool name>"}}.
        If no tool matches, respond with {{"tool": "Unknown"}}.
    "#}
}

pub fn command_prompt(intent: &str, provider: &str, schemas: &str) -> String {
    formatdoc! {r#"
        Select the one command of the '{provider}' tool that fulfils the intent below and fill in its parameters from the intent.

        Intent: {intent}

        Available commands with their input schemas:
        {schemas}

        Respond with only a JSON object of the form {{"command": "<command name>", "parameters": {{...}}}}.
        Only use parameter names from the chosen command's schema.
        If no command matches, respond with {{"command": "Unknown", "parameters": {{}}}}.
    "#}
}

/// The JSON object inside a reply, with or without a fenced code block
/// around it.
fn extract_object(reply: &str) -> Option<Map<String, Value>> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    match serde_json::from_str(&reply[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn named(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    let name = keys
        .iter()
        .find_map(|key| map.get(*key).and_then(Value::as_str))?
        .trim();
    if name.is_empty() || name.eq_ignore_ascii_case(UNKNOWN) {
        return None;
    }
    Some(name.to_string())
}

pub fn parse_provider_pick(reply: &str) -> Option<ProviderPick> {
    let map = extract_object(reply)?;
    named(&map, &["tool", "provider"]).map(|provider| ProviderPick { provider })
}

pub fn parse_command_pick(reply: &str) -> Option<CommandPick> {
    let map = extract_object(reply)?;
    let command = named(&map, &["command"])?;
    let parameters = match map.get("parameters") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(Value::Object(params)) => Value::Object(params.clone()),
        Some(_) => return None,
    };
    Some(CommandPick {
        command,
        parameters,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::Mutex;

    /// Sampler double answering every request with one canned reply.
    pub struct FakeSampler {
        replies: Mutex<Vec<Result<String, ()>>>,
        pub requests: Mutex<Vec<CreateMessageParams>>,
    }

    impl FakeSampler {
        /// Replies are handed out in order, the last one repeats.
        pub fn replying(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().map(|r| Ok(r.to_string())).collect()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn failing() -> Self {
            Self {
                replies: Mutex::new(vec![Err(())]),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub async fn request_count(&self) -> usize {
            self.requests.lock().await.len()
        }
    }

    #[async_trait]
    impl Sampler for FakeSampler {
        async fn create_message(
            &self,
            params: CreateMessageParams,
        ) -> Result<CreateMessageResult, SamplingError> {
            self.requests.lock().await.push(params);
            let mut replies = self.replies.lock().await;
            let reply = if replies.len() > 1 {
                replies.remove(0)
            } else {
                replies[0].clone()
            };
            match reply {
                Ok(text) => Ok(CreateMessageResult {
                    role: Role::Assistant,
                    content: Content::text(text),
                    model: "test-model".to_string(),
                    stop_reason: Some("endTurn".to_string()),
                }),
                Err(()) => Err(SamplingError::Peer(PeerError::Closed)),
            }
        }
    }

    #[test]
    fn test_parse_provider_pick() {
        assert_eq!(
            parse_provider_pick(r#"{"tool": "storage"}"#),
            Some(ProviderPick {
                provider: "storage".into()
            })
        );
        assert_eq!(
            parse_provider_pick("```json\n{\"provider\": \"keyvault\"}\n```"),
            Some(ProviderPick {
                provider: "keyvault".into()
            })
        );
    }

    #[test]
    fn test_misses_are_none() {
        assert_eq!(parse_provider_pick(r#"{"tool": "Unknown"}"#), None);
        assert_eq!(parse_provider_pick("Unknown"), None);
        assert_eq!(parse_provider_pick("storage, probably"), None);
        assert_eq!(parse_provider_pick(r#"{"tool": "#), None);
        assert_eq!(parse_provider_pick(r#"{"name": "storage"}"#), None);
        assert_eq!(parse_command_pick(r#"{"command": "unknown", "parameters": {}}"#), None);
        assert_eq!(parse_command_pick(r#"{"command": "x", "parameters": [1]}"#), None);
    }

    #[test]
    fn test_parse_command_pick() {
        let pick = parse_command_pick(
            "Sure:\n```\n{\"command\": \"list-containers\", \"parameters\": {\"account\": \"acct1\"}}\n```",
        )
        .unwrap();
        assert_eq!(pick.command, "list-containers");
        assert_eq!(pick.parameters, json!({"account": "acct1"}));

        let pick = parse_command_pick(r#"{"command": "list-accounts"}"#).unwrap();
        assert_eq!(pick.parameters, json!({}));
    }

    #[tokio::test]
    async fn test_pick_command_sends_schemas_and_intent() {
        let sampler = FakeSampler::replying(&[r#"{"command": "list-containers", "parameters": {}}"#]);
        let tools = vec![Tool::new(
            "list-containers",
            "List blob containers",
            json!({"type": "object", "properties": {"account": {"type": "string"}}}),
            None,
        )];

        let pick = IntentResolver::new(300)
            .pick_command(&sampler, "show my containers", "storage", &tools)
            .await
            .unwrap();
        assert_eq!(pick.command, "list-containers");

        let requests = sampler.requests.lock().await;
        assert_eq!(requests[0].max_tokens, 300);
        let prompt = requests[0].messages[0].content.as_text().unwrap();
        assert!(prompt.contains("show my containers"));
        assert!(prompt.contains("List blob containers"));
        assert!(prompt.contains("'storage'"));
    }

    #[tokio::test]
    async fn test_sampling_failure_is_a_miss() {
        let sampler = FakeSampler::failing();
        let pick = IntentResolver::new(100)
            .pick_provider(&sampler, "anything", &Catalog::default())
            .await;
        assert_eq!(pick, None);
        assert_eq!(sampler.request_count().await, 1);
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mcp_core::protocol::{CallToolResult, Implementation};
use mcp_core::{Content, Tool};
use mcp_server::{ByteTransport, RouterService, Server, ServerError};
use serde_json::{json, Value};
use switchboard::{
    BundledManifest, CapabilityRouter, ConnectError, ExtensionManager, ExtensionManagerError,
    ExtensionRecord, IntentResolver, McpConnector, ProviderClient, ProviderClientCache,
    ProviderConnector, ProviderDescriptor, ProviderRegistry, RouterMode, RouterRequest, Settings,
    SwitchboardRouter,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

struct StaticManager {
    records: Vec<ExtensionRecord>,
}

impl StaticManager {
    fn new(ids: &[(&str, &str)]) -> Self {
        Self {
            records: ids
                .iter()
                .map(|(id, description)| ExtensionRecord {
                    id: id.to_string(),
                    description: description.to_string(),
                    namespace: id.to_string(),
                    version: "0.1.0".to_string(),
                    latest_version: "0.1.0".to_string(),
                    installed: true,
                    tags: vec!["azure".to_string(), "mcp".to_string()],
                })
                .collect(),
        }
    }
}

#[async_trait]
impl ExtensionManager for StaticManager {
    async fn list(&self) -> Result<Vec<ExtensionRecord>, ExtensionManagerError> {
        Ok(self.records.clone())
    }

    async fn install(&self, _extension_id: &str) -> Result<(), ExtensionManagerError> {
        Ok(())
    }

    async fn upgrade(&self, _extension_id: &str) -> Result<(), ExtensionManagerError> {
        Ok(())
    }
}

/// A provider that answers every command with a fixed line of text.
struct CannedProvider {
    id: String,
    commands: HashMap<&'static str, &'static str>,
}

#[async_trait]
impl ProviderClient for CannedProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    fn protocol_version(&self) -> Option<&str> {
        Some("2025-03-26")
    }

    async fn list_capabilities(&self) -> Result<Vec<Tool>, mcp_client::Error> {
        let mut names: Vec<_> = self.commands.keys().collect();
        names.sort();
        Ok(names
            .into_iter()
            .map(|name| {
                Tool::new(
                    *name,
                    format!("Runs {name}"),
                    json!({"type": "object", "properties": {"account": {"type": "string"}}}),
                    None,
                )
            })
            .collect())
    }

    async fn invoke(
        &self,
        command: &str,
        parameters: Value,
    ) -> Result<CallToolResult, mcp_client::Error> {
        let reply = self.commands.get(command).ok_or_else(|| mcp_client::Error::RpcError {
            code: -32602,
            message: format!("unknown command {command}"),
        })?;
        let account = parameters["account"].as_str().unwrap_or("-");
        Ok(CallToolResult::success(vec![Content::text(format!(
            "{reply} ({account})"
        ))]))
    }
}

struct CannedConnector;

#[async_trait]
impl ProviderConnector for CannedConnector {
    async fn connect(
        &self,
        descriptor: &ProviderDescriptor,
    ) -> Result<Arc<dyn ProviderClient>, ConnectError> {
        let commands = match descriptor.id.as_str() {
            "storage" => HashMap::from([
                ("list-accounts", "acct1, acct2"),
                ("list-containers", "images, logs"),
            ]),
            "keyvault" => HashMap::from([("list-secrets", "db-password")]),
            _ => HashMap::new(),
        };
        Ok(Arc::new(CannedProvider {
            id: descriptor.id.clone(),
            commands,
        }))
    }
}

fn switchboard() -> SwitchboardRouter {
    let settings = Settings::default();
    let manager = StaticManager::new(&[
        ("mcp.azure", "This server"),
        ("mcp.storage", "Azure Storage"),
        ("mcp.keyvault", "Azure Key Vault"),
    ]);
    let router = CapabilityRouter::new(
        ProviderRegistry::new(
            Arc::new(manager),
            BundledManifest::from_contents(""),
            &settings,
        ),
        ProviderClientCache::new(Arc::new(CannedConnector)),
        IntentResolver::new(settings.router.sampling_max_tokens),
        settings.router.mode,
    );
    SwitchboardRouter::new(router, settings)
}

struct Harness {
    input: DuplexStream,
    output: Lines<BufReader<DuplexStream>>,
    server: tokio::task::JoinHandle<Result<(), ServerError>>,
}

impl Harness {
    fn start(router: SwitchboardRouter) -> Self {
        let (input, server_in) = tokio::io::duplex(64 * 1024);
        let (server_out, output) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(
            Server::new(RouterService(router)).run(ByteTransport::new(server_in, server_out)),
        );
        Self {
            input,
            output: BufReader::new(output).lines(),
            server,
        }
    }

    async fn send(&mut self, value: Value) {
        let line = format!("{}\n", value);
        self.input.write_all(line.as_bytes()).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let line = self.output.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn initialize(&mut self, capabilities: Value) -> Value {
        self.send(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "capabilities": capabilities,
                "clientInfo": {"name": "e2e", "version": "1.0.0"}
            }
        }))
        .await;
        let reply = self.recv().await;
        self.send(json!({"jsonrpc": "2.0", "method": "notifications/initialized", "params": {}}))
            .await;
        reply
    }

    async fn call(&mut self, id: u32, arguments: Value) -> String {
        self.send(json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": {"name": "azure", "arguments": arguments}
        }))
        .await;
        let reply = self.recv().await;
        assert_eq!(reply["id"], json!(id), "{reply}");
        reply["result"]["content"][0]["text"]
            .as_str()
            .unwrap()
            .to_string()
    }

    async fn shutdown(mut self) {
        drop(self.input);
        assert!(self.output.next_line().await.unwrap().is_none());
        self.server.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_learn_then_invoke_over_stdio() {
    let mut h = Harness::start(switchboard());

    let init = h.initialize(json!({})).await;
    assert_eq!(init["result"]["serverInfo"]["name"], json!("Azure"));
    assert_eq!(init["result"]["protocolVersion"], json!("2025-03-26"));

    h.send(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list", "params": {}}))
        .await;
    let tools = h.recv().await;
    assert_eq!(tools["result"]["tools"][0]["name"], json!("azure"));

    let root = h.call(3, json!({"intent": "anything", "learn": true})).await;
    assert!(root.contains("Azure Storage"));
    assert!(root.contains("Azure Key Vault"));

    let storage = h
        .call(4, json!({"intent": "containers", "learn": true, "tool": "storage"}))
        .await;
    assert!(storage.contains("list-containers"));

    let result = h
        .call(
            5,
            json!({
                "intent": "list containers",
                "tool": "storage",
                "command": "list-containers",
                "parameters": {"account": "acct1"}
            }),
        )
        .await;
    assert_eq!(result, "images, logs (acct1)");

    let missing = h
        .call(6, json!({"intent": "x", "tool": "cosmos", "command": "list"}))
        .await;
    assert!(missing.starts_with("Tool cosmos not found"));

    h.shutdown().await;
}

#[tokio::test]
async fn test_intent_resolved_through_client_sampling() {
    let mut h = Harness::start(switchboard());
    h.initialize(json!({"sampling": {}})).await;

    h.send(json!({
        "jsonrpc": "2.0",
        "id": 2,
        "method": "tools/call",
        "params": {"name": "azure", "arguments": {"intent": "which secrets are in my vault?"}}
    }))
    .await;

    let pick_provider = h.recv().await;
    assert_eq!(pick_provider["method"], json!("sampling/createMessage"));
    let prompt = pick_provider["params"]["messages"][0]["content"]["text"]
        .as_str()
        .unwrap();
    assert!(prompt.contains("which secrets are in my vault?"));
    h.send(json!({
        "jsonrpc": "2.0",
        "id": pick_provider["id"],
        "result": {
            "role": "assistant",
            "content": {"type": "text", "text": "{\"tool\": \"keyvault\"}"},
            "model": "test"
        }
    }))
    .await;

    let pick_command = h.recv().await;
    assert_eq!(pick_command["method"], json!("sampling/createMessage"));
    h.send(json!({
        "jsonrpc": "2.0",
        "id": pick_command["id"],
        "result": {
            "role": "assistant",
            "content": {
                "type": "text",
                "text": "```json\n{\"command\": \"list-secrets\", \"parameters\": {\"account\": \"vault1\"}}\n```"
            },
            "model": "test"
        }
    }))
    .await;

    let reply = h.recv().await;
    assert_eq!(reply["id"], json!(2));
    assert_eq!(
        reply["result"]["content"][0]["text"],
        json!("db-password (vault1)")
    );

    h.shutdown().await;
}

/// Minimal streamable HTTP MCP server: answers by method and echoes ids.
struct DocsServer;

impl Respond for DocsServer {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = match request.body_json() {
            Ok(body) => body,
            Err(_) => return ResponseTemplate::new(400),
        };
        let Some(id) = body.get("id").cloned() else {
            return ResponseTemplate::new(202);
        };
        let result = match body["method"].as_str() {
            Some("initialize") => json!({
                "protocolVersion": "2025-03-26",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "docs", "version": "0.1.0"}
            }),
            Some("tools/list") => json!({
                "tools": [{
                    "name": "search",
                    "description": "Search the documentation",
                    "inputSchema": {"type": "object", "properties": {"query": {"type": "string"}}}
                }]
            }),
            Some("tools/call") => {
                let query = body["params"]["arguments"]["query"].as_str().unwrap_or("");
                json!({"content": [{"type": "text", "text": format!("3 articles about {query}")}]})
            }
            _ => {
                return ResponseTemplate::new(200).set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": "Method not found"}
                }))
            }
        };
        ResponseTemplate::new(200)
            .insert_header("mcp-session-id", "docs-session")
            .set_body_json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
    }
}

#[tokio::test]
async fn test_remote_provider_over_streamable_http() {
    let docs = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(DocsServer)
        .mount(&docs)
        .await;

    let settings = Settings::default();
    let manager: Arc<dyn ExtensionManager> = Arc::new(StaticManager::new(&[]));
    let manifest = BundledManifest::from_contents(
        json!({"servers": [
            {"name": "docs", "description": "Product documentation", "url": format!("{}/mcp", docs.uri())}
        ]})
        .to_string(),
    );
    let connector = McpConnector::new(
        manager.clone(),
        Implementation {
            name: "mcp.azure".to_string(),
            version: "1.0.0".to_string(),
        },
    );
    let router = CapabilityRouter::new(
        ProviderRegistry::new(manager, manifest, &settings),
        ProviderClientCache::new(Arc::new(connector)),
        IntentResolver::new(100),
        RouterMode::Proxy,
    );

    let learned = router
        .handle(
            RouterRequest {
                learn: true,
                provider: Some("docs".to_string()),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    assert!(learned.text().contains("Search the documentation"));

    let result = router
        .handle(
            RouterRequest {
                provider: Some("docs".to_string()),
                command: Some("search".to_string()),
                parameters: Some(json!({"query": "aks"})),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(result.text(), "3 articles about aks");
    assert_eq!(router.cache().cached_ids().await, vec!["docs"]);
}

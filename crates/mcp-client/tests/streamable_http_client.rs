use mcp_client::client::{Error, McpClient, McpClientTrait};
use mcp_client::transport::{StreamableHttpTransport, Transport};
use mcp_core::protocol::{ClientCapabilities, Implementation};
use serde_json::json;
use std::time::{Duration, Instant};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_handshake(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "initialize"})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("mcp-session-id", "session-1")
                .set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": {
                        "protocolVersion": "2025-03-26",
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "storage", "version": "0.3.0"}
                    }
                })),
        )
        .expect(1)
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(
            json!({"method": "notifications/initialized"}),
        ))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(server)
        .await;
}

async fn connect(server: &MockServer) -> McpClient<impl mcp_client::TransportHandle> {
    let transport = StreamableHttpTransport::new(format!("{}/mcp", server.uri()));
    let handle = transport.start().await.unwrap();
    let mut client = McpClient::connect(handle).await.unwrap();
    client
        .initialize(
            Implementation {
                name: "switchboard".to_string(),
                version: "1.0.0".to_string(),
            },
            ClientCapabilities::default(),
        )
        .await
        .unwrap();
    client
}

#[tokio::test]
async fn test_initialize_and_list_tools() {
    let server = MockServer::start().await;
    mount_handshake(&server).await;

    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "tools/list", "id": 2})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": {
                "tools": [
                    {
                        "name": "list-accounts",
                        "description": "List storage accounts",
                        "inputSchema": {"type": "object", "properties": {}}
                    }
                ]
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = connect(&server).await;
    assert_eq!(client.protocol_version(), Some("2025-03-26"));

    let tools = client.list_tools(None).await.unwrap();
    assert_eq!(tools.tools.len(), 1);
    assert_eq!(tools.tools[0].name, "list-accounts");
    assert_eq!(tools.tools[0].description, "List storage accounts");
}

#[tokio::test]
async fn test_call_tool_streams_result_over_sse() {
    let server = MockServer::start().await;
    mount_handshake(&server).await;

    let sse_body = concat!(
        "event: message\n",
        "data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"content\":[{\"type\":\"text\",\"text\":\"acct-1\"}]}}\n",
        "\n",
    );
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({
            "method": "tools/call",
            "params": {"name": "list-accounts", "arguments": {"subscription": "dev"}}
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = connect(&server).await;
    let result = client
        .call_tool("list-accounts", json!({"subscription": "dev"}))
        .await
        .unwrap();
    assert_eq!(result.text(), "acct-1");
}

#[tokio::test]
async fn test_http_failure_surfaces_as_error_not_hang() {
    let server = MockServer::start().await;
    mount_handshake(&server).await;

    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "tools/list"})))
        .respond_with(ResponseTemplate::new(500).set_body_string("provider exploded"))
        .mount(&server)
        .await;

    let client = connect(&server).await;
    let err = client.list_tools(None).await.unwrap_err();
    match err {
        Error::RpcError { message, .. } => assert!(message.contains("provider exploded")),
        other => panic!("unexpected error: {other}"),
    }
}

async fn received_cancellation(server: &MockServer, request_id: u64) -> bool {
    for _ in 0..40 {
        let requests = server.received_requests().await.unwrap_or_default();
        let seen = requests.iter().any(|request| {
            serde_json::from_slice::<serde_json::Value>(&request.body).is_ok_and(|body| {
                body["method"] == "notifications/cancelled"
                    && body["params"]["requestId"] == json!(request_id)
            })
        });
        if seen {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn test_cancelled_call_does_not_hold_up_the_next_one() {
    let server = MockServer::start().await;
    mount_handshake(&server).await;

    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "tools/call", "params": {"name": "slow"}})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(3))
                .set_body_json(json!({
                    "jsonrpc": "2.0",
                    "id": 2,
                    "result": {"content": [{"type": "text", "text": "late"}]}
                })),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "tools/call", "params": {"name": "fast"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "result": {"content": [{"type": "text", "text": "done"}]}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "notifications/cancelled"})))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let client = connect(&server).await;
    let abandoned =
        tokio::time::timeout(Duration::from_millis(200), client.call_tool("slow", json!({}))).await;
    assert!(abandoned.is_err());

    let started = Instant::now();
    let result = client.call_tool("fast", json!({})).await.unwrap();
    assert_eq!(result.text(), "done");
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "waited {:?} behind the cancelled call",
        started.elapsed()
    );

    assert!(received_cancellation(&server, 2).await);
}

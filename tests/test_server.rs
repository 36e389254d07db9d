//! Integration tests for the MCP server tools via duplex transport.
//!
//! Uses `tokio::io::duplex` to create an in-process transport, connects a test
//! client to the session server, and exercises the tool surface through the
//! MCP protocol.

use rmcp::model::*;
use rmcp::{ClientHandler, ServiceExt};
use serde_json::Value;
use shellcore_mcp::config::Config;
use shellcore_mcp::server::ShellSessionServer;

/// Minimal test client that implements ClientHandler with defaults.
#[derive(Default, Clone)]
struct TestClient;

impl ClientHandler for TestClient {}

/// Helper: start a server+client pair connected via duplex transport.
async fn setup() -> rmcp::service::RunningService<
    rmcp::service::RoleClient,
    impl rmcp::service::Service<rmcp::service::RoleClient>,
> {
    let (server_transport, client_transport) = tokio::io::duplex(65536);

    let server = ShellSessionServer::new(Config::default());
    tokio::spawn(async move {
        let service = server.serve(server_transport).await.unwrap();
        let _ = service.waiting().await;
    });

    let client = TestClient::default();
    client.serve(client_transport).await.unwrap()
}

/// Helper: call a tool and parse the JSON text content from the response.
async fn call_tool(
    client: &rmcp::service::RunningService<
        rmcp::service::RoleClient,
        impl rmcp::service::Service<rmcp::service::RoleClient>,
    >,
    name: &str,
    args: Value,
) -> Value {
    let params = CallToolRequestParams {
        meta: None,
        name: name.to_string().into(),
        arguments: Some(serde_json::from_value(args).unwrap()),
        task: None,
    };
    let request = ClientRequest::CallToolRequest(Request::new(params));
    let response = client.send_request(request).await.unwrap();

    let ServerResult::CallToolResult(result) = response else {
        panic!("expected CallToolResult, got {response:?}");
    };

    let text = result
        .content
        .iter()
        .filter_map(|c| match &c.raw {
            RawContent::Text(t) => Some(t.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("");

    serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text))
}

/// Helper: create a local session and return its server-generated id.
async fn create_session(
    client: &rmcp::service::RunningService<
        rmcp::service::RoleClient,
        impl rmcp::service::Service<rmcp::service::RoleClient>,
    >,
) -> String {
    let created = call_tool(client, "create_session", serde_json::json!({})).await;
    created["id"].as_str().unwrap().to_string()
}

// ---------------------------------------------------------------------------
// create_session / exec
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_create_session_and_exec_echo() {
    let client = setup().await;

    let created = call_tool(&client, "create_session", serde_json::json!({})).await;
    let id = created["id"].as_str().unwrap().to_string();
    assert!(id.starts_with("sess_"));
    assert_eq!(created["state"], "idle");

    let result = call_tool(
        &client,
        "exec",
        serde_json::json!({"id": id, "command": "echo hello_world"}),
    )
    .await;

    assert_eq!(result["exit_code"], 0);
    assert!(!result["timed_out"].as_bool().unwrap());
    assert!(result["stdout"].as_str().unwrap().contains("hello_world"));

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn test_create_session_ignores_caller_supplied_id() {
    let client = setup().await;

    let created = call_tool(
        &client,
        "create_session",
        serde_json::json!({"id": "caller-chosen-id"}),
    )
    .await;

    // The params schema no longer has an `id` field; an extra one is
    // ignored rather than honored, and the id is still server-generated.
    assert_ne!(created["id"], "caller-chosen-id");
    assert!(created["id"].as_str().unwrap().starts_with("sess_"));

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn test_exec_nonzero_exit_code() {
    let client = setup().await;
    let id = create_session(&client).await;

    let result = call_tool(
        &client,
        "exec",
        serde_json::json!({"id": id, "command": "exit 1"}),
    )
    .await;

    assert_eq!(result["exit_code"], 1);

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn test_exec_with_timeout() {
    let client = setup().await;
    let id = create_session(&client).await;

    let result = call_tool(
        &client,
        "exec",
        serde_json::json!({"id": id, "command": "sleep 30", "timeout_seconds": 1}),
    )
    .await;

    assert!(result["timed_out"].as_bool().unwrap());
    assert!(result["exit_code"] == 124 || result["exit_code"] == 137);

    client.cancel().await.unwrap();
}

// ---------------------------------------------------------------------------
// status / list_sessions / close_session
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_status_reports_idle_after_exec() {
    let client = setup().await;
    let id = create_session(&client).await;
    call_tool(
        &client,
        "exec",
        serde_json::json!({"id": id, "command": "echo done"}),
    )
    .await;

    let status = call_tool(&client, "status", serde_json::json!({"id": id})).await;
    assert_eq!(status["state"], "idle");

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn test_status_nonexistent_session_errors() {
    let client = setup().await;
    let result = call_tool(
        &client,
        "status",
        serde_json::json!({"id": "sess_does_not_exist"}),
    )
    .await;

    let text = result.as_str().unwrap_or("");
    assert!(
        text.contains("no session"),
        "expected 'no session' error, got: {result}"
    );

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn test_list_sessions_shows_entries() {
    let client = setup().await;
    let a = create_session(&client).await;
    let b = create_session(&client).await;

    let result = call_tool(&client, "list_sessions", serde_json::json!({})).await;
    let list = result.as_array().unwrap();
    assert_eq!(list.len(), 2);

    let ids: Vec<&str> = list.iter().filter_map(|e| e["id"].as_str()).collect();
    assert!(ids.contains(&a.as_str()));
    assert!(ids.contains(&b.as_str()));

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn test_list_sessions_detailed_shows_cwd() {
    let client = setup().await;
    let created = call_tool(
        &client,
        "create_session",
        serde_json::json!({"working_directory": "/tmp"}),
    )
    .await;
    let id = created["id"].as_str().unwrap().to_string();

    let result = call_tool(&client, "list_sessions_detailed", serde_json::json!({})).await;
    let list = result.as_array().unwrap();
    let entry = list.iter().find(|e| e["id"] == id).unwrap();
    assert_eq!(entry["is_remote"], false);

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn test_close_session_removes_it_from_list() {
    let client = setup().await;
    let id = create_session(&client).await;

    let result = call_tool(&client, "close_session", serde_json::json!({"id": id})).await;
    assert_eq!(result["closed"], true);

    let list = call_tool(&client, "list_sessions", serde_json::json!({})).await;
    assert!(list.as_array().unwrap().is_empty());

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn test_close_all_sessions_empties_the_list() {
    let client = setup().await;
    create_session(&client).await;
    create_session(&client).await;

    let result = call_tool(&client, "close_all_sessions", serde_json::json!({})).await;
    let closed = result.as_array().unwrap();
    assert_eq!(closed.len(), 2);
    assert!(closed.iter().all(|e| e["closed"] == true));

    let list = call_tool(&client, "list_sessions", serde_json::json!({})).await;
    assert!(list.as_array().unwrap().is_empty());

    client.cancel().await.unwrap();
}

// ---------------------------------------------------------------------------
// provide_input: password prompt flow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_provide_input_answers_password_prompt() {
    let client = setup().await;
    let id = create_session(&client).await;

    let result = call_tool(
        &client,
        "exec",
        serde_json::json!({
            "id": id,
            "command": "read -s -p 'Password: ' x; echo; echo \"got:$x\""
        }),
    )
    .await;
    assert_eq!(result["state"], "awaiting_input");

    let result = call_tool(
        &client,
        "provide_input",
        serde_json::json!({"id": id, "text": "hunter2"}),
    )
    .await;
    assert_eq!(result["state"], "idle");
    assert!(result["stdout"].as_str().unwrap().contains("got:hunter2"));

    client.cancel().await.unwrap();
}

// ---------------------------------------------------------------------------
// capture_env / capture_aliases
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_capture_env_reports_exported_var() {
    let client = setup().await;
    let id = create_session(&client).await;
    call_tool(
        &client,
        "exec",
        serde_json::json!({"id": id, "command": "export FOO=bar"}),
    )
    .await;

    let result = call_tool(&client, "capture_env", serde_json::json!({"id": id})).await;
    assert_eq!(result["vars"]["FOO"], "bar");

    client.cancel().await.unwrap();
}

// ---------------------------------------------------------------------------
// interrupt
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_interrupt_on_idle_session_errors() {
    let client = setup().await;
    let id = create_session(&client).await;

    let result = call_tool(&client, "interrupt", serde_json::json!({"id": id})).await;
    let text = result.as_str().unwrap_or("");
    assert!(!text.is_empty(), "expected an error message, got: {result}");

    client.cancel().await.unwrap();
}

// ---------------------------------------------------------------------------
// Security: dangerous commands blocked through the tool surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_exec_blocks_dangerous_commands() {
    let client = setup().await;
    let id = create_session(&client).await;

    let result = call_tool(
        &client,
        "exec",
        serde_json::json!({"id": id, "command": "rm -rf /"}),
    )
    .await;
    let text = result.as_str().unwrap_or("");
    assert!(
        text.contains("blocked"),
        "expected blocked error, got: {result}"
    );

    // Session should still work afterward.
    let result = call_tool(
        &client,
        "exec",
        serde_json::json!({"id": id, "command": "echo safe"}),
    )
    .await;
    assert_eq!(result["exit_code"], 0);

    client.cancel().await.unwrap();
}

//! End-to-end tests against mock MCP servers written in POSIX `sh`.
//!
//! Each mock reads one JSON-RPC line at a time and answers with `printf`,
//! extracting `id`, tool `name` and `uri` with parameter expansion only.

#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use mcp_hub::mcp_client::{
    ClientEvent, ClientOptions, ConnectionState, McpClient, McpConfigFile, McpError,
    McpServerEntry, MemoryStatusStore, ServerConfig, ServerStatus, ServerStatusStore,
};
use tokio::sync::broadcast;

// ─── Mock scripts ────────────────────────────────────────────────────────────

/// Fallback behaviour shared by every mock.
const DEFAULT_ARMS: &str = r#"
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"mock","version":"1.0"}}}\n' "$id" ;;
    *'"method":"initialized"'*)
      inited=1 ;;
    *'"method":"tools/list"'*)
      if [ -n "$inited" ]; then
        printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"Echo input","inputSchema":{"type":"object"}}]}}\n' "$id"
      else
        printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32002,"message":"not initialized"}}\n' "$id"
      fi ;;
    *'"method":"resources/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"Method not found"}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"%s"}]}}\n' "$id" "$tool" ;;
    *'"method":"resources/read"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"contents":[{"uri":"%s","text":"hello"}]}}\n' "$id" "$uri" ;;
"#;

/// A mock server whose `case` tries `custom_arms` before the defaults.
fn script(custom_arms: &str) -> String {
    format!(
        r#"inited=""
held=""
while IFS= read -r line; do
  rest=${{line#*\"id\":}}
  id=${{rest%%[!0-9]*}}
  rest=${{line#*\"name\":\"}}
  tool=${{rest%%\"*}}
  rest=${{line#*\"uri\":\"}}
  uri=${{rest%%\"*}}
  case "$line" in
{custom}
{defaults}
  esac
done
"#,
        custom = custom_arms,
        defaults = DEFAULT_ARMS,
    )
}

fn mock(name: &str, custom_arms: &str) -> ServerConfig {
    ServerConfig::new(name, "sh").with_args(["-c".to_string(), script(custom_arms)])
}

/// Never answers `tools/call`.
const SILENT_TOOLS: &str = r#"
    *'"method":"tools/call"'*) ;;
"#;

/// Holds the first `tools/call`, then answers the second before the first.
const REORDERING_TOOLS: &str = r#"
    *'"method":"tools/call"'*)
      if [ -z "$held" ]; then
        held=$id
        held_tool=$tool
      else
        printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"%s"}]}}\n' "$id" "$tool"
        printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"%s"}]}}\n' "$held" "$held_tool"
        held=""
      fi ;;
"#;

/// Special tool names with special behaviour.
const MISBEHAVING_TOOLS: &str = r#"
    *'"name":"crash"'*)
      echo "fatal: crash requested" >&2
      exit 1 ;;
    *'"name":"fail"'*)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32000,"message":"tool failed"}}\n' "$id" ;;
    *'"name":"notify"'*)
      printf '{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info","data":"working"}}\n'
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[]}}\n' "$id" ;;
"#;

const FAILING_INITIALIZE: &str = r#"
    *'"method":"initialize"'*)
      echo "bad config" >&2
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32603,"message":"cannot start"}}\n' "$id" ;;
"#;

/// Never answers `resources/list`.
const SILENT_RESOURCES: &str = r#"
    *'"method":"resources/list"'*) ;;
"#;

/// Answers `resources/list` with a result of the wrong shape.
const BOGUS_RESOURCES: &str = r#"
    *'"method":"resources/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"resources":"bogus"}}\n' "$id" ;;
"#;

fn options() -> ClientOptions {
    ClientOptions::default()
        .with_spawn_grace(Duration::from_millis(100))
        .with_shutdown_grace(Duration::from_secs(2))
        .with_request_timeout(Duration::from_secs(5))
        .with_handshake_timeout(Duration::from_secs(5))
}

fn text_of(result: &serde_json::Value) -> &str {
    result["content"][0]["text"].as_str().unwrap_or_default()
}

/// Wait for the first event matching `pred`, skipping others.
async fn wait_for_event<F>(rx: &mut broadcast::Receiver<ClientEvent>, pred: F) -> ClientEvent
where
    F: Fn(&ClientEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

// ─── Handshake ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_optional_resources_still_reach_ready() {
    let client = McpClient::new(options());
    client.connect_to_server(mock("x", "")).await.unwrap();

    assert_eq!(client.server_state("x"), Some(ConnectionState::Ready));
    let tools = client.get_server_tools("x");
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");
    assert!(client.get_server_resources("x").is_empty());

    let info = client.server_info("x").unwrap();
    assert_eq!(info.server_info.unwrap().name, "mock");
    assert_eq!(info.protocol_version.as_deref(), Some("2024-11-05"));

    client.cleanup().await;
}

#[tokio::test]
async fn test_silent_resources_list_does_not_fail_connect() {
    // Discovery outlives the handshake budget on purpose.
    let opts = options()
        .with_request_timeout(Duration::from_millis(600))
        .with_handshake_timeout(Duration::from_millis(600))
        .with_discovery_timeout(Duration::from_millis(900));
    let client = McpClient::new(opts);
    client
        .connect_to_server(mock("quiet", SILENT_RESOURCES))
        .await
        .unwrap();

    assert_eq!(client.server_state("quiet"), Some(ConnectionState::Ready));
    assert_eq!(client.get_server_tools("quiet").len(), 1);
    assert!(client.get_server_resources("quiet").is_empty());

    let result = client
        .call_tool("quiet", "echo", serde_json::json!({}))
        .await
        .unwrap();
    assert_eq!(text_of(&result), "echo");

    client.cleanup().await;
}

#[tokio::test]
async fn test_malformed_resources_list_leaves_resources_empty() {
    let client = McpClient::new(options());
    client
        .connect_to_server(mock("odd", BOGUS_RESOURCES))
        .await
        .unwrap();

    assert_eq!(client.server_state("odd"), Some(ConnectionState::Ready));
    assert_eq!(client.get_server_tools("odd").len(), 1);
    assert!(client.get_server_resources("odd").is_empty());

    client.cleanup().await;
}

#[tokio::test]
async fn test_initialize_error_is_handshake_failure() {
    let store = Arc::new(MemoryStatusStore::new());
    let client = McpClient::with_status_store(options(), store.clone());

    let err = client
        .connect_to_server(mock("broken", FAILING_INITIALIZE))
        .await
        .unwrap_err();
    match &err {
        McpError::HandshakeFailed { name, reason } => {
            assert_eq!(name, "broken");
            assert!(reason.contains("cannot start"), "{reason}");
        }
        other => panic!("expected HandshakeFailed, got {other:?}"),
    }
    assert!(!client.is_connected("broken"));
    assert!(client.connected_servers().is_empty());
    assert_eq!(store.get("broken").unwrap().unwrap().status, ServerStatus::Error);
}

#[tokio::test]
async fn test_early_exit_is_spawn_failure() {
    let client = McpClient::new(options());
    let config = ServerConfig::new("quitter", "sh").with_args(["-c", "exit 2"]);
    let err = client.connect_to_server(config).await.unwrap_err();
    assert!(matches!(err, McpError::SpawnFailed { .. }), "{err:?}");
    assert!(!client.is_connected("quitter"));
}

#[tokio::test]
async fn test_duplicate_connect_is_rejected() {
    let client = McpClient::new(options());
    client.connect_to_server(mock("dup", "")).await.unwrap();

    let err = client.connect_to_server(mock("dup", "")).await.unwrap_err();
    assert!(matches!(err, McpError::AlreadyConnected { .. }));

    // The original connection is untouched.
    let result = client
        .call_tool("dup", "echo", serde_json::json!({}))
        .await
        .unwrap();
    assert_eq!(text_of(&result), "echo");
    client.cleanup().await;
}

// ─── Requests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_call_tool_and_read_resource() {
    let client = McpClient::new(options());
    client
        .connect_to_server(mock("srv", MISBEHAVING_TOOLS))
        .await
        .unwrap();

    let result = client
        .call_tool("srv", "echo", serde_json::json!({"text": "hi"}))
        .await
        .unwrap();
    assert_eq!(text_of(&result), "echo");

    let resource = client.read_resource("srv", "file:///notes.txt").await.unwrap();
    assert_eq!(resource["contents"][0]["uri"], "file:///notes.txt");

    client.cleanup().await;
}

#[tokio::test]
async fn test_tool_error_leaves_server_connected() {
    let client = McpClient::new(options());
    client
        .connect_to_server(mock("srv", MISBEHAVING_TOOLS))
        .await
        .unwrap();

    let err = client
        .call_tool("srv", "fail", serde_json::json!({}))
        .await
        .unwrap_err();
    match err {
        McpError::ServerError { code, message, .. } => {
            assert_eq!(code, -32000);
            assert_eq!(message, "tool failed");
        }
        other => panic!("expected ServerError, got {other:?}"),
    }
    assert!(client.is_connected("srv"));
    assert!(client.call_tool("srv", "echo", serde_json::json!({})).await.is_ok());

    client.cleanup().await;
}

#[tokio::test]
async fn test_missing_server_is_not_connected() {
    let client = McpClient::new(options());
    let err = client
        .call_tool("missing-server", "t", serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(err.is_not_connected());
}

#[tokio::test]
async fn test_unanswered_call_times_out() {
    let client = McpClient::new(options());
    client.connect_to_server(mock("slow", SILENT_TOOLS)).await.unwrap();

    let start = Instant::now();
    let err = client
        .call_tool_with_timeout("slow", "echo", serde_json::json!({}), Duration::from_millis(50))
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    match &err {
        McpError::Timeout { method, timeout_ms } => {
            assert_eq!(method, "tools/call");
            assert_eq!(*timeout_ms, 50);
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");

    // The connection is still usable and the expired entry is gone.
    let conn = client.connection("slow").unwrap();
    assert_eq!(conn.pending_requests(), 0);
    assert_eq!(conn.state(), ConnectionState::Ready);

    client.cleanup().await;
}

#[tokio::test]
async fn test_out_of_order_replies_are_not_swapped() {
    let client = McpClient::new(options());
    client
        .connect_to_server(mock("reorder", REORDERING_TOOLS))
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        client.call_tool("reorder", "alpha", serde_json::json!({})),
        client.call_tool("reorder", "beta", serde_json::json!({})),
    );
    assert_eq!(text_of(&first.unwrap()), "alpha");
    assert_eq!(text_of(&second.unwrap()), "beta");

    client.cleanup().await;
}

#[tokio::test]
async fn test_server_notifications_are_published() {
    let client = McpClient::new(options());
    let mut events = client.subscribe();
    client
        .connect_to_server(mock("chatty", MISBEHAVING_TOOLS))
        .await
        .unwrap();

    client
        .call_tool("chatty", "notify", serde_json::json!({}))
        .await
        .unwrap();
    let event = wait_for_event(&mut events, |e| matches!(e, ClientEvent::Notification { .. })).await;
    match event {
        ClientEvent::Notification { server, method, params } => {
            assert_eq!(server, "chatty");
            assert_eq!(method, "notifications/message");
            assert_eq!(params.unwrap()["data"], "working");
        }
        other => panic!("unexpected event {other:?}"),
    }

    client.cleanup().await;
}

// ─── Teardown ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_disconnect_drains_pending_requests() {
    let client = McpClient::new(options());
    let mut events = client.subscribe();
    client.connect_to_server(mock("drain", SILENT_TOOLS)).await.unwrap();
    let conn = client.connection("drain").unwrap();

    let calls: Vec<_> = (0..2)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call_tool("drain", &format!("t{i}"), serde_json::json!({}))
                    .await
            })
        })
        .collect();

    let deadline = Instant::now() + Duration::from_secs(5);
    while conn.pending_requests() < 2 {
        assert!(Instant::now() < deadline, "requests never registered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    client.disconnect_from_server("drain").await;

    for call in calls {
        let err = call.await.unwrap().unwrap_err();
        assert!(err.is_connection_closed(), "{err:?}");
    }
    assert_eq!(conn.pending_requests(), 0);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert!(!client.is_connected("drain"));
    wait_for_event(&mut events, |e| matches!(e, ClientEvent::ServerDisconnected { .. })).await;

    // A request on the torn-down connection never reaches the wire.
    let err = conn.send_request("tools/list", None).await.unwrap_err();
    assert!(err.is_connection_closed());
}

#[tokio::test]
async fn test_unexpected_exit_removes_server() {
    let store = Arc::new(MemoryStatusStore::new());
    let client = McpClient::with_status_store(options(), store.clone());
    let mut events = client.subscribe();
    client
        .connect_to_server(mock("fragile", MISBEHAVING_TOOLS))
        .await
        .unwrap();
    let conn = client.connection("fragile").unwrap();

    let err = client
        .call_tool("fragile", "crash", serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(err.is_connection_closed(), "{err:?}");

    let event = wait_for_event(&mut events, |e| matches!(e, ClientEvent::ServerExited { .. })).await;
    match event {
        ClientEvent::ServerExited { server, reason } => {
            assert_eq!(server, "fragile");
            assert!(reason.contains("crash requested"), "{reason}");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(!client.is_connected("fragile"));
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    let record = store.get("fragile").unwrap().unwrap();
    assert_eq!(record.status, ServerStatus::Disconnected);
    assert!(record.last_error.is_some());

    // No auto-reconnect; a fresh connect works.
    client.connect_to_server(mock("fragile", "")).await.unwrap();
    client.cleanup().await;
}

#[tokio::test]
async fn test_oversized_line_drops_connection() {
    let flood = format!(
        r#"
    *'"name":"flood"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":"{}"}}\n' "$id" ;;
"#,
        "x".repeat(4096)
    );
    let client = McpClient::new(options().with_max_line_bytes(1024));
    let mut events = client.subscribe();
    client.connect_to_server(mock("flood", &flood)).await.unwrap();
    let conn = client.connection("flood").unwrap();

    let err = client
        .call_tool("flood", "flood", serde_json::json!({}))
        .await
        .unwrap_err();
    assert!(err.is_connection_closed(), "{err:?}");

    wait_for_event(&mut events, |e| matches!(e, ClientEvent::ServerExited { .. })).await;
    assert_eq!(conn.state(), ConnectionState::Error);
    assert!(!client.is_connected("flood"));
}

#[tokio::test]
async fn test_cleanup_disconnects_everything_once() {
    let client = McpClient::new(options());
    let mut events = client.subscribe();
    let mut config = McpConfigFile::default();
    for name in ["one", "two"] {
        let mut entry = McpServerEntry::new("sh");
        entry.args = vec!["-c".into(), script("")];
        config.add_server(name, entry).unwrap();
    }
    let mut off = McpServerEntry::new("sh");
    off.disabled = true;
    config.add_server("off", off).unwrap();

    let failures = client.connect_all(&config).await;
    assert!(failures.is_empty(), "{failures:?}");
    assert_eq!(client.connected_servers(), vec!["one", "two"]);
    assert_eq!(client.get_all_tools().len(), 2);

    client.cleanup().await;
    assert!(client.connected_servers().is_empty());
    for _ in 0..2 {
        wait_for_event(&mut events, |e| matches!(e, ClientEvent::ServerDisconnected { .. })).await;
    }

    client.cleanup().await;
    client.disconnect_from_server("one").await;
}

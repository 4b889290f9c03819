//! Hub routing, startup and reload against in-process servers

mod support;

use mcp_hub::config::DuplicatePolicy;
use mcp_hub::core::Hub;
use mcp_hub::HubError;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::{connection, start_hub, start_hub_with, FakeFactory, FakeServer};

#[tokio::test]
async fn test_partial_startup_keeps_healthy_connections() {
    let fs = FakeServer::new(&["read_file", "list_directory"]);
    let git = FakeServer::new(&["git_status"]);
    let factory = FakeFactory::new().with("fs", fs.clone()).with("git", git.clone());

    let hub = Hub::new(DuplicatePolicy::FirstWins);
    let count = hub
        .start(&[connection("fs"), connection("broken"), connection("git")], &factory)
        .await;

    assert_eq!(count, 3);
    assert_eq!(hub.connection_names(), vec!["fs", "git"]);
    assert_eq!(hub.invoke("git_status", json!({})).await.unwrap(), json!("git_status ok"));
    assert_eq!(git.calls(), 1);
}

#[tokio::test]
async fn test_disabled_connections_are_skipped() {
    let fs = FakeServer::new(&["read_file"]);
    let factory = FakeFactory::new().with("fs", fs);
    let mut disabled = connection("fs");
    disabled.disabled = true;

    let hub = Hub::new(DuplicatePolicy::FirstWins);
    assert_eq!(hub.start(&[disabled], &factory).await, 0);
    assert!(hub.connection_names().is_empty());
}

#[tokio::test]
async fn test_unknown_tool_fails_without_io() {
    let fs = FakeServer::new(&["read_file"]);
    let hub = start_hub(&[("fs", &fs)]).await;

    let err = hub.invoke("delete_everything", json!({})).await.unwrap_err();
    assert!(matches!(err, HubError::CapabilityNotFound(ref tool) if tool == "delete_everything"));
    assert_eq!(fs.calls(), 0);
}

#[tokio::test]
async fn test_first_registration_wins() {
    let a = FakeServer::new(&["search", "a_only"]);
    let b = FakeServer::new(&["search", "b_only"]);
    let hub = start_hub(&[("a", &a), ("b", &b)]).await;

    assert_eq!(hub.connection_names(), vec!["a", "b"]);
    let names: Vec<String> = hub.tools().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["search", "a_only", "b_only"]);

    hub.invoke("search", json!({"q": "x"})).await.unwrap();
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 0);
    assert_eq!(hub.find_owner("b_only").unwrap().name(), "b");
}

#[tokio::test]
async fn test_reject_policy_excludes_conflicting_connection() {
    let a = FakeServer::new(&["search"]);
    let b = FakeServer::new(&["search", "b_only"]);
    let hub = start_hub_with(DuplicatePolicy::Reject, &[("a", &a), ("b", &b)]).await;

    assert_eq!(hub.connection_names(), vec!["a"]);
    assert!(hub.find_owner("b_only").is_none());
}

#[tokio::test]
async fn test_register_rejects_duplicate_connection_name() {
    let a = FakeServer::new(&["one"]);
    let factory = FakeFactory::new().with("a", a);
    let hub = Hub::new(DuplicatePolicy::FirstWins);
    hub.start(&[connection("a")], &factory).await;

    let again = mcp_hub::core::Connection::start(&connection("a"), &factory).await.unwrap();
    assert!(matches!(
        hub.register(Arc::new(again)).await,
        Err(HubError::Config(_))
    ));
    assert_eq!(hub.connection_names().len(), 1);
}

#[tokio::test]
async fn test_results_are_flattened() {
    let fs = FakeServer::new(&["read_multiple_files"]).with_handler(|_, _| {
        Ok(json!({"content": [
            {"type": "text", "text": "first"},
            {"type": "text", "text": "second"}
        ]}))
    });
    let hub = start_hub(&[("fs", &fs)]).await;

    let result = hub.invoke("read_multiple_files", json!({})).await.unwrap();
    assert_eq!(result, json!("first\nsecond"));
}

#[tokio::test]
async fn test_remote_errors_surface_their_message() {
    let fs = FakeServer::new(&["read_file", "edit_file"]).with_handler(|tool, args| match tool {
        "read_file" => Err(format!("ENOENT: no such file {}", args["path"].as_str().unwrap_or(""))),
        _ => Ok(json!({"content": [{"type": "text", "text": "edit rejected"}], "isError": true})),
    });
    let hub = start_hub(&[("fs", &fs)]).await;

    let err = hub.invoke("read_file", json!({"path": "/missing"})).await.unwrap_err();
    assert!(matches!(err, HubError::Remote(ref msg) if msg == "ENOENT: no such file /missing"));

    let err = hub.invoke("edit_file", json!({})).await.unwrap_err();
    assert!(matches!(err, HubError::Remote(ref msg) if msg == "edit rejected"));
}

#[tokio::test]
async fn test_reload_picks_up_new_tools() {
    let fs = FakeServer::new(&["read_file"]);
    let hub = start_hub(&[("fs", &fs)]).await;
    assert!(hub.invoke("write_file", json!({})).await.is_err());

    fs.set_tools(&["read_file", "write_file"]);
    assert_eq!(hub.reload().await, 2);
    assert_eq!(hub.invoke("write_file", json!({})).await.unwrap(), json!("write_file ok"));
}

#[tokio::test]
async fn test_reload_drops_dead_connections() {
    let a = FakeServer::new(&["one"]);
    let b = FakeServer::new(&["two"]);
    let hub = start_hub(&[("a", &a), ("b", &b)]).await;

    b.kill();
    let conn = hub.connection("b").unwrap();
    let mut gone = false;
    for _ in 0..100 {
        if !conn.is_connected().await {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(gone);

    assert_eq!(hub.reload().await, 1);
    assert_eq!(hub.connection_names(), vec!["a"]);
}

#[tokio::test]
async fn test_process_death_fails_pending_call() {
    let slow = FakeServer::new(&["slow"]).with_delay(Duration::from_secs(5));
    let hub = start_hub(&[("slow", &slow)]).await;

    let call = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.invoke("slow", json!({})).await })
    };
    assert!(support::eventually(|| slow.calls() == 1).await);
    slow.kill();

    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_connection_lost(), "unexpected error: {}", err);
}

#[tokio::test]
async fn test_stop_clears_connections() {
    let a = FakeServer::new(&["one"]);
    let hub = start_hub(&[("a", &a)]).await;

    hub.stop().await;
    assert!(hub.connection_names().is_empty());
    assert_eq!(hub.tool_count(), 0);
}

//! Cache, retry and invalidation around hub calls

mod support;

use mcp_hub::cache::ResultCache;
use mcp_hub::config::{CacheConfig, RetryConfig, SafetyConfig};
use mcp_hub::recovery::{ErrorClassifier, ErrorKind, RetryManager};
use mcp_hub::server::{Dispatcher, SafetyGate};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use support::{start_hub, FakeServer};

fn cache() -> Option<Arc<ResultCache>> {
    Some(Arc::new(ResultCache::new(&CacheConfig::default())))
}

fn retry() -> Option<Arc<RetryManager>> {
    Some(Arc::new(RetryManager::new(
        ErrorClassifier::new(),
        &RetryConfig::default(),
    )))
}

#[tokio::test]
async fn test_cache_hit_skips_downstream() {
    let fs = FakeServer::new(&["read_file"]);
    let hub = start_hub(&[("fs", &fs)]).await;
    let dispatcher = Dispatcher::new(hub, cache(), None);
    let args = json!({"path": "/tmp/a.txt"});

    let first = dispatcher.execute("c:1", "read_file", args.clone()).await;
    assert_eq!(first.result.unwrap(), json!("read_file ok"));
    assert!(!first.cached);

    let second = dispatcher.execute("c:2", "read_file", args).await;
    assert_eq!(second.result.unwrap(), json!("read_file ok"));
    assert!(second.cached);
    assert_eq!(second.attempts, 0);
    assert_eq!(fs.calls(), 1);
}

#[tokio::test]
async fn test_failures_are_not_cached() {
    let fs = FakeServer::new(&["read_file"])
        .with_handler(|_, _| Err("EACCES: permission denied".to_string()));
    let hub = start_hub(&[("fs", &fs)]).await;
    let dispatcher = Dispatcher::new(hub, cache(), None);
    let args = json!({"path": "/root/secret"});

    for _ in 0..2 {
        let outcome = dispatcher.execute("c:1", "read_file", args.clone()).await;
        let error = outcome.result.unwrap_err();
        assert_eq!(error.kind, ErrorKind::PermissionDenied);
        assert!(!outcome.cached);
    }
    assert_eq!(fs.calls(), 2);
    assert!(dispatcher.cache().unwrap().is_empty());
}

#[tokio::test]
async fn test_write_invalidates_cached_reads() {
    let fs = FakeServer::new(&["read_file", "list_directory", "write_file"]);
    let hub = start_hub(&[("fs", &fs)]).await;
    let dispatcher = Dispatcher::new(hub, cache(), None);

    dispatcher.execute("c:1", "read_file", json!({"path": "/tmp/a.txt"})).await;
    dispatcher.execute("c:2", "list_directory", json!({"path": "/tmp"})).await;
    dispatcher.execute("c:3", "read_file", json!({"path": "/home/b.txt"})).await;
    assert_eq!(dispatcher.cache().unwrap().len(), 3);

    dispatcher.execute("c:4", "write_file", json!({"path": "/tmp/a.txt", "content": "x"})).await;
    assert_eq!(dispatcher.cache().unwrap().len(), 1);

    let reread = dispatcher.execute("c:5", "read_file", json!({"path": "/tmp/a.txt"})).await;
    assert!(!reread.cached);
    let untouched = dispatcher.execute("c:6", "read_file", json!({"path": "/home/b.txt"})).await;
    assert!(untouched.cached);
    assert_eq!(fs.calls(), 5);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let flaky = FakeServer::new(&["fetch"]).with_handler(move |_, _| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err("upstream timed out".to_string())
        } else {
            Ok(json!("payload"))
        }
    });
    let hub = start_hub(&[("net", &flaky)]).await;
    let dispatcher = Dispatcher::new(hub, None, retry());

    let outcome = dispatcher.execute("c:1", "fetch", json!({})).await;
    assert_eq!(outcome.result.unwrap(), json!("payload"));
    assert_eq!(outcome.attempts, 2);
    assert_eq!(flaky.calls(), 2);
    assert!(dispatcher.retry().unwrap().state("c:1").is_none());
}

#[tokio::test]
async fn test_unknown_tool_reloads_before_retry() {
    let fs = FakeServer::new(&["read_file"]);
    let hub = start_hub(&[("fs", &fs)]).await;
    let dispatcher = Dispatcher::new(hub.clone(), None, retry());

    // Becomes visible only after the hub re-lists tools
    fs.set_tools(&["read_file", "new_tool"]);

    let outcome = dispatcher.execute("c:1", "new_tool", json!({})).await;
    assert_eq!(outcome.result.unwrap(), json!("new_tool ok"));
    assert_eq!(outcome.attempts, 2);
    assert!(hub.find_owner("new_tool").is_some());
}

#[tokio::test]
async fn test_non_retryable_failure_is_classified_once() {
    let fs = FakeServer::new(&["read_file"])
        .with_handler(|_, _| Err("ENOENT: no such file or directory".to_string()));
    let hub = start_hub(&[("fs", &fs)]).await;
    let dispatcher = Dispatcher::new(hub, cache(), retry());

    let outcome = dispatcher.execute("c:1", "read_file", json!({"path": "/nope"})).await;
    let error = outcome.result.unwrap_err();
    assert_eq!(error.kind, ErrorKind::NotFound);
    assert!(!error.suggestion.is_empty());
    assert_eq!(outcome.attempts, 1);
    assert_eq!(fs.calls(), 1);
}

#[tokio::test]
async fn test_missing_tool_without_retry_manager() {
    let fs = FakeServer::new(&["read_file"]);
    let hub = start_hub(&[("fs", &fs)]).await;
    let dispatcher = Dispatcher::new(hub, None, None);

    let outcome = dispatcher.execute("c:1", "nope", json!({})).await;
    assert_eq!(outcome.result.unwrap_err().kind, ErrorKind::CapabilityNotFound);
    assert_eq!(fs.calls(), 0);
}

fn guarded(config: SafetyConfig) -> Arc<SafetyGate> {
    Arc::new(SafetyGate::new(&config))
}

#[tokio::test]
async fn test_blocked_path_never_reaches_downstream() {
    let fs = FakeServer::new(&["read_file", "list_directory"]);
    let hub = start_hub(&[("fs", &fs)]).await;
    let dispatcher = Dispatcher::new(hub, cache(), retry()).with_safety(guarded(SafetyConfig {
        allowed_paths: vec!["/srv/data".to_string()],
        ..SafetyConfig::default()
    }));

    let outcome = dispatcher.execute("c:1", "read_file", json!({"path": "/etc/passwd"})).await;
    let error = outcome.result.unwrap_err();
    assert_eq!(error.kind, ErrorKind::PermissionDenied);
    assert_eq!(
        error.message,
        "operation not permitted: path outside allowed directories: /etc/passwd"
    );
    assert!(!error.recoverable);
    assert_eq!(outcome.attempts, 0);
    assert_eq!(fs.calls(), 0);
    assert!(dispatcher.retry().unwrap().state("c:1").is_none());

    let allowed = dispatcher
        .execute("c:2", "list_directory", json!({"path": "/srv/data/logs"}))
        .await;
    assert_eq!(allowed.result.unwrap(), json!("list_directory ok"));
    assert_eq!(allowed.attempts, 1);
    assert_eq!(fs.calls(), 1);
}

#[tokio::test]
async fn test_blocked_command_is_refused() {
    let shell = FakeServer::new(&["run_command"]);
    let hub = start_hub(&[("shell", &shell)]).await;
    let dispatcher = Dispatcher::new(hub, None, None).with_safety(guarded(SafetyConfig {
        blocked_commands: vec!["rm -rf".to_string()],
        allowed_commands: vec!["ls".to_string(), "cat".to_string()],
        ..SafetyConfig::default()
    }));

    let blocked = dispatcher.execute("c:1", "run_command", json!({"command": "rm -rf /"})).await;
    assert_eq!(blocked.result.unwrap_err().kind, ErrorKind::PermissionDenied);
    let unlisted = dispatcher.execute("c:2", "run_command", json!({"command": "curl x"})).await;
    assert!(unlisted.result.unwrap_err().message.contains("allow-list"));
    assert_eq!(shell.calls(), 0);

    let ok = dispatcher.execute("c:3", "run_command", json!({"command": "ls -la"})).await;
    assert_eq!(ok.result.unwrap(), json!("run_command ok"));
    assert_eq!(shell.calls(), 1);
}

#[tokio::test]
async fn test_dangerous_operation_waits_for_approval() {
    let fs = FakeServer::new(&["write_file"]);
    let hub = start_hub(&[("fs", &fs)]).await;
    let gate = guarded(SafetyConfig {
        require_confirmation: true,
        dangerous_operations: vec!["write_file".to_string()],
        ..SafetyConfig::default()
    });
    let mut requests = gate.subscribe();
    let dispatcher = Arc::new(Dispatcher::new(hub, None, None).with_safety(gate.clone()));

    let call = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .execute("c:1", "write_file", json!({"path": "/tmp/a", "content": "x"}))
                .await
        })
    };
    let request = requests.recv().await.unwrap();
    assert_eq!(request.operation, "write_file");
    assert_eq!(fs.calls(), 0);

    assert!(gate.resolve(&request.id, true));
    assert_eq!(call.await.unwrap().result.unwrap(), json!("write_file ok"));
    assert_eq!(fs.calls(), 1);

    let call = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.execute("c:2", "write_file", json!({})).await })
    };
    let request = requests.recv().await.unwrap();
    assert!(gate.resolve(&request.id, false));
    let error = call.await.unwrap().result.unwrap_err();
    assert_eq!(error.kind, ErrorKind::PermissionDenied);
    assert_eq!(fs.calls(), 1);
}

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use capsat_daemon::config::WatcherConfig;
use capsat_daemon::startup::preflight;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone)]
struct SourceServer {
    token: Arc<String>,
    sources: Arc<Vec<String>>,
}

async fn record_sources_handler(
    State(server): State<SourceServer>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    let expected = format!("Token {}", server.token);
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Invalid token."})),
        );
    }

    let results: Vec<Value> = server
        .sources
        .iter()
        .enumerate()
        .map(|(id, suffix)| json!({"id": id + 1, "suffix": suffix}))
        .collect();
    (
        StatusCode::OK,
        Json(json!({"count": results.len(), "results": results})),
    )
}

async fn spawn_server(token: &str, sources: &[&str]) -> SocketAddr {
    let server = SourceServer {
        token: Arc::new(token.to_string()),
        sources: Arc::new(sources.iter().map(|s| s.to_string()).collect()),
    };

    let app = Router::new()
        .route("/api/objects/record_sources/", get(record_sources_handler))
        .with_state(server);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

fn config_for(addr: SocketAddr, token: &str, expected: &[&str]) -> WatcherConfig {
    WatcherConfig {
        token: token.to_string(),
        target_base_url: format!("http://{}", addr),
        request_timeout_secs: 5,
        expected_sources: expected.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_preflight_accepts_when_all_sources_present() {
    let addr = spawn_server("abc123", &["sync", "host_id", "radio"]).await;
    let config = config_for(addr, "abc123", &["radio", "sync"]);

    let sources = preflight(&config).await.unwrap();
    assert_eq!(
        sources,
        vec!["sync".to_string(), "host_id".to_string(), "radio".to_string()]
    );
}

#[tokio::test]
async fn test_preflight_without_expectations_only_checks_reachability() {
    let addr = spawn_server("abc123", &[]).await;
    let config = config_for(addr, "abc123", &[]);

    assert!(preflight(&config).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_preflight_names_missing_sources() {
    let addr = spawn_server("abc123", &["sync"]).await;
    let config = config_for(addr, "abc123", &["sync", "host_id", "radio"]);

    let err = preflight(&config).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("missing record sources"), "{}", message);
    assert!(message.contains("host_id"), "{}", message);
    assert!(message.contains("radio"), "{}", message);
    assert!(!message.contains("sync,"), "{}", message);
}

#[tokio::test]
async fn test_preflight_rejected_token_fails() {
    let addr = spawn_server("abc123", &["sync"]).await;
    let config = config_for(addr, "wrong-token", &["sync"]);

    let err = preflight(&config).await.unwrap_err();
    assert!(err.to_string().contains("401"), "{}", err);
}

#[tokio::test]
async fn test_preflight_accepts_prefixed_token() {
    let addr = spawn_server("abc123", &["sync"]).await;
    let config = config_for(addr, "Token abc123", &["sync"]);

    assert!(preflight(&config).await.is_ok());
}

//! HttpExecutor against a local axum server

use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use bns_worker::{
    DispatchOutcome, DispatchRecord, FetchError, HttpExecutor, HttpExecutorConfig, TaskExecutor,
};

/// Serve `router` on an ephemeral port and return its base URL
async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn test_router() -> Router {
    Router::new()
        .route("/api/address", get(|| async { "1 Main Street" }))
        .route("/missing", get(|| async { (StatusCode::NOT_FOUND, "no such thing") }))
        .route(
            "/broken",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        )
        .route(
            "/agent",
            get(|headers: HeaderMap| async move {
                headers
                    .get("user-agent")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        )
}

#[tokio::test]
async fn test_fetch_ok() {
    let base = serve(test_router()).await;
    let executor = HttpExecutor::new(HttpExecutorConfig::default()).unwrap();

    let response = executor.fetch(&format!("{base}/api/address")).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"1 Main Street");
}

#[tokio::test]
async fn test_error_statuses_are_responses() {
    let base = serve(test_router()).await;
    let executor = HttpExecutor::new(HttpExecutorConfig::default()).unwrap();

    let missing = executor.fetch(&format!("{base}/missing")).await.unwrap();
    assert_eq!(missing.status, 404);

    let record = DispatchRecord::capture(&executor, &format!("{base}/broken"), 2).await;
    assert!(!record.is_success());
    assert_eq!(
        record.outcome,
        DispatchOutcome::Response {
            status_code: 500,
            body_preview: "bo...".to_string(),
        }
    );
}

#[tokio::test]
async fn test_user_agent_is_sent() {
    let base = serve(test_router()).await;
    let executor =
        HttpExecutor::new(HttpExecutorConfig::new().with_user_agent("bns-test/0.1")).unwrap();

    let response = executor.fetch(&format!("{base}/agent")).await.unwrap();
    assert_eq!(response.body, b"bns-test/0.1");
}

#[tokio::test]
async fn test_timeout_is_a_request_error() {
    let base = serve(test_router()).await;
    let executor = HttpExecutor::new(
        HttpExecutorConfig::new().with_timeout(Duration::from_millis(100)),
    )
    .unwrap();

    let err = executor.fetch(&format!("{base}/slow")).await.unwrap_err();
    match err {
        FetchError::Request(e) => assert!(e.is_timeout()),
        other => panic!("expected request error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_connection_refused_is_recorded() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let executor = HttpExecutor::new(HttpExecutorConfig::default()).unwrap();
    let record = DispatchRecord::capture(&executor, &format!("http://{addr}/"), 64).await;

    assert!(!record.is_success());
    assert!(matches!(record.outcome, DispatchOutcome::Failed { .. }));
}

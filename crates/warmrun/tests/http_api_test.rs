//! HTTP API tests driven through the router with `oneshot`.

mod common;

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use common::Harness;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use warmrun::{
    function::Language,
    function_store::FunctionStore,
    http_server::{AppState, router},
};

fn app(harness: &Harness) -> Router {
    router(AppState::new(
        Arc::new(FunctionStore::in_memory()),
        harness.dispatcher.clone(),
    ))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn create(app: &Router, body: Value) -> i64 {
    let (status, body) = send(app, "POST", "/functions", Some(&body.to_string())).await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    body["function"]["id"].as_i64().unwrap()
}

#[tokio::test]
async fn test_health() {
    let harness = Harness::new();
    let (status, body) = send(&app(&harness), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"healthy": true}));
}

#[tokio::test]
async fn test_function_crud() {
    let harness = Harness::new();
    let app = app(&harness);

    let (status, body) = send(
        &app,
        "POST",
        "/functions",
        Some(r#"{"name": "add", "route": "/add", "language": "Python"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(
        body,
        json!({
            "msg": "Function created",
            "function": {"id": 1, "name": "add", "route": "/add", "language": "python", "timeout": 5},
        })
    );

    let (status, body) = send(&app, "GET", "/functions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, body) = send(
        &app,
        "PUT",
        "/functions/1",
        Some(r#"{"name": "add", "route": "/sum", "language": "javascript", "timeout": 9}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["msg"], json!("Function updated"));
    assert_eq!(body["function"]["route"], json!("/sum"));
    assert_eq!(body["function"]["timeout"], json!(9));

    let (status, body) = send(&app, "GET", "/functions/1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["language"], json!("javascript"));

    let (status, body) = send(&app, "DELETE", "/functions/1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"msg": "Function with ID 1 deleted."}));

    let (status, body) = send(&app, "GET", "/functions/1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({"error": "Function not found"}));

    let (status, _) = send(&app, "DELETE", "/functions/1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_function_rejected() {
    let harness = Harness::new();
    let app = app(&harness);

    for body in [
        r#"{"name": "f", "route": "/f", "language": "cobol"}"#,
        r#"{"name": "", "route": "/f", "language": "python"}"#,
        r#"{"name": "f", "route": "/f", "language": "python", "timeout": 0}"#,
        r#"{"name": "f", "route": "/f", "language": "python", "timeout": 86401}"#,
        r#"{"name": "f", "route": "/f", "language": "python", "timeout": 18446744073709551615}"#,
        r#"not json"#,
    ] {
        let (status, response) = send(&app, "POST", "/functions", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);
        assert!(response["error"].is_string());
    }
    let (_, body) = send(&app, "GET", "/functions", None).await;
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_invoke() {
    let harness = Harness::new();
    let app = app(&harness);
    let id = create(
        &app,
        json!({"name": "echo", "route": "/echo", "language": "python", "timeout": 2}),
    )
    .await;
    harness.add_function(id, Language::Python);

    let uri = format!("/functions/{}/invoke", id);
    let (status, body) = send(&app, "POST", &uri, Some(r#"{"x": 1}"#)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"x": 1}));

    // An empty body falls back to the warm-up marker.
    let (status, body) = send(&app, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"_warmup": true}));

    let (status, body) = send(&app, "GET", "/pool", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stats"]["cold_starts"], json!(1));
    assert_eq!(body["stats"]["warm_hits"], json!(1));
    assert_eq!(body["instances"][0]["state"], json!("ready"));
    assert_eq!(body["instances"][0]["invocations"], json!(2));
}

#[tokio::test]
async fn test_invoke_malformed_payload_starts_nothing() {
    let harness = Harness::new();
    let app = app(&harness);
    let id = create(
        &app,
        json!({"name": "echo", "route": "/echo", "language": "python"}),
    )
    .await;
    harness.add_function(id, Language::Python);

    let (status, body) = send(
        &app,
        "POST",
        &format!("/functions/{}/invoke", id),
        Some("{\"x\": "),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], json!("invalid_request_payload"));
    assert_eq!(harness.driver.starts(), 0);
}

#[tokio::test]
async fn test_invoke_unknown_function() {
    let harness = Harness::new();
    let (status, body) = send(&app(&harness), "POST", "/functions/42/invoke", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], json!("function_not_found"));
}

#[tokio::test]
async fn test_invoke_without_code() {
    let harness = Harness::new();
    let app = app(&harness);
    let id = create(
        &app,
        json!({"name": "f", "route": "/f", "language": "javascript"}),
    )
    .await;

    let (status, body) = send(&app, "POST", &format!("/functions/{}/invoke", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], json!("function_code_not_found"));
}

#[tokio::test]
async fn test_warmup() {
    let harness = Harness::new();
    let app = app(&harness);
    let id = create(
        &app,
        json!({"name": "f", "route": "/f", "language": "javascript"}),
    )
    .await;
    harness.add_function(id, Language::Javascript);

    let (status, body) = send(&app, "POST", &format!("/functions/{}/warmup", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"message": "Warm-up attempted", "result": {"_warmup": true}})
    );

    let (status, body) = send(&app, "POST", "/functions/99/warmup", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], json!("function_not_found"));
}

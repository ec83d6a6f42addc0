use axum::http::StatusCode;
use axum::Router;
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

use deploybot_core::webhook::sign;
use deploybot_server::{build_router, AppState, ControllerConfig};

const SECRET: &str = "integration-secret";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Bootstrap a controller over a temp store with a two-host binding for
/// `myorg/web` on `main`.
fn test_state(dir: &TempDir) -> AppState {
    let bindings_path = dir.path().join("apps.yaml");
    std::fs::write(
        &bindings_path,
        "apps:\n  - repository: myorg/web\n    hosts: [web-01, web-02]\n    deploy_on_push: true\n    branches: [main]\n",
    )
    .unwrap();
    let config = ControllerConfig {
        db_path: dir.path().join("deploybot.redb"),
        bindings_path,
        webhook_secret: Some(SECRET.to_string()),
        ..ControllerConfig::default()
    };
    AppState::new(config).unwrap()
}

/// Send a GET request via `oneshot` and return (status, parsed JSON body).
async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Send a POST request with a JSON body via `oneshot`.
async fn post_json(
    app: Router,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Send a raw POST with explicit headers (webhook and log-ingest bodies).
async fn post_raw(
    app: Router,
    uri: &str,
    headers: &[(&str, &str)],
    body: Vec<u8>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = axum::http::Request::builder().method("POST").uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let response = app
        .oneshot(builder.body(axum::body::Body::from(body)).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn delete(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

fn push_body(repo: &str, git_ref: &str, after: &str) -> Vec<u8> {
    serde_json::json!({
        "ref": git_ref,
        "after": after,
        "repository": { "full_name": repo, "clone_url": format!("https://github.com/{repo}.git") },
        "head_commit": { "id": after, "message": "ship it" },
    })
    .to_string()
    .into_bytes()
}

/// Register an agent and return its id.
async fn register_agent(app: &Router, hostname: &str) -> String {
    let (status, json) = post_json(
        app.clone(),
        "/v1/agents/register",
        serde_json::json!({ "hostname": hostname, "capabilities": { "docker": true } }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    json["agent_id"].as_str().unwrap().to_string()
}

/// Heartbeat once and return the embedded job (if any).
async fn heartbeat(app: &Router, agent_id: &str) -> serde_json::Value {
    let (status, json) = post_json(
        app.clone(),
        &format!("/v1/agents/{agent_id}/heartbeat"),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["acknowledged"], true);
    json["job"].clone()
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_ok() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(&dir));
    let (status, json) = get(app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

// ---------------------------------------------------------------------------
// Webhook ingress
// ---------------------------------------------------------------------------

#[tokio::test]
async fn webhook_fans_out_and_repeat_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(&dir));

    let body = push_body("myorg/web", "refs/heads/main", "abc123");
    let signature = sign(SECRET, &body);
    let headers = [
        ("x-hub-signature-256", signature.as_str()),
        ("x-github-event", "push"),
        ("content-type", "application/json"),
    ];

    let (status, json) = post_raw(app.clone(), "/v1/webhooks/github", &headers, body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["jobs_created"].as_array().unwrap().len(), 2);

    // The same push again, seconds later: no new jobs.
    let (status, json) = post_raw(app.clone(), "/v1/webhooks/github", &headers, body).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["jobs_created"].as_array().unwrap().is_empty());

    let (_, json) = get(app, "/v1/jobs").await;
    let jobs = json["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j["status"] == "pending"));
}

#[tokio::test]
async fn webhook_tampered_body_is_rejected_without_side_effects() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(&dir));

    let signature = sign(SECRET, &push_body("myorg/web", "refs/heads/main", "abc123"));
    let tampered = push_body("myorg/web", "refs/heads/main", "evil999");
    let headers = [
        ("x-hub-signature-256", signature.as_str()),
        ("x-github-event", "push"),
    ];

    let (status, _) = post_raw(app.clone(), "/v1/webhooks/github", &headers, tampered).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, json) = get(app, "/v1/jobs").await;
    assert!(json["jobs"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn webhook_non_push_event_is_acknowledged() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(&dir));

    let body = push_body("myorg/web", "refs/heads/main", "abc123");
    let signature = sign(SECRET, &body);
    let headers = [
        ("x-hub-signature-256", signature.as_str()),
        ("x-github-event", "ping"),
    ];
    let (status, json) = post_raw(app, "/v1/webhooks/github", &headers, body).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["jobs_created"].as_array().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Direct job API
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_get_and_duplicate_conflict() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(&dir));

    let create = serde_json::json!({
        "repo": "myorg/api", "ref": "def456", "host": "api-01",
        "payload": { "image": "myorg/api:def456" },
    });
    let (status, json) = post_json(app.clone(), "/v1/jobs", create.clone()).await;
    assert_eq!(status, StatusCode::CREATED);
    let job_id = json["job"]["id"].as_str().unwrap().to_string();
    assert_eq!(json["job"]["status"], "pending");

    let (status, json) = get(app.clone(), &format!("/v1/jobs/{job_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["job"]["ref"], "def456");
    assert_eq!(json["job"]["payload"]["image"], "myorg/api:def456");

    // Same (repo, ref, host) while the first is still pending: 409.
    let (status, _) = post_json(app, "/v1/jobs", create).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn missing_job_is_404() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(&dir));
    let (status, _) = get(
        app.clone(),
        "/v1/jobs/00000000-0000-4000-8000-000000000000",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = delete(app, "/v1/jobs/00000000-0000-4000-8000-000000000000").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Heartbeat dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn heartbeat_pulls_exactly_one_job_fifo() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(&dir));
    let agent = register_agent(&app, "web-01").await;

    // No work yet.
    assert!(heartbeat(&app, &agent).await.is_null());

    let (status, first) = post_json(
        app.clone(),
        "/v1/jobs",
        serde_json::json!({ "repo": "myorg/web", "ref": "aaa111", "host": "web-01" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    post_json(
        app.clone(),
        "/v1/jobs",
        serde_json::json!({ "repo": "myorg/web", "ref": "bbb222", "host": "web-01" }),
    )
    .await;

    let offered = heartbeat(&app, &agent).await;
    assert_eq!(offered["id"], first["job"]["id"]);
    assert_eq!(offered["ref"], "aaa111");

    let offered = heartbeat(&app, &agent).await;
    assert_eq!(offered["ref"], "bbb222");
    assert!(heartbeat(&app, &agent).await.is_null());
}

#[tokio::test]
async fn duplicate_agents_on_one_host_share_the_queue() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(&dir));
    let a1 = register_agent(&app, "web-01").await;
    let a2 = register_agent(&app, "web-01").await;

    post_json(
        app.clone(),
        "/v1/jobs",
        serde_json::json!({ "repo": "myorg/web", "ref": "ccc333", "host": "web-01" }),
    )
    .await;

    // One job, two agents: exactly one heartbeat carries it.
    let j1 = heartbeat(&app, &a1).await;
    let j2 = heartbeat(&app, &a2).await;
    assert!(j1.is_null() != j2.is_null());
}

#[tokio::test]
async fn heartbeat_unknown_agent_is_404() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(&dir));
    let (status, _) = post_json(
        app,
        "/v1/agents/00000000-0000-4000-8000-000000000000/heartbeat",
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Ack and cancel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ack_success_terminalizes_job() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(&dir));
    let agent = register_agent(&app, "web-01").await;
    post_json(
        app.clone(),
        "/v1/jobs",
        serde_json::json!({ "repo": "myorg/web", "ref": "ddd444", "host": "web-01" }),
    )
    .await;
    let job = heartbeat(&app, &agent).await;
    let job_id = job["id"].as_str().unwrap();

    let (status, json) = post_json(
        app.clone(),
        &format!("/v1/agents/{agent}/jobs/{job_id}"),
        serde_json::json!({ "status": "succeeded", "detail": { "deployed": "ddd444" } }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "success");
    assert_eq!(json["already_terminal"], false);

    let (_, json) = get(app, &format!("/v1/jobs/{job_id}")).await;
    assert_eq!(json["job"]["status"], "success");
    assert_eq!(json["job"]["result"]["deployed"], "ddd444");
}

#[tokio::test]
async fn ack_by_wrong_agent_is_conflict() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(&dir));
    let owner = register_agent(&app, "web-01").await;
    let other = register_agent(&app, "web-01").await;
    post_json(
        app.clone(),
        "/v1/jobs",
        serde_json::json!({ "repo": "myorg/web", "ref": "eee555", "host": "web-01" }),
    )
    .await;
    let job = heartbeat(&app, &owner).await;
    let job_id = job["id"].as_str().unwrap();

    let (status, _) = post_json(
        app,
        &format!("/v1/agents/{other}/jobs/{job_id}"),
        serde_json::json!({ "status": "succeeded" }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn cancel_running_then_late_ack_is_noop() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(&dir));
    let agent = register_agent(&app, "web-01").await;
    post_json(
        app.clone(),
        "/v1/jobs",
        serde_json::json!({ "repo": "myorg/web", "ref": "fff666", "host": "web-01" }),
    )
    .await;
    let job = heartbeat(&app, &agent).await;
    let job_id = job["id"].as_str().unwrap();

    // Admin cancels while the worker is still deploying.
    let (status, json) = delete(app.clone(), &format!("/v1/jobs/{job_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["job"]["status"], "cancelled");

    // The worker finishes anyway and acks success: accepted as a no-op.
    let (status, json) = post_json(
        app.clone(),
        &format!("/v1/agents/{agent}/jobs/{job_id}"),
        serde_json::json!({ "status": "succeeded" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["already_terminal"], true);
    assert_eq!(json["status"], "cancelled");

    let (_, json) = get(app.clone(), &format!("/v1/jobs/{job_id}")).await;
    assert_eq!(json["job"]["status"], "cancelled");

    // Cancelling again is a conflict: terminal states are absorbing.
    let (status, _) = delete(app, &format!("/v1/jobs/{job_id}")).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn ack_unknown_status_is_bad_request() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(&dir));
    let agent = register_agent(&app, "web-01").await;
    let (status, _) = post_json(
        app,
        &format!("/v1/agents/{agent}/jobs/00000000-0000-4000-8000-000000000000"),
        serde_json::json!({ "status": "exploded" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn log_ingest_then_terminal_stream_replays_and_closes() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(&dir));
    let agent = register_agent(&app, "web-01").await;
    post_json(
        app.clone(),
        "/v1/jobs",
        serde_json::json!({ "repo": "myorg/web", "ref": "aaa777", "host": "web-01" }),
    )
    .await;
    let job = heartbeat(&app, &agent).await;
    let job_id = job["id"].as_str().unwrap().to_string();

    let ndjson = (1..=3)
        .map(|seq| {
            serde_json::json!({ "sequence": seq, "stream": "stdout", "data": format!("step {seq}") })
                .to_string()
        })
        .collect::<Vec<_>>()
        .join("\n");
    let (status, json) = post_raw(
        app.clone(),
        &format!("/v1/agents/{agent}/jobs/{job_id}/logs"),
        &[("content-type", "application/x-ndjson")],
        ndjson.into_bytes(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["received"], 3);

    // Terminalize, then subscribe from sequence 2: the stream replays the
    // persisted tail and ends with the close sentinel.
    post_json(
        app.clone(),
        &format!("/v1/agents/{agent}/jobs/{job_id}"),
        serde_json::json!({ "status": "succeeded" }),
    )
    .await;

    let req = axum::http::Request::builder()
        .uri(format!("/v1/jobs/{job_id}/logs/stream?from_sequence=2"))
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("event: chunk"));
    assert!(text.contains("step 2"));
    assert!(text.contains("step 3"));
    assert!(!text.contains("step 1"));
    assert!(text.contains("event: close"));
}

#[tokio::test]
async fn log_stream_for_missing_job_is_404() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(&dir));
    let (status, _) = get(
        app,
        "/v1/jobs/00000000-0000-4000-8000-000000000000/logs/stream",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Hosts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hosts_lists_newest_registration_per_hostname() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(&dir));
    register_agent(&app, "web-01").await;
    let newer = register_agent(&app, "web-01").await;
    register_agent(&app, "web-02").await;

    let (status, json) = get(app, "/v1/hosts").await;
    assert_eq!(status, StatusCode::OK);
    let hosts = json["hosts"].as_array().unwrap();
    assert_eq!(hosts.len(), 2);
    let web01 = hosts.iter().find(|h| h["hostname"] == "web-01").unwrap();
    assert_eq!(web01["agent_id"], serde_json::Value::String(newer));
    assert_eq!(web01["status"], "online");
}

// ---------------------------------------------------------------------------
// Chat persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn chat_session_crud() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(&dir));

    let (status, session) = post_json(
        app.clone(),
        "/v1/chat/sessions",
        serde_json::json!({ "name": "deploy help" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let session_id = session["id"].as_str().unwrap().to_string();

    let (status, message) = post_json(
        app.clone(),
        &format!("/v1/chat/sessions/{session_id}/messages"),
        serde_json::json!({ "role": "user", "content": "deploy myorg/web to web-01" }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(message["role"], "user");

    let (status, json) = get(
        app.clone(),
        &format!("/v1/chat/sessions/{session_id}/messages"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["messages"].as_array().unwrap().len(), 1);

    let (status, json) = post_json(
        app.clone(),
        &format!("/v1/chat/sessions/{session_id}/archive"),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["archived"], true);
    assert!(json["archived_at"].is_string());

    // Archived sessions drop out of the default listing.
    let (_, json) = get(app.clone(), "/v1/chat/sessions").await;
    assert!(json["sessions"].as_array().unwrap().is_empty());

    // Unarchive restores it and clears the archive timestamp.
    let (status, json) = post_json(
        app.clone(),
        &format!("/v1/chat/sessions/{session_id}/unarchive"),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["archived"], false);
    assert!(json["archived_at"].is_null());
    let (_, json) = get(app.clone(), "/v1/chat/sessions").await;
    assert_eq!(json["sessions"].as_array().unwrap().len(), 1);

    let (status, _) = delete(app.clone(), &format!("/v1/chat/sessions/{session_id}")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = get(app, &format!("/v1/chat/sessions/{session_id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn chat_session_listing_is_scoped_by_user() {
    let dir = TempDir::new().unwrap();
    let app = build_router(test_state(&dir));

    post_json(
        app.clone(),
        "/v1/chat/sessions",
        serde_json::json!({ "user_id": "alice", "name": "rollout" }),
    )
    .await;
    post_json(
        app.clone(),
        "/v1/chat/sessions",
        serde_json::json!({ "name": "default user session" }),
    )
    .await;

    let (status, json) = get(app.clone(), "/v1/chat/sessions?user_id=alice").await;
    assert_eq!(status, StatusCode::OK);
    let sessions = json["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["user_id"], "alice");

    // No user_id queries the default user.
    let (_, json) = get(app.clone(), "/v1/chat/sessions").await;
    let sessions = json["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["user_id"], "default");

    let (_, json) = get(app, "/v1/chat/sessions?user_id=carol").await;
    assert!(json["sessions"].as_array().unwrap().is_empty());
}

// ABOUTME: End-to-end tests of the HTTP surface through the router
// ABOUTME: Auth, volume files, project staging, sandbox runs and instance management

mod common;

use async_trait::async_trait;
use axum::http::{header, Method, Request, StatusCode};
use common::{
    delete, get, gzip_tar, post_empty, post_json, post_multipart, zip_file, TestApp,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use skiff_api::{CompletionClient, CompletionError};
use std::sync::Arc;

#[tokio::test]
async fn test_health_needs_no_token() {
    let app = TestApp::new().await;
    let (status, body) = app.send_json(get("/api/health", None)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["provider"], "stub");
    assert_eq!(body["provider_available"], true);
}

#[tokio::test]
async fn test_sandbox_routes_require_token() {
    let app = TestApp::new().await;

    for request in [
        post_json("/sandbox/write", None, json!({"filename": "a.txt", "content": "x"})),
        get("/sandbox/read?filename=a.txt", None),
        post_empty("/sandbox/project/run", None),
        get("/sandbox/instances", None),
    ] {
        let (status, body) = app.send_json(request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");
    }
}

#[tokio::test]
async fn test_forged_token_rejected() {
    let app = TestApp::new().await;
    let request = Request::get("/sandbox/instances")
        .header(header::AUTHORIZATION, "Bearer e30.e30.bm9wZQ")
        .body(axum::body::Body::empty())
        .unwrap();

    let (status, _) = app.send_json(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_write_requires_content() {
    let app = TestApp::new().await;
    let (status, body) = app
        .send_json(post_json("/sandbox/write", Some("alice"), json!({"filename": "a.txt"})))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["message"], "Content is required");
}

#[tokio::test]
async fn test_write_then_read() {
    let app = TestApp::new().await;
    let (status, body) = app
        .send_json(post_json(
            "/sandbox/write",
            Some("alice"),
            json!({"filename": "notes.txt", "content": "ship it"}),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "File 'notes.txt' saved.");

    // The volume is shared, so another user reads the same file
    let (status, body) = app
        .send_json(get("/sandbox/read?filename=notes.txt", Some("bob")))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"], "ship it");
}

#[tokio::test]
async fn test_read_missing_file() {
    let app = TestApp::new().await;
    let (status, body) = app
        .send_json(get("/sandbox/read?filename=ghost.txt", Some("alice")))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"], "File 'ghost.txt' not found.");
}

#[tokio::test]
async fn test_write_outside_volume_rejected() {
    let app = TestApp::new().await;
    let (status, body) = app
        .send_json(post_json(
            "/sandbox/write",
            Some("alice"),
            json!({"filename": "../escape.txt", "content": "x"}),
        ))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_prompt_without_completion_service() {
    let app = TestApp::new().await;
    let (status, body) = app
        .send_json(post_json("/sandbox/prompt", Some("alice"), json!({"prompt": "hi"})))
        .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");
}

struct EchoCompletion;

#[async_trait]
impl CompletionClient for EchoCompletion {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        Ok(format!("echo: {}", prompt))
    }
}

#[tokio::test]
async fn test_prompt_returns_completion() {
    let app = TestApp::builder()
        .completion(Arc::new(EchoCompletion))
        .build()
        .await;
    let (status, body) = app
        .send_json(post_json("/sandbox/prompt", Some("alice"), json!({"prompt": "hi"})))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "echo: hi");
}

#[tokio::test]
async fn test_upload_replaces_staged_project() {
    let app = TestApp::new().await;
    std::fs::create_dir_all(app.volume.project_dir()).unwrap();
    std::fs::write(app.volume.project_dir().join("stale.txt"), "old").unwrap();

    let archive = gzip_tar(&[("package.json", "{}"), ("pages/index.js", "export default 1")]);
    let (status, body) = app
        .send_json(post_multipart("/sandbox/upload", Some("alice"), "site.tar.gz", &archive))
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert!(body["message"].as_str().unwrap().contains("site.tar.gz"));
    assert!(app.volume.project_dir().join("pages/index.js").exists());
    assert!(!app.volume.project_dir().join("stale.txt").exists());
}

#[tokio::test]
async fn test_upload_accepts_zip() {
    let app = TestApp::new().await;
    std::fs::create_dir_all(app.volume.project_dir()).unwrap();
    std::fs::write(app.volume.project_dir().join("stale.txt"), "old").unwrap();

    let archive = zip_file(&[("package.json", "{}"), ("pages/index.js", "export default 1")]);
    let (status, body) = app
        .send_json(post_multipart("/sandbox/upload", Some("alice"), "site.zip", &archive))
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert!(body["message"].as_str().unwrap().contains("site.zip"));
    assert!(app.volume.project_dir().join("pages/index.js").exists());
    assert!(!app.volume.project_dir().join("stale.txt").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_volume_links_are_not_followed() {
    let app = TestApp::new().await;
    let host = tempfile::TempDir::new().unwrap();
    let secret = host.path().join("host-secret.txt");
    std::fs::write(&secret, "HOST SECRET").unwrap();
    std::os::unix::fs::symlink(&secret, app.volume.root().join("leak")).unwrap();

    let (status, body) = app
        .send_json(get("/sandbox/read?filename=leak", Some("alice")))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!body.to_string().contains("HOST SECRET"));

    let (status, _) = app
        .send_json(post_json(
            "/sandbox/write",
            Some("alice"),
            json!({"filename": "leak", "content": "OVERWRITTEN"}),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(std::fs::read_to_string(&secret).unwrap(), "HOST SECRET");

    // A staged project replaced by a link is never copied into a sandbox
    std::os::unix::fs::symlink(host.path(), app.volume.project_dir()).unwrap();
    let (status, _) = app
        .send_json(post_empty("/sandbox/project/run", Some("alice")))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_upload_rejects_corrupt_archive() {
    let app = TestApp::new().await;
    let (status, body) = app
        .send_json(post_multipart(
            "/sandbox/upload",
            Some("alice"),
            "site.tar.gz",
            b"definitely not gzip",
        ))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_ARCHIVE");
}

#[tokio::test]
async fn test_upload_size_limit() {
    let app = TestApp::builder().max_upload_bytes(512).build().await;
    let big = vec![0u8; 4096];
    let response = app
        .send(post_multipart("/sandbox/upload", Some("alice"), "big.tar.gz", &big))
        .await;

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_copy_prebuilt_project() {
    let app = TestApp::new().await;
    let (status, _) = app
        .send_json(post_empty("/sandbox/project/copy", Some("alice")))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert!(app.volume.project_dir().join("package.json").exists());
}

#[tokio::test]
async fn test_run_without_staged_project() {
    let app = TestApp::new().await;
    let (status, body) = app
        .send_json(post_empty("/sandbox/project/run", Some("alice")))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_run_returns_url_and_instance() {
    let app = TestApp::new().await;
    app.send(post_empty("/sandbox/project/copy", Some("alice")))
        .await;

    let (status, body) = app
        .send_json(post_empty("/sandbox/project/run", Some("alice")))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let sandbox_id = body["sandbox_id"].as_str().unwrap().to_string();
    assert!(body["url"]
        .as_str()
        .unwrap()
        .starts_with("https://stub-container-0.preview.test"));
    assert_eq!(body["warnings"], json!([]));

    let (status, list) = app.send_json(get("/sandbox/instances", Some("alice"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["id"], sandbox_id.as_str());
    assert_eq!(list[0]["state"], "running");

    // Other users neither see nor stop it
    let (_, list) = app.send_json(get("/sandbox/instances", Some("bob"))).await;
    assert_eq!(list, json!([]));
    let uri = format!("/sandbox/instances/{}", sandbox_id);
    let (status, _) = app.send_json(get(&uri, Some("bob"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = app.send_json(delete(&uri, Some("bob"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, stopped) = app.send_json(delete(&uri, Some("alice"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stopped["state"], "terminated");
    assert!(stopped["public_url"].is_null());
}

#[tokio::test]
async fn test_run_with_agent_tunnel() {
    let app = TestApp::new().await;
    app.send(post_empty("/sandbox/project/copy", Some("alice")))
        .await;

    let (status, body) = app
        .send_json(post_json(
            "/sandbox/project/run/ngrok",
            Some("alice"),
            json!({"source": "staged", "timeout_secs": 120}),
        ))
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["ngrok_url"], "https://stub.ngrok.app");
    assert!(body["sandbox_id"].is_string());
}

#[tokio::test]
async fn test_run_provisioning_failure_is_sanitized() {
    let app = TestApp::new().await;
    app.provider.fail_creates();

    let (status, body) = app
        .send_json(post_json(
            "/sandbox/project/run",
            Some("alice"),
            json!({"source": "prebuilt"}),
        ))
        .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], "PROVISIONING_FAILED");
    assert_eq!(body["error"]["stage"], "provisioning");
    assert!(body["error"]["sandbox_id"].is_string());
    assert!(!body.to_string().contains("docker.sock"));

    // The failed sandbox is recorded as terminated
    let (_, list) = app.send_json(get("/sandbox/instances", Some("alice"))).await;
    assert_eq!(list[0]["state"], "terminated");
}

#[tokio::test]
async fn test_run_rejects_bad_body() {
    let app = TestApp::new().await;
    let (status, _) = app
        .send_json(post_json(
            "/sandbox/project/run",
            Some("alice"),
            json!({"source": {"kind": "repository", "url": "  "}}),
        ))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cors_preflight_allows_configured_origin() {
    let app = TestApp::new().await;
    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/sandbox/project/run")
        .header(header::ORIGIN, "http://localhost:3000")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(axum::body::Body::empty())
        .unwrap();

    let response = app.send(request).await;
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "http://localhost:3000"
    );
}

// ABOUTME: Shared helpers for API integration tests
// ABOUTME: A scripted provider backed by local mock servers, token signing and request helpers

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use axum::Router;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{digest::KeyInit, Hmac, Mac};
use http_body_util::BodyExt;
use serde_json::Value;
use sha2::Sha256;
use skiff_api::{create_router, ApiSettings, AppState, JwtAlgorithm, JwtVerifier};
use skiff_sandbox::image::ImageDescriptor;
use skiff_sandbox::providers::{
    ContainerConfig, ContainerInfo, ContainerStatus, Endpoint, ExecResult, ExecState,
    PublicEndpoint,
};
use skiff_sandbox::{
    AgentConfig, PersistentVolume, ProbePolicy, Provider, ProviderError, SandboxManager,
    SandboxSettings,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const SECRET: &str = "api-test-secret";
pub const AGENT_STATUS_PORT: u16 = 4040;

/// Provider whose containers are answered by local mock servers
pub struct StubProvider {
    app: MockServer,
    agent: MockServer,
    created: AtomicUsize,
    fail_creates: AtomicBool,
}

impl StubProvider {
    pub async fn new() -> Arc<Self> {
        let app = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&app)
            .await;

        let agent = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tunnels"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tunnels": [{
                    "public_url": "https://stub.ngrok.app",
                    "proto": "https",
                    "config": {"addr": "http://localhost:3000"}
                }]
            })))
            .mount(&agent)
            .await;

        Arc::new(Self {
            app,
            agent,
            created: AtomicUsize::new(0),
            fail_creates: AtomicBool::new(false),
        })
    }

    pub fn fail_creates(&self) {
        self.fail_creates.store(true, Ordering::SeqCst);
    }

    fn endpoint(server: &MockServer) -> Endpoint {
        let address = server.address();
        Endpoint {
            host: address.ip().to_string(),
            port: address.port(),
        }
    }
}

#[async_trait]
impl Provider for StubProvider {
    fn name(&self) -> &str {
        "stub"
    }

    async fn is_available(&self) -> Result<bool, ProviderError> {
        Ok(true)
    }

    async fn image_exists(&self, _image: &str) -> Result<bool, ProviderError> {
        Ok(true)
    }

    async fn build_image(&self, descriptor: &ImageDescriptor) -> Result<String, ProviderError> {
        Ok(descriptor.tag())
    }

    async fn create_container(&self, _config: &ContainerConfig) -> Result<String, ProviderError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(ProviderError::ContainerError(
                "daemon said no at /var/run/docker.sock".to_string(),
            ));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("stub-container-{}", n))
    }

    async fn remove_container(&self, _container_id: &str, _force: bool) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn get_container_info(&self, container_id: &str) -> Result<ContainerInfo, ProviderError> {
        Ok(ContainerInfo {
            id: container_id.to_string(),
            name: container_id.to_string(),
            status: ContainerStatus::Running,
            ip_address: None,
            ports: HashMap::new(),
            created_at: chrono::Utc::now(),
            started_at: None,
        })
    }

    async fn exec_command(
        &self,
        _container_id: &str,
        _command: Vec<String>,
        _working_dir: Option<String>,
        _env_vars: Option<HashMap<String, String>>,
    ) -> Result<ExecResult, ProviderError> {
        Ok(ExecResult {
            exit_code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }

    async fn exec_detached(
        &self,
        container_id: &str,
        _command: Vec<String>,
        _working_dir: Option<String>,
    ) -> Result<String, ProviderError> {
        Ok(format!("{}-exec", container_id))
    }

    async fn exec_state(&self, _exec_id: &str) -> Result<ExecState, ProviderError> {
        Ok(ExecState {
            running: true,
            exit_code: None,
        })
    }

    async fn write_file(&self, _container_id: &str, _path: &str, _contents: &[u8]) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn remove_path(&self, _container_id: &str, _path: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn upload_tar(&self, _container_id: &str, _dest_dir: &str, _tar: Vec<u8>) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn internal_endpoint(&self, _container_id: &str, port: u16) -> Result<Endpoint, ProviderError> {
        if port == AGENT_STATUS_PORT {
            Ok(Self::endpoint(&self.agent))
        } else {
            Ok(Self::endpoint(&self.app))
        }
    }

    async fn tunnel_endpoint(
        &self,
        container_id: &str,
        port: u16,
    ) -> Result<Option<PublicEndpoint>, ProviderError> {
        let host = format!("{}.preview.test", container_id);
        Ok(Some(PublicEndpoint {
            url: format!("https://{}:{}", host, port),
            host,
            port,
        }))
    }
}

pub struct TestApp {
    pub router: Router,
    pub provider: Arc<StubProvider>,
    pub volume: PersistentVolume,
    pub prebuilt: TempDir,
    _volume_dir: TempDir,
}

pub struct TestAppBuilder {
    completion: Option<Arc<dyn skiff_api::CompletionClient>>,
    max_upload_bytes: usize,
}

impl TestApp {
    pub fn builder() -> TestAppBuilder {
        TestAppBuilder {
            completion: None,
            max_upload_bytes: 1024 * 1024,
        }
    }

    pub async fn new() -> Self {
        Self::builder().build().await
    }
}

impl TestAppBuilder {
    pub fn completion(mut self, client: Arc<dyn skiff_api::CompletionClient>) -> Self {
        self.completion = Some(client);
        self
    }

    pub fn max_upload_bytes(mut self, bytes: usize) -> Self {
        self.max_upload_bytes = bytes;
        self
    }

    pub async fn build(self) -> TestApp {
        let provider = StubProvider::new().await;
        let settings = SandboxSettings {
            setup_commands: Vec::new(),
            start_command: "serve".to_string(),
            probe: ProbePolicy {
                max_attempts: 3,
                interval: Duration::from_millis(10),
                attempt_timeout: Duration::from_secs(1),
            },
            ..Default::default()
        };
        let manager = SandboxManager::new(provider.clone(), settings).with_agent(AgentConfig {
            status_attempts: 3,
            status_interval: Duration::from_millis(10),
            ..Default::default()
        });

        let volume_dir = TempDir::new().unwrap();
        let volume = PersistentVolume::open(volume_dir.path()).unwrap();
        let prebuilt = TempDir::new().unwrap();
        std::fs::write(prebuilt.path().join("package.json"), "{}").unwrap();

        let mut state = AppState::new(
            Arc::new(manager),
            volume.clone(),
            Arc::new(JwtVerifier::new(SECRET, JwtAlgorithm::HS256)),
        )
        .with_settings(ApiSettings {
            prebuilt_path: prebuilt.path().to_path_buf(),
            max_upload_bytes: self.max_upload_bytes,
            ..Default::default()
        });
        if let Some(completion) = self.completion {
            state = state.with_completion(completion);
        }

        TestApp {
            router: create_router(state),
            provider,
            volume,
            prebuilt,
            _volume_dir: volume_dir,
        }
    }
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn send_json(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.send(request).await;
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }
}

/// Sign an HS256 token for `sub`
pub fn token_for(sub: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(format!(
        r#"{{"sub":"{}","email":"{}@example.com","exp":{}}}"#,
        sub,
        sub,
        chrono::Utc::now().timestamp() + 3600
    ));
    let message = format!("{}.{}", header, claims);
    let mut mac = <Hmac<Sha256> as KeyInit>::new_from_slice(SECRET.as_bytes()).unwrap();
    Mac::update(&mut mac, message.as_bytes());
    format!(
        "{}.{}",
        message,
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    )
}

pub fn get(uri: &str, user: Option<&str>) -> Request<Body> {
    authed(Request::get(uri), user).body(Body::empty()).unwrap()
}

pub fn delete(uri: &str, user: Option<&str>) -> Request<Body> {
    authed(Request::delete(uri), user).body(Body::empty()).unwrap()
}

pub fn post_json(uri: &str, user: Option<&str>, body: Value) -> Request<Body> {
    authed(Request::post(uri), user)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn post_empty(uri: &str, user: Option<&str>) -> Request<Body> {
    authed(Request::post(uri), user).body(Body::empty()).unwrap()
}

pub fn post_multipart(uri: &str, user: Option<&str>, filename: &str, bytes: &[u8]) -> Request<Body> {
    let boundary = "skiff-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{f}\"\r\nContent-Type: application/gzip\r\n\r\n",
            b = boundary,
            f = filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

    authed(Request::post(uri), user)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap()
}

fn authed(builder: axum::http::request::Builder, user: Option<&str>) -> axum::http::request::Builder {
    match user {
        Some(user) => builder.header(header::AUTHORIZATION, format!("Bearer {}", token_for(user))),
        None => builder,
    }
}

/// Gzip tarball holding `files`
pub fn gzip_tar(files: &[(&str, &str)]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, contents.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Zip file holding `files`
pub fn zip_file(files: &[(&str, &str)]) -> Vec<u8> {
    use std::io::Write;

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, contents) in files {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

// ABOUTME: In-memory provider used by the sandbox integration tests
// ABOUTME: Simulates files, exec, detached HTTP servers, published ports and deadline reclamation

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{routing::get, Router};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use skiff_sandbox::image::ImageDescriptor;
use skiff_sandbox::providers::{
    ContainerConfig, ContainerInfo, ContainerStatus, Endpoint, ExecResult, ExecState, Provider,
    ProviderError, PublicEndpoint, Result,
};
use skiff_sandbox::{ProbePolicy, SandboxSettings};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Cursor, Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Exit code and stderr returned for commands containing a pattern
#[derive(Clone)]
struct Scripted {
    pattern: String,
    exit_code: i64,
    stderr: String,
}

struct FakeContainer {
    config: ContainerConfig,
    files: BTreeMap<String, Vec<u8>>,
    servers: HashMap<u16, (SocketAddr, JoinHandle<()>)>,
    removed: bool,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    containers: HashMap<String, FakeContainer>,
    images: HashSet<String>,
    builds: Vec<String>,
    commands: Vec<(String, Vec<String>)>,
    detached: Vec<(String, Vec<String>)>,
    execs: HashMap<String, String>,
    scripted: Vec<Scripted>,
    port_routes: HashMap<u16, SocketAddr>,
    unreachable_ports: HashSet<u16>,
    tunnels_disabled: bool,
    fail_builds: bool,
    fail_creates: bool,
}

#[derive(Clone, Default)]
pub struct FakeProvider {
    state: Arc<Mutex<FakeState>>,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Commands containing `pattern` exit with `exit_code`
    pub fn script(&self, pattern: &str, exit_code: i64, stderr: &str) {
        self.state.lock().unwrap().scripted.push(Scripted {
            pattern: pattern.to_string(),
            exit_code,
            stderr: stderr.to_string(),
        });
    }

    /// Send internal traffic for `port` to a real address
    pub fn route_port(&self, port: u16, addr: SocketAddr) {
        self.state.lock().unwrap().port_routes.insert(port, addr);
    }

    /// `internal_endpoint` fails for `port`, as Docker does when it has no route to it
    pub fn unreachable_port(&self, port: u16) {
        self.state.lock().unwrap().unreachable_ports.insert(port);
    }

    pub fn disable_tunnels(&self) {
        self.state.lock().unwrap().tunnels_disabled = true;
    }

    pub fn fail_builds(&self) {
        self.state.lock().unwrap().fail_builds = true;
    }

    pub fn fail_creates(&self) {
        self.state.lock().unwrap().fail_creates = true;
    }

    /// Seed a container directly, for exercising stage components alone
    pub fn add_container(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.containers.insert(
            id.to_string(),
            FakeContainer {
                config: ContainerConfig {
                    image: "fake".to_string(),
                    name: id.to_string(),
                    env_vars: HashMap::new(),
                    volumes: Vec::new(),
                    ports: Vec::new(),
                    working_dir: None,
                    labels: HashMap::new(),
                    lifetime: Duration::from_secs(3600),
                },
                files: BTreeMap::new(),
                servers: HashMap::new(),
                removed: false,
            },
        );
    }

    pub fn put_file(&self, container_id: &str, path: &str, contents: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(container) = state.containers.get_mut(container_id) {
            container
                .files
                .insert(path.to_string(), contents.as_bytes().to_vec());
        }
    }

    /// Paths present in a container (kept after removal for inspection)
    pub fn files(&self, container_id: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .get(container_id)
            .map(|c| c.files.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn read(&self, container_id: &str, path: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .get(container_id)
            .and_then(|c| c.files.get(path))
            .map(|bytes| String::from_utf8_lossy(bytes).to_string())
    }

    /// Every foreground command, joined by spaces, in execution order
    pub fn commands(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.commands.iter().map(|(_, c)| c.join(" ")).collect()
    }

    pub fn detached(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.detached.iter().map(|(_, c)| c.join(" ")).collect()
    }

    pub fn builds(&self) -> Vec<String> {
        self.state.lock().unwrap().builds.clone()
    }

    pub fn is_removed(&self, container_id: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .containers
            .get(container_id)
            .map(|c| c.removed)
            .unwrap_or(false)
    }

    pub fn container_config(&self, container_id: &str) -> Option<ContainerConfig> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .get(container_id)
            .map(|c| c.config.clone())
    }

    fn remove(state: &Arc<Mutex<FakeState>>, container_id: &str) {
        let mut state = state.lock().unwrap();
        if let Some(container) = state.containers.get_mut(container_id) {
            container.removed = true;
            for (_, (_, handle)) in container.servers.drain() {
                handle.abort();
            }
        }
    }

    fn scripted(&self, command: &[String]) -> Option<Scripted> {
        let joined = command.join(" ");
        let state = self.state.lock().unwrap();
        state
            .scripted
            .iter()
            .find(|s| joined.contains(&s.pattern))
            .cloned()
    }

    fn with_live<T>(
        &self,
        container_id: &str,
        f: impl FnOnce(&mut FakeContainer) -> T,
    ) -> Result<T> {
        let mut state = self.state.lock().unwrap();
        match state.containers.get_mut(container_id) {
            Some(container) if !container.removed => Ok(f(container)),
            _ => Err(ProviderError::NotFound(container_id.to_string())),
        }
    }

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }
}

fn exec_ok() -> ExecResult {
    ExecResult {
        exit_code: 0,
        stdout: Vec::new(),
        stderr: Vec::new(),
    }
}

fn exec_failed(exit_code: i64, stderr: &str) -> ExecResult {
    ExecResult {
        exit_code,
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

fn join_path(dir: &str, entry: &str) -> String {
    let entry = entry.trim_start_matches("./");
    format!("{}/{}", dir.trim_end_matches('/'), entry)
}

fn unpack_into<R: Read>(
    files: &mut BTreeMap<String, Vec<u8>>,
    dest: &str,
    reader: R,
) -> std::io::Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().to_string();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        files.insert(join_path(dest, &path), contents);
    }
    Ok(())
}

fn unzip_into(
    files: &mut BTreeMap<String, Vec<u8>>,
    dest: &str,
    bytes: &[u8],
) -> zip::result::ZipResult<()> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        if file.is_dir() {
            continue;
        }
        let path = file.name().to_string();
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        files.insert(join_path(dest, &path), contents);
    }
    Ok(())
}

fn remove_tree(files: &mut BTreeMap<String, Vec<u8>>, path: &str) {
    let prefix = format!("{}/", path.trim_end_matches('/'));
    files.retain(|p, _| p != path && !p.starts_with(&prefix));
}

async fn hello_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/", get(|| async { "hello" }));
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, handle)
}

/// `serve <port>` anywhere in a command starts a hello server for that port
fn served_port(command: &[String]) -> Option<u16> {
    let joined = command.join(" ");
    let mut words = joined.split_whitespace();
    while let Some(word) = words.next() {
        if word == "serve" {
            return words.next().and_then(|p| p.parse().ok());
        }
    }
    None
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn is_available(&self) -> Result<bool> {
        Ok(true)
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().images.contains(image))
    }

    async fn build_image(&self, descriptor: &ImageDescriptor) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if state.fail_builds {
            return Err(ProviderError::ImageError("build failed".to_string()));
        }
        let tag = descriptor.tag();
        state.builds.push(descriptor.key().to_string());
        state.images.insert(tag.clone());
        Ok(tag)
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        let id = {
            let mut state = self.state.lock().unwrap();
            if state.fail_creates {
                return Err(ProviderError::ContainerError("create failed".to_string()));
            }
            state.next_id += 1;
            let id = format!("fake-{}", state.next_id);
            state.containers.insert(
                id.clone(),
                FakeContainer {
                    config: config.clone(),
                    files: BTreeMap::new(),
                    servers: HashMap::new(),
                    removed: false,
                },
            );
            id
        };

        // The platform reclaims the container at its deadline
        let state = self.state.clone();
        let lifetime = config.lifetime;
        let container_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;
            FakeProvider::remove(&state, &container_id);
        });

        Ok(id)
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> Result<()> {
        Self::remove(&self.state, container_id);
        Ok(())
    }

    async fn get_container_info(&self, container_id: &str) -> Result<ContainerInfo> {
        self.with_live(container_id, |c| ContainerInfo {
            id: container_id.to_string(),
            name: c.config.name.clone(),
            status: ContainerStatus::Running,
            ip_address: Some("127.0.0.1".to_string()),
            ports: c
                .servers
                .iter()
                .map(|(port, (addr, _))| (*port, addr.port()))
                .collect(),
            created_at: chrono::Utc::now(),
            started_at: Some(chrono::Utc::now()),
        })
    }

    async fn exec_command(
        &self,
        container_id: &str,
        command: Vec<String>,
        _working_dir: Option<String>,
        _env_vars: Option<HashMap<String, String>>,
    ) -> Result<ExecResult> {
        self.with_live(container_id, |_| ())?;
        self.state
            .lock()
            .unwrap()
            .commands
            .push((container_id.to_string(), command.clone()));

        if let Some(scripted) = self.scripted(&command) {
            return Ok(exec_failed(scripted.exit_code, &scripted.stderr));
        }

        let args: Vec<&str> = command.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["tar", "-xzf", archive, "-C", target] => self.with_live(container_id, |c| {
                let Some(bytes) = c.files.get(*archive).cloned() else {
                    return exec_failed(2, "tar: cannot open archive");
                };
                match unpack_into(&mut c.files, target, GzDecoder::new(bytes.as_slice())) {
                    Ok(()) => exec_ok(),
                    Err(e) => exec_failed(2, &e.to_string()),
                }
            }),
            ["unzip", "-o", "-q", archive, "-d", target] => self.with_live(container_id, |c| {
                let Some(bytes) = c.files.get(*archive).cloned() else {
                    return exec_failed(9, "unzip: cannot find archive");
                };
                match unzip_into(&mut c.files, target, &bytes) {
                    Ok(()) => exec_ok(),
                    Err(e) => exec_failed(9, &e.to_string()),
                }
            }),
            ["git", "clone", .., target] => self.with_live(container_id, |c| {
                c.files
                    .insert(join_path(target, "README.md"), b"cloned".to_vec());
                exec_ok()
            }),
            _ => Ok(exec_ok()),
        }
    }

    async fn exec_detached(
        &self,
        container_id: &str,
        command: Vec<String>,
        _working_dir: Option<String>,
    ) -> Result<String> {
        self.with_live(container_id, |_| ())?;

        let server = match served_port(&command) {
            Some(port) => Some((port, hello_server().await)),
            None => None,
        };

        let mut state = self.state.lock().unwrap();
        state
            .detached
            .push((container_id.to_string(), command));
        let exec_id = format!("exec-{}", state.detached.len());
        state
            .execs
            .insert(exec_id.clone(), container_id.to_string());
        if let Some((port, server)) = server {
            if let Some(container) = state.containers.get_mut(container_id) {
                container.servers.insert(port, server);
            }
        }
        Ok(exec_id)
    }

    async fn exec_state(&self, exec_id: &str) -> Result<ExecState> {
        let container_id = self
            .state
            .lock()
            .unwrap()
            .execs
            .get(exec_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(exec_id.to_string()))?;

        if self.is_removed(&container_id) {
            return Ok(ExecState {
                running: false,
                exit_code: Some(137),
            });
        }
        Ok(ExecState {
            running: true,
            exit_code: None,
        })
    }

    async fn write_file(&self, container_id: &str, path: &str, contents: &[u8]) -> Result<()> {
        self.with_live(container_id, |c| {
            c.files.insert(path.to_string(), contents.to_vec());
        })
    }

    async fn remove_path(&self, container_id: &str, path: &str) -> Result<()> {
        self.with_live(container_id, |c| remove_tree(&mut c.files, path))
    }

    async fn upload_tar(&self, container_id: &str, dest_dir: &str, tar: Vec<u8>) -> Result<()> {
        self.with_live(container_id, |c| unpack_into(&mut c.files, dest_dir, tar.as_slice()))?
            .map_err(|e| ProviderError::ContainerError(e.to_string()))
    }

    async fn internal_endpoint(&self, container_id: &str, port: u16) -> Result<Endpoint> {
        if self.state.lock().unwrap().unreachable_ports.contains(&port) {
            return Err(ProviderError::NetworkError(format!(
                "no route to port {} of {}",
                port, container_id
            )));
        }
        let routed = self.state.lock().unwrap().port_routes.get(&port).copied();
        if let Some(addr) = routed {
            return Ok(Endpoint {
                host: addr.ip().to_string(),
                port: addr.port(),
            });
        }

        let served = self.with_live(container_id, |c| c.servers.get(&port).map(|(addr, _)| *addr))?;
        Ok(Endpoint {
            host: "127.0.0.1".to_string(),
            port: served.map(|a| a.port()).unwrap_or_else(Self::closed_port),
        })
    }

    async fn tunnel_endpoint(
        &self,
        container_id: &str,
        port: u16,
    ) -> Result<Option<PublicEndpoint>> {
        if self.state.lock().unwrap().tunnels_disabled {
            return Ok(None);
        }

        let (published, served) = self.with_live(container_id, |c| {
            (
                c.config.ports.iter().any(|p| p.container_port == port),
                c.servers.get(&port).map(|(addr, _)| *addr),
            )
        })?;
        if !published {
            return Ok(None);
        }

        let host_port = served.map(|a| a.port()).unwrap_or_else(Self::closed_port);
        Ok(Some(PublicEndpoint {
            host: "127.0.0.1".to_string(),
            port: host_port,
            url: format!("http://127.0.0.1:{}", host_port),
        }))
    }
}

/// Settings with quick probes and no setup commands
pub fn fast_settings() -> SandboxSettings {
    SandboxSettings {
        setup_commands: Vec::new(),
        start_command: "serve 3000".to_string(),
        probe: ProbePolicy {
            max_attempts: 5,
            interval: Duration::from_millis(50),
            attempt_timeout: Duration::from_millis(500),
        },
        ..Default::default()
    }
}

/// Build a gzip tarball from (path, contents) pairs
pub fn gzip_tar(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, contents.as_bytes())
            .unwrap();
    }
    let tar = builder.into_inner().unwrap();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
}

/// Gzip tarball holding one entry whose name is written verbatim, `..` included
pub fn gzip_tar_raw_name(name: &str, contents: &str) -> Vec<u8> {
    let mut header = tar::Header::new_gnu();
    let bytes = name.as_bytes();
    header.as_gnu_mut().unwrap().name[..bytes.len()].copy_from_slice(bytes);
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append(&header, contents.as_bytes()).unwrap();
    let tar = builder.into_inner().unwrap();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
}

/// Build a zip file from (path, contents) pairs
pub fn zip_file(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (path, contents) in files {
        writer
            .start_file(*path, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

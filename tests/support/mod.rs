//! Shared fakes for the integration tests: scripted credential sources, an
//! in-memory document repository and helpers to start a server on an ephemeral port.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use docbridge::config::Settings;
use docbridge::error::{AuthError, OperationError};
use docbridge::repository::{DocumentRepository, FileContent, FileDescriptor, SiteInfo};
use docbridge::rpc::{Bridge, DirectDelivery, Dispatcher, OperationRegistry};
use docbridge::server::ServerHandle;
use docbridge::session::{Credential, CredentialSource, SessionContext, SessionLifecycle};

pub const BASE_URL: &str = "https://graph.test/v1.0";

pub struct StaticSource {
    pub token: String,
    pub ttl_secs: i64,
}

#[async_trait]
impl CredentialSource for StaticSource {
    async fn acquire(&self) -> Result<Credential, AuthError> {
        Ok(Credential { token: self.token.clone(), expires_at: Utc::now() + chrono::Duration::seconds(self.ttl_secs) })
    }
}

pub struct FailingSource;

#[async_trait]
impl CredentialSource for FailingSource {
    async fn acquire(&self) -> Result<Credential, AuthError> {
        Err(AuthError::Network("token endpoint unreachable".to_string()))
    }
}

pub fn good_source() -> Arc<dyn CredentialSource> {
    Arc::new(StaticSource { token: "abc".to_string(), ttl_secs: 3600 })
}

/// In-memory repository counting every call it receives.
pub struct MemoryRepository {
    pub files: Vec<FileDescriptor>,
    pub contents: HashMap<String, String>,
    pub calls: AtomicUsize,
    pub delay: Option<Duration>,
}

impl MemoryRepository {
    pub fn sample() -> Self {
        let files = vec![
            FileDescriptor {
                id: "01A".to_string(),
                name: "notes.txt".to_string(),
                size: 11,
                is_folder: false,
                mime_type: Some("text/plain".to_string()),
                web_url: Some("https://contoso.example/notes.txt".to_string()),
                last_modified: Some("2024-05-01T10:00:00Z".to_string()),
            },
            FileDescriptor {
                id: "01B".to_string(),
                name: "Reports".to_string(),
                size: 0,
                is_folder: true,
                mime_type: None,
                web_url: None,
                last_modified: None,
            },
        ];
        let mut contents = HashMap::new();
        contents.insert("notes.txt".to_string(), "hello world".to_string());
        Self { files, contents, calls: AtomicUsize::new(0), delay: None }
    }

    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

#[async_trait]
impl DocumentRepository for MemoryRepository {
    async fn list_files(&self, session: &SessionContext, _folder: Option<&str>) -> Result<Vec<FileDescriptor>, OperationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(session.is_valid(Utc::now()), "repository called with an invalid session");
        if let Some(d) = self.delay { tokio::time::sleep(d).await; }
        Ok(self.files.clone())
    }

    async fn get_file_content(&self, session: &SessionContext, filename: &str) -> Result<FileContent, OperationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(session.is_valid(Utc::now()), "repository called with an invalid session");
        match self.contents.get(filename) {
            Some(text) => Ok(FileContent::from_bytes(filename, Some("text/plain".to_string()), text.clone().into_bytes())),
            None => Err(OperationError::NotFound("not found".to_string())),
        }
    }

    async fn get_site_info(&self, _session: &SessionContext) -> Result<SiteInfo, OperationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(SiteInfo {
            name: "Team".to_string(),
            description: "No description".to_string(),
            created: "Unknown".to_string(),
            last_modified: "Unknown".to_string(),
            web_url: "https://contoso.example/sites/Team".to_string(),
        })
    }
}

pub fn test_settings() -> Settings {
    Settings {
        app_name: "docbridge-test".to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
        graph_url: BASE_URL.to_string(),
        bridge_timeout: Duration::from_secs(5),
        acquire_timeout: Duration::from_secs(2),
        ..Settings::default()
    }
}

/// A started session lifecycle plus a direct bridge over the given repository.
pub async fn direct_bridge(source: Arc<dyn CredentialSource>, repo: Arc<MemoryRepository>, timeout: Duration) -> (Bridge, Arc<SessionLifecycle>) {
    let s = test_settings();
    let sessions = Arc::new(SessionLifecycle::new(source, BASE_URL, s.refresh, s.degraded_ttl).with_acquire_timeout(s.acquire_timeout));
    sessions.start().await;
    let dispatcher = Arc::new(Dispatcher::new(OperationRegistry::standard(), sessions.clone(), repo, "docbridge-test"));
    (Bridge::new(Arc::new(DirectDelivery::new(dispatcher)), timeout), sessions)
}

pub async fn start_server(settings: Settings, source: Arc<dyn CredentialSource>, repo: Arc<dyn DocumentRepository>) -> ServerHandle {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.expect("bind 127.0.0.1:0");
    docbridge::server::spawn(&settings, listener, source, repo).await.expect("spawn server")
}

/// A localhost port with nothing listening on it. Tiny reuse race, acceptable for tests.
pub fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).expect("bind 127.0.0.1:0");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

//! Document repository contract: the read-only calls the operations make
//! against the third-party content store, and the values they return.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::OperationError;
use crate::session::SessionContext;

pub mod graph;

pub use graph::GraphRepository;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub is_folder: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ContentEncoding {
    #[serde(rename = "utf-8")]
    Utf8,
    Base64,
}

/// Raw content of one file. Text is returned as-is, anything else base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileContent {
    pub filename: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub encoding: ContentEncoding,
    pub content: String,
}

impl FileContent {
    pub fn from_bytes(filename: &str, content_type: Option<String>, bytes: Vec<u8>) -> Self {
        use base64::Engine;
        let size = bytes.len() as u64;
        match String::from_utf8(bytes) {
            Ok(text) => FileContent { filename: filename.to_string(), size, content_type, encoding: ContentEncoding::Utf8, content: text },
            Err(e) => FileContent {
                filename: filename.to_string(),
                size,
                content_type,
                encoding: ContentEncoding::Base64,
                content: base64::engine::general_purpose::STANDARD.encode(e.into_bytes()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SiteInfo {
    pub name: String,
    pub description: String,
    pub created: String,
    pub last_modified: String,
    pub web_url: String,
}

/// Read-only access to the content store. Implementations must not be called
/// with an invalid session; the operation handlers check that first.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn list_files(&self, session: &SessionContext, folder: Option<&str>) -> Result<Vec<FileDescriptor>, OperationError>;

    async fn get_file_content(&self, session: &SessionContext, filename: &str) -> Result<FileContent, OperationError>;

    async fn get_site_info(&self, session: &SessionContext) -> Result<SiteInfo, OperationError>;
}

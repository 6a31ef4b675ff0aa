//! Microsoft Graph implementation of the document repository.
//!
//! The SharePoint site is resolved from its URL on each call
//! (`{base}/sites/{host}:/sites/{name}`), files are read from the site's default
//! document library, optionally below a configured folder.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{DocumentRepository, FileContent, FileDescriptor, SiteInfo};
use crate::config::Settings;
use crate::error::{AuthError, OperationError};
use crate::session::SessionContext;

pub struct GraphRepository {
    client: reqwest::Client,
    site_url: Option<String>,
    folder: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriveItem {
    id: String,
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(rename = "webUrl", default)]
    web_url: Option<String>,
    #[serde(rename = "lastModifiedDateTime", default)]
    last_modified: Option<String>,
    #[serde(default)]
    file: Option<FileFacet>,
    #[serde(default)]
    folder: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct FileFacet {
    #[serde(rename = "mimeType", default)]
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriveItemPage {
    #[serde(default)]
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

impl From<DriveItem> for FileDescriptor {
    fn from(item: DriveItem) -> Self {
        FileDescriptor {
            id: item.id,
            name: item.name,
            size: item.size,
            is_folder: item.folder.is_some(),
            mime_type: item.file.and_then(|f| f.mime_type),
            web_url: item.web_url,
            last_modified: item.last_modified,
        }
    }
}

/// Split a site URL into (host, site name). `None` name means the root site.
fn parse_site_url(site_url: &str) -> Result<(String, Option<String>), OperationError> {
    let trimmed = site_url.trim().trim_start_matches("https://").trim_start_matches("http://");
    let mut parts = trimmed.split('/').filter(|p| !p.is_empty());
    let host = parts
        .next()
        .ok_or_else(|| OperationError::Internal(format!("invalid SharePoint site url: {site_url}")))?
        .to_string();
    // https://contoso.sharepoint.com/sites/<name>
    let name = match (parts.next(), parts.next()) {
        (Some(_kind), Some(name)) => Some(name.to_string()),
        _ => None,
    };
    Ok((host, name))
}

/// Percent-encode each path segment, keeping the separators. `.` and `..`
/// segments are refused: URL normalisation would resolve them outside the drive.
fn encode_path(path: &str, param: &str) -> Result<String, OperationError> {
    let mut out = Vec::new();
    for segment in path.split(['/', '\\']).filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." {
            return Err(OperationError::InvalidParam {
                name: param.to_string(),
                message: format!("relative path segment {segment:?} is not allowed"),
            });
        }
        out.push(urlencoding::encode(segment).into_owned());
    }
    Ok(out.join("/"))
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.pointer("/error/message").and_then(|m| m.as_str()).map(|s| s.to_string()))
        .unwrap_or_else(|| body.chars().take(200).collect())
}

/// Classify a non-success Graph response.
fn status_error(status: StatusCode, body: &str, not_found: impl FnOnce() -> String) -> OperationError {
    match status {
        StatusCode::NOT_FOUND => OperationError::NotFound(not_found()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => OperationError::Auth(AuthError::Rejected {
            status: status.as_u16(),
            message: error_message(body),
        }),
        _ => OperationError::Upstream { status: status.as_u16(), message: error_message(body) },
    }
}

/// True when `link` points below `base` (same origin and path prefix).
fn is_within(link: &str, base: &str) -> bool {
    let base = base.trim_end_matches('/');
    link.strip_prefix(base).is_some_and(|rest| rest.starts_with('/') || rest.starts_with('?'))
}

fn transport_error(e: reqwest::Error) -> OperationError {
    OperationError::Upstream { status: 502, message: format!("graph request failed: {e}") }
}

impl GraphRepository {
    pub fn new(client: reqwest::Client, site_url: Option<String>, folder: Option<String>) -> Self {
        Self { client, site_url, folder }
    }

    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self::new(client, settings.site_url.clone(), settings.folder.clone()))
    }

    async fn get(&self, session: &SessionContext, url: &str) -> Result<(StatusCode, reqwest::Response), OperationError> {
        debug!(target: "graph", "GET {}", url);
        let resp = self.client
            .get(url)
            .header(reqwest::header::AUTHORIZATION, session.bearer())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(transport_error)?;
        Ok((resp.status(), resp))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        session: &SessionContext,
        url: &str,
        not_found: impl FnOnce() -> String,
    ) -> Result<T, OperationError> {
        let (status, resp) = self.get(session, url).await?;
        let body = resp.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(status_error(status, &body, not_found));
        }
        serde_json::from_str(&body).map_err(|e| OperationError::Upstream {
            status: 502,
            message: format!("unexpected graph response: {e}"),
        })
    }

    async fn site_id(&self, session: &SessionContext) -> Result<String, OperationError> {
        let site_url = self
            .site_url
            .as_deref()
            .ok_or_else(|| OperationError::Internal("SHAREPOINT_SITE_URL is not configured".to_string()))?;
        let url = self.site_lookup_url(session, site_url)?;
        let site: Value = self.get_json(session, &url, || format!("site not found: {site_url}")).await?;
        site.get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| OperationError::Upstream { status: 502, message: "site response without id".to_string() })
    }

    fn site_lookup_url(&self, session: &SessionContext, site_url: &str) -> Result<String, OperationError> {
        let (host, name) = parse_site_url(site_url)?;
        Ok(match name {
            Some(name) => format!("{}/sites/{}:/sites/{}", session.base_url(), host, urlencoding::encode(&name)),
            None => format!("{}/sites/{}", session.base_url(), host),
        })
    }

    /// Drive-relative path of `name`, below the configured folder if any.
    fn drive_path(&self, name: &str) -> Result<String, OperationError> {
        let name = encode_path(name, "filename")?;
        Ok(match self.folder.as_deref() {
            Some(folder) => format!("{}/{}", encode_path(folder, "SHAREPOINT_FOLDER")?, name),
            None => name,
        })
    }
}

#[async_trait]
impl DocumentRepository for GraphRepository {
    async fn list_files(&self, session: &SessionContext, folder: Option<&str>) -> Result<Vec<FileDescriptor>, OperationError> {
        let scope = match (self.folder.as_deref(), folder.map(|f| f.trim_matches('/')).filter(|f| !f.is_empty())) {
            (Some(base), Some(sub)) => Some(format!("{}/{}", encode_path(base, "SHAREPOINT_FOLDER")?, encode_path(sub, "folder")?)),
            (Some(base), None) => Some(encode_path(base, "SHAREPOINT_FOLDER")?),
            (None, Some(sub)) => Some(encode_path(sub, "folder")?),
            (None, None) => None,
        };
        let site_id = self.site_id(session).await?;
        let drive = format!("{}/sites/{}/drive", session.base_url(), site_id);
        let mut url = match &scope {
            Some(path) => format!("{drive}/root:/{path}:/children"),
            None => format!("{drive}/root/children"),
        };

        let mut out = Vec::new();
        loop {
            let page: DriveItemPage = self
                .get_json(session, &url, || format!("folder not found: {}", scope.clone().unwrap_or_default()))
                .await?;
            out.extend(page.value.into_iter().map(FileDescriptor::from));
            match page.next_link {
                Some(next) if is_within(&next, session.base_url()) => url = next,
                Some(next) => {
                    return Err(OperationError::Upstream {
                        status: 502,
                        message: format!("refusing to follow nextLink outside {}: {}", session.base_url(), next),
                    })
                }
                None => break,
            }
        }
        debug!(target: "graph", "listed {} items", out.len());
        Ok(out)
    }

    async fn get_file_content(&self, session: &SessionContext, filename: &str) -> Result<FileContent, OperationError> {
        let path = self.drive_path(filename)?;
        let site_id = self.site_id(session).await?;
        let drive = format!("{}/sites/{}/drive", session.base_url(), site_id);
        let item_url = format!("{}/root:/{}", drive, path);
        let item: DriveItem = self.get_json(session, &item_url, || format!("file not found: {filename}")).await?;
        if item.folder.is_some() {
            return Err(OperationError::InvalidParam {
                name: "filename".to_string(),
                message: format!("{filename} is a folder"),
            });
        }

        let content_url = format!("{}/items/{}/content", drive, urlencoding::encode(&item.id));
        let (status, resp) = self.get(session, &content_url).await?;
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &body, || format!("file not found: {filename}")));
        }
        let bytes = resp.bytes().await.map_err(transport_error)?;
        let content_type = item.file.and_then(|f| f.mime_type);
        Ok(FileContent::from_bytes(&item.name, content_type, bytes.to_vec()))
    }

    async fn get_site_info(&self, session: &SessionContext) -> Result<SiteInfo, OperationError> {
        let site_url = self
            .site_url
            .as_deref()
            .ok_or_else(|| OperationError::Internal("SHAREPOINT_SITE_URL is not configured".to_string()))?;
        let url = self.site_lookup_url(session, site_url)?;
        let site: Value = self.get_json(session, &url, || format!("site not found: {site_url}")).await?;
        let field = |k: &str, default: &str| site.get(k).and_then(|v| v.as_str()).unwrap_or(default).to_string();
        Ok(SiteInfo {
            name: field("displayName", "Unknown"),
            description: field("description", "No description"),
            created: field("createdDateTime", "Unknown"),
            last_modified: field("lastModifiedDateTime", "Unknown"),
            web_url: field("webUrl", site_url),
        })
    }
}

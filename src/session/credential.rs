use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::config::{SharePointCredentials, Settings};
use crate::error::AuthError;

/// A bearer token and the absolute instant after which it must not be trusted.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &super::redact_token(&self.token))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Exchanges the application identity for a bearer credential.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn acquire(&self) -> Result<Credential, AuthError>;

    /// Release anything held for acquisitions. Called once at shutdown.
    async fn release(&self) {}
}

/// OAuth2 client-credentials grant against the Microsoft identity platform.
pub struct ClientCredentialSource {
    client: reqwest::Client,
    authority_url: String,
    graph_url: String,
    credentials: SharePointCredentials,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

impl ClientCredentialSource {
    pub fn new(client: reqwest::Client, authority_url: &str, graph_url: &str, credentials: SharePointCredentials) -> Self {
        Self {
            client,
            authority_url: authority_url.trim_end_matches('/').to_string(),
            graph_url: graph_url.to_string(),
            credentials,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AuthError::Network(e.to_string()))?;
        Ok(Self::new(client, &settings.authority_url, &settings.graph_url, settings.credentials.clone()))
    }

    /// `https://graph.microsoft.com/v1.0` -> `https://graph.microsoft.com/.default`
    fn scope(&self) -> String {
        match reqwest::Url::parse(&self.graph_url) {
            Ok(u) => format!("{}/.default", u.origin().ascii_serialization()),
            Err(_) => "https://graph.microsoft.com/.default".to_string(),
        }
    }

    fn token_url(&self, tenant: &str) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority_url, urlencoding::encode(tenant))
    }
}

#[async_trait]
impl CredentialSource for ClientCredentialSource {
    async fn acquire(&self) -> Result<Credential, AuthError> {
        let (Some(tenant), Some(client_id), Some(secret)) = (
            self.credentials.tenant_id.as_deref(),
            self.credentials.client_id.as_deref(),
            self.credentials.client_secret.as_deref(),
        ) else {
            return Err(AuthError::NotConfigured(
                "SHAREPOINT_TENANT_ID, SHAREPOINT_CLIENT_ID and SHAREPOINT_CLIENT_SECRET are required".to_string(),
            ));
        };

        let scope = self.scope();
        let form = [
            ("client_id", client_id),
            ("client_secret", secret),
            ("grant_type", "client_credentials"),
            ("scope", scope.as_str()),
        ];
        tracing::debug!(target: "session", "requesting token for client_id={} tenant={}", client_id, tenant);
        let resp = self.client
            .post(self.token_url(tenant))
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| AuthError::Network(e.to_string()))?;
        let parsed: Option<TokenResponse> = serde_json::from_str(&body).ok();

        if !status.is_success() {
            let message = parsed
                .and_then(|t| t.error_description.or(t.error))
                .unwrap_or_else(|| body.chars().take(200).collect());
            return Err(AuthError::Rejected { status: status.as_u16(), message });
        }

        let Some(parsed) = parsed else {
            return Err(AuthError::MalformedResponse("token response is not JSON".to_string()));
        };
        let Some(token) = parsed.access_token.filter(|t| !t.is_empty()) else {
            return Err(AuthError::MalformedResponse("access_token missing".to_string()));
        };
        let expires_in = parsed.expires_in.unwrap_or(3600).max(0);
        Ok(Credential { token, expires_at: Utc::now() + chrono::Duration::seconds(expires_in) })
    }
}

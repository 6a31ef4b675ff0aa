//! Process configuration, read once at startup.
//!
//! Values come from environment variables; `main` lets CLI flags override the
//! listening address and delivery mode. Missing SharePoint credentials are not an
//! error here: the session layer turns them into a degraded context.

use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_GRAPH_URL: &str = "https://graph.microsoft.com/v1.0";
pub const DEFAULT_AUTHORITY_URL: &str = "https://login.microsoftonline.com";

/// How the bridge reaches the operation dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// In-process call into the dispatcher, no serialization.
    Direct,
    /// JSON-RPC over HTTP to this server's own `/mcp` endpoint.
    Loopback,
}

impl DeliveryMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" | "inprocess" | "in_process" => Some(DeliveryMode::Direct),
            "loopback" | "http" | "network" => Some(DeliveryMode::Loopback),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Direct => "direct",
            DeliveryMode::Loopback => "loopback",
        }
    }
}

/// What happens once the startup token expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// Re-acquire before an operation when the live context has expired.
    OnExpiry,
    /// Keep the startup context for the whole process lifetime.
    Fixed,
}

impl RefreshPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on_expiry" | "on-expiry" | "refresh" | "auto" => Some(RefreshPolicy::OnExpiry),
            "fixed" | "never" | "off" => Some(RefreshPolicy::Fixed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshPolicy::OnExpiry => "on_expiry",
            RefreshPolicy::Fixed => "fixed",
        }
    }
}

/// Client-credentials application identity. All fields must be present for
/// acquisition to be attempted.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SharePointCredentials {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl SharePointCredentials {
    pub fn is_complete(&self) -> bool {
        self.tenant_id.is_some() && self.client_id.is_some() && self.client_secret.is_some()
    }
}

impl std::fmt::Debug for SharePointCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharePointCredentials")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub app_name: String,
    pub host: String,
    pub port: u16,
    pub debug: bool,
    pub graph_url: String,
    pub authority_url: String,
    pub credentials: SharePointCredentials,
    pub site_url: Option<String>,
    /// Optional document folder inside the site's default drive
    pub folder: Option<String>,
    pub delivery: DeliveryMode,
    pub bridge_timeout: Duration,
    /// Upper bound on one token acquisition; kept below `bridge_timeout`
    pub acquire_timeout: Duration,
    pub refresh: RefreshPolicy,
    pub degraded_ttl: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: "sharepoint-mcp".to_string(),
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            debug: false,
            graph_url: DEFAULT_GRAPH_URL.to_string(),
            authority_url: DEFAULT_AUTHORITY_URL.to_string(),
            credentials: SharePointCredentials::default(),
            site_url: None,
            folder: None,
            delivery: DeliveryMode::Direct,
            bridge_timeout: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(5),
            refresh: RefreshPolicy::OnExpiry,
            degraded_ttl: Duration::from_secs(10),
        }
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like `from_env`, but hands back the fallback warnings instead of logging
    /// them, for callers that initialise logging from the settings.
    pub fn from_env_with_warnings() -> (Self, Vec<String>) {
        Self::collect(|name| std::env::var(name).ok())
    }

    /// Build settings from an arbitrary variable lookup. Unparseable values fall
    /// back to the defaults with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let (settings, warnings) = Self::collect(lookup);
        for w in &warnings {
            tracing::warn!(target: "startup", "{}", w);
        }
        settings
    }

    pub fn collect<F>(lookup: F) -> (Self, Vec<String>)
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Settings::default();
        let get = |name: &str| non_empty(lookup(name));
        let mut warnings = Vec::new();

        let port = match get("PORT") {
            Some(v) => v.parse::<u16>().unwrap_or_else(|_| {
                warnings.push(format!("ignoring invalid PORT={:?}, using {}", v, d.port));
                d.port
            }),
            None => d.port,
        };
        let delivery = match get("DOCBRIDGE_DELIVERY") {
            Some(v) => DeliveryMode::parse(&v).unwrap_or_else(|| {
                warnings.push(format!("unknown DOCBRIDGE_DELIVERY={:?}, using {}", v, d.delivery.as_str()));
                d.delivery
            }),
            None => d.delivery,
        };
        let refresh = match get("DOCBRIDGE_REFRESH") {
            Some(v) => RefreshPolicy::parse(&v).unwrap_or_else(|| {
                warnings.push(format!("unknown DOCBRIDGE_REFRESH={:?}, using {}", v, d.refresh.as_str()));
                d.refresh
            }),
            None => d.refresh,
        };
        let debug = match get("DEBUG") {
            Some(v) => parse_bool(&v).unwrap_or_else(|| {
                warnings.push(format!("ignoring invalid DEBUG={:?}", v));
                d.debug
            }),
            None => d.debug,
        };
        let millis = |name: &str| get(name).and_then(|v| v.parse::<u64>().ok()).filter(|ms| *ms > 0).map(Duration::from_millis);
        let bridge_timeout = millis("DOCBRIDGE_BRIDGE_TIMEOUT_MS").unwrap_or(d.bridge_timeout);
        let mut acquire_timeout = millis("DOCBRIDGE_ACQUIRE_TIMEOUT_MS").unwrap_or(d.acquire_timeout);
        if acquire_timeout >= bridge_timeout {
            let clamped = bridge_timeout / 2;
            warnings.push(format!(
                "token acquisition timeout {} ms is not below the bridge timeout {} ms, using {} ms",
                acquire_timeout.as_millis(),
                bridge_timeout.as_millis(),
                clamped.as_millis()
            ));
            acquire_timeout = clamped;
        }
        let degraded_ttl = get("DOCBRIDGE_DEGRADED_TTL_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(d.degraded_ttl);

        let settings = Settings {
            app_name: get("APP_NAME").unwrap_or(d.app_name),
            host: get("HOST").unwrap_or(d.host),
            port,
            debug,
            graph_url: get("GRAPH_URL").map(|u| u.trim_end_matches('/').to_string()).unwrap_or(d.graph_url),
            authority_url: get("AUTHORITY_URL").map(|u| u.trim_end_matches('/').to_string()).unwrap_or(d.authority_url),
            credentials: SharePointCredentials {
                tenant_id: get("SHAREPOINT_TENANT_ID"),
                client_id: get("SHAREPOINT_CLIENT_ID"),
                client_secret: get("SHAREPOINT_CLIENT_SECRET"),
            },
            site_url: get("SHAREPOINT_SITE_URL"),
            folder: get("SHAREPOINT_FOLDER").map(|f| f.trim_matches('/').to_string()).filter(|f| !f.is_empty()),
            delivery,
            bridge_timeout,
            acquire_timeout,
            refresh,
            degraded_ttl,
        };
        (settings, warnings)
    }

    pub fn bind_addr(&self) -> String { format!("{}:{}", self.host, self.port) }
}

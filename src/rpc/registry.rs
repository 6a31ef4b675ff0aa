//! Operation registry and dispatcher.
//!
//! The registry is a fixed table from `Operation` to handler function, built once
//! at startup. The dispatcher resolves an `RpcRequest` against it using the live
//! session, and also answers the MCP housekeeping methods (`initialize`, `ping`,
//! `tools/list`, `tools/call`).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::envelope::{RpcRequest, RpcResponse, JSONRPC_VERSION};
use crate::error::{codes, OperationError};
use crate::repository::DocumentRepository;
use crate::session::{SessionContext, SessionLifecycle};

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub type Params = Map<String, Value>;

/// Handler signature: session owner, repository and call parameters in, plain
/// JSON value or typed error out. Handlers validate their parameters before
/// asking for the session.
pub type Handler =
    fn(Arc<SessionLifecycle>, Arc<dyn DocumentRepository>, Params) -> BoxFuture<'static, Result<Value, OperationError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListFiles,
    GetFileContent,
    GetSiteInfo,
}

impl Operation {
    pub const ALL: [Operation; 3] = [Operation::ListFiles, Operation::GetFileContent, Operation::GetSiteInfo];

    pub fn from_method(name: &str) -> Option<Self> {
        match name {
            "list_files" => Some(Operation::ListFiles),
            "get_file_content" => Some(Operation::GetFileContent),
            "get_site_info" => Some(Operation::GetSiteInfo),
            _ => None,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Operation::ListFiles => "list_files",
            Operation::GetFileContent => "get_file_content",
            Operation::GetSiteInfo => "get_site_info",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Operation::ListFiles => "List the files in the SharePoint document library",
            Operation::GetFileContent => "Return the raw content of a single file",
            Operation::GetSiteInfo => "Get basic information about the SharePoint site",
        }
    }

    pub fn input_schema(&self) -> Value {
        match self {
            Operation::ListFiles => json!({
                "type": "object",
                "properties": {"folder": {"type": "string", "description": "Sub-folder to list"}},
            }),
            Operation::GetFileContent => json!({
                "type": "object",
                "properties": {"filename": {"type": "string", "description": "File name or drive-relative path"}},
                "required": ["filename"],
            }),
            Operation::GetSiteInfo => json!({"type": "object", "properties": {}}),
        }
    }
}

fn required_str(params: &Params, name: &str) -> Result<String, OperationError> {
    match params.get(name) {
        None | Some(Value::Null) => Err(OperationError::MissingParam(name.to_string())),
        Some(Value::String(s)) if s.trim().is_empty() => Err(OperationError::MissingParam(name.to_string())),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(OperationError::InvalidParam { name: name.to_string(), message: "expected a string".to_string() }),
    }
}

fn optional_str(params: &Params, name: &str) -> Result<Option<String>, OperationError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(OperationError::InvalidParam { name: name.to_string(), message: "expected a string".to_string() }),
    }
}

fn to_value<T: serde::Serialize>(v: T) -> Result<Value, OperationError> {
    serde_json::to_value(v).map_err(|e| OperationError::Internal(format!("serialization error: {e}")))
}

/// The session an operation runs with; fails fast when it is not valid.
async fn live_session(sessions: &SessionLifecycle) -> Result<Arc<SessionContext>, OperationError> {
    let ctx = sessions.session().await;
    ctx.ensure_valid(Utc::now())?;
    Ok(ctx)
}

fn list_files(sessions: Arc<SessionLifecycle>, repo: Arc<dyn DocumentRepository>, params: Params) -> BoxFuture<'static, Result<Value, OperationError>> {
    async move {
        let folder = optional_str(&params, "folder")?;
        let ctx = live_session(&sessions).await?;
        let files = repo.list_files(&ctx, folder.as_deref()).await?;
        to_value(files)
    }
    .boxed()
}

fn get_file_content(sessions: Arc<SessionLifecycle>, repo: Arc<dyn DocumentRepository>, params: Params) -> BoxFuture<'static, Result<Value, OperationError>> {
    async move {
        let filename = required_str(&params, "filename")?;
        let ctx = live_session(&sessions).await?;
        let content = repo.get_file_content(&ctx, &filename).await?;
        to_value(content)
    }
    .boxed()
}

fn get_site_info(sessions: Arc<SessionLifecycle>, repo: Arc<dyn DocumentRepository>, _params: Params) -> BoxFuture<'static, Result<Value, OperationError>> {
    async move {
        let ctx = live_session(&sessions).await?;
        let info = repo.get_site_info(&ctx).await?;
        to_value(info)
    }
    .boxed()
}

/// Fixed name -> handler table. Never mutated after construction.
pub struct OperationRegistry {
    handlers: HashMap<Operation, Handler>,
}

impl OperationRegistry {
    pub fn standard() -> Self {
        let mut handlers: HashMap<Operation, Handler> = HashMap::new();
        handlers.insert(Operation::ListFiles, list_files);
        handlers.insert(Operation::GetFileContent, get_file_content);
        handlers.insert(Operation::GetSiteInfo, get_site_info);
        Self { handlers }
    }

    pub fn resolve(&self, method: &str) -> Option<(Operation, Handler)> {
        let op = Operation::from_method(method)?;
        self.handlers.get(&op).map(|h| (op, *h))
    }

    pub fn operations(&self) -> Vec<Operation> {
        Operation::ALL.iter().copied().filter(|op| self.handlers.contains_key(op)).collect()
    }
}

/// Resolves structured requests against the registry with the live session.
pub struct Dispatcher {
    registry: OperationRegistry,
    sessions: Arc<SessionLifecycle>,
    repository: Arc<dyn DocumentRepository>,
    server_name: String,
}

impl Dispatcher {
    pub fn new(registry: OperationRegistry, sessions: Arc<SessionLifecycle>, repository: Arc<dyn DocumentRepository>, server_name: &str) -> Self {
        Self { registry, sessions, repository, server_name: server_name.to_string() }
    }

    pub fn sessions(&self) -> &Arc<SessionLifecycle> { &self.sessions }

    /// Handle one request. Returns `None` for notifications.
    pub async fn dispatch(&self, req: RpcRequest) -> Option<RpcResponse> {
        let Some(id) = req.id.clone() else {
            debug!(target: "rpc", "notification {}", req.method);
            return None;
        };
        if req.jsonrpc != JSONRPC_VERSION {
            return Some(RpcResponse::failure(id, codes::INVALID_REQUEST, format!("unsupported jsonrpc version: {}", req.jsonrpc)));
        }
        debug!(target: "rpc", method = %req.method, id = %id, "dispatch");
        let resp = match req.method.as_str() {
            "initialize" => RpcResponse::success(id, self.initialize_result()),
            "ping" => RpcResponse::success(id, json!({})),
            "tools/list" => RpcResponse::success(id, self.tools_list()),
            "tools/call" => self.tools_call(id, req.params).await,
            method => match self.call(method, req.params).await {
                Ok(v) => RpcResponse::success(id, v),
                Err((code, message)) => RpcResponse::failure(id, code, message),
            },
        };
        Some(resp)
    }

    /// Run one named operation. Unknown names are rejected before any session work.
    pub async fn call(&self, method: &str, params: Params) -> Result<Value, (i64, String)> {
        let Some((op, handler)) = self.registry.resolve(method) else {
            warn!(target: "rpc", "unknown method {}", method);
            return Err((codes::METHOD_NOT_FOUND, format!("unknown method: {method}")));
        };
        handler(self.sessions.clone(), self.repository.clone(), params).await.map_err(|e| {
            debug!(target: "rpc", "{} failed: {}", op.method(), e);
            (e.code(), e.to_string())
        })
    }

    async fn tools_call(&self, id: Value, params: Params) -> RpcResponse {
        let Some(name) = params.get("name").and_then(|v| v.as_str()) else {
            return RpcResponse::failure(id, codes::INVALID_PARAMS, "tools/call requires a string 'name'");
        };
        let arguments = match params.get("arguments") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(m)) => m.clone(),
            Some(_) => return RpcResponse::failure(id, codes::INVALID_PARAMS, "tools/call 'arguments' must be an object"),
        };
        match self.call(name, arguments).await {
            Ok(v) => RpcResponse::success(id, v),
            Err((code, message)) => RpcResponse::failure(id, code, message),
        }
    }

    fn initialize_result(&self) -> Value {
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {"tools": {"listChanged": false}},
            "serverInfo": {"name": self.server_name, "version": SERVER_VERSION},
        })
    }

    fn tools_list(&self) -> Value {
        let tools: Vec<Value> = self
            .registry
            .operations()
            .into_iter()
            .map(|op| json!({"name": op.method(), "description": op.description(), "inputSchema": op.input_schema()}))
            .collect();
        json!({ "tools": tools })
    }
}

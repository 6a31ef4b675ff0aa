//! The two ways a bridged request reaches the dispatcher: a direct in-process
//! call, or a JSON-RPC POST to this server's own structured endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;

use super::envelope::{RpcRequest, RpcResponse};
use super::registry::Dispatcher;
use crate::error::{codes, BridgeError};

#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, req: RpcRequest) -> Result<RpcResponse, BridgeError>;

    fn name(&self) -> &'static str;
}

/// Hands the request straight to the dispatcher; nothing is serialized.
pub struct DirectDelivery {
    dispatcher: Arc<Dispatcher>,
}

impl DirectDelivery {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self { Self { dispatcher } }
}

#[async_trait]
impl Delivery for DirectDelivery {
    async fn deliver(&self, req: RpcRequest) -> Result<RpcResponse, BridgeError> {
        self.dispatcher
            .dispatch(req)
            .await
            .ok_or_else(|| BridgeError::new(codes::INVALID_REQUEST, "request without id produced no response"))
    }

    fn name(&self) -> &'static str { "direct" }
}

/// POSTs the request to a structured-RPC endpoint over HTTP. Connect and total
/// time are both bounded so a listener that is not bound yet fails fast.
pub struct LoopbackDelivery {
    client: reqwest::Client,
    endpoint: Url,
}

impl LoopbackDelivery {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, BridgeError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| BridgeError::transport(format!("failed to build loopback client: {e}")))?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url { &self.endpoint }
}

fn classify(e: reqwest::Error, endpoint: &Url) -> BridgeError {
    if e.is_timeout() {
        BridgeError::timeout(format!("structured-rpc call to {endpoint} timed out"))
    } else if e.is_connect() {
        BridgeError::transport(format!("structured-rpc endpoint {endpoint} unreachable: {e}"))
    } else if e.is_decode() {
        BridgeError::transport(format!("malformed structured-rpc response: {e}"))
    } else {
        BridgeError::transport(format!("structured-rpc call failed: {e}"))
    }
}

#[async_trait]
impl Delivery for LoopbackDelivery {
    async fn deliver(&self, req: RpcRequest) -> Result<RpcResponse, BridgeError> {
        let resp = self.client
            .post(self.endpoint.clone())
            .json(&req)
            .send()
            .await
            .map_err(|e| classify(e, &self.endpoint))?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| classify(e, &self.endpoint))?;
        match serde_json::from_slice::<RpcResponse>(&body) {
            Ok(envelope) => Ok(envelope),
            Err(e) if status.is_success() => Err(BridgeError::transport(format!("malformed structured-rpc response: {e}"))),
            Err(_) => Err(BridgeError::transport(format!("structured-rpc endpoint answered HTTP {}", status.as_u16()))),
        }
    }

    fn name(&self) -> &'static str { "loopback" }
}

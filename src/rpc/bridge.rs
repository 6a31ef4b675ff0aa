use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::delivery::Delivery;
use super::envelope::RpcRequest;
use crate::error::BridgeError;

/// Translates simple calls (method + flat arguments) into structured requests
/// and back. The logic is the same whichever `Delivery` is plugged in.
pub struct Bridge {
    delivery: Arc<dyn Delivery>,
    timeout: Duration,
    next_id: AtomicU64,
}

impl Bridge {
    pub fn new(delivery: Arc<dyn Delivery>, timeout: Duration) -> Self {
        Self { delivery, timeout, next_id: AtomicU64::new(1) }
    }

    pub fn delivery_name(&self) -> &'static str { self.delivery.name() }

    pub fn timeout(&self) -> Duration { self.timeout }

    /// Relay one call. The result comes back unchanged; a structured error keeps
    /// its code and message; transport faults become 502 and an expired bound 504.
    pub async fn call(&self, method: &str, args: Map<String, Value>) -> Result<Value, BridgeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = RpcRequest::new(Value::from(id), method, args);
        debug!(target: "bridge", "-> {} id={} via {}", method, id, self.delivery.name());

        let resp = match tokio::time::timeout(self.timeout, self.delivery.deliver(req)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                warn!(target: "bridge", "{} delivery failed: {}", method, e);
                return Err(e);
            }
            Err(_) => {
                warn!(target: "bridge", "{} timed out after {:?}", method, self.timeout);
                return Err(BridgeError::timeout(format!("{method} timed out after {} ms", self.timeout.as_millis())));
            }
        };

        if resp.id != Value::from(id) {
            return Err(BridgeError::transport(format!("response id {} does not match request id {}", resp.id, id)));
        }
        let out = resp.into_result();
        if let Err(e) = &out {
            debug!(target: "bridge", "<- {} id={} error {}: {}", method, id, e.code, e.message);
        }
        out
    }
}

//! Structured-RPC layer: the JSON-RPC envelope, the fixed operation registry and
//! dispatcher, the two delivery adapters and the bridge that fronts them.

pub mod envelope;
pub mod registry;
pub mod delivery;
pub mod bridge;

pub use envelope::{RpcErrorObject, RpcRequest, RpcResponse, JSONRPC_VERSION};
pub use registry::{Dispatcher, Operation, OperationRegistry};
pub use delivery::{Delivery, DirectDelivery, LoopbackDelivery};
pub use bridge::Bridge;

//! Graph session management: the immutable session context, the credential
//! source that produces it and the lifecycle manager that owns it.
//! Keep the public surface thin and split implementation across sub-modules.

mod context;
mod credential;
mod lifecycle;

pub use context::{is_valid, redact_token, SessionContext, DEGRADED_TOKEN};
pub use credential::{ClientCredentialSource, CredentialSource, Credential};
pub use lifecycle::{acquire_session, Acquisition, SessionLifecycle, DEFAULT_ACQUIRE_TIMEOUT};

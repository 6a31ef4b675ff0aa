use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::context::{redact_token, SessionContext};
use super::credential::CredentialSource;
use crate::config::RefreshPolicy;

pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one acquisition attempt. Both arms carry a usable context.
#[derive(Debug, Clone)]
pub enum Acquisition {
    Ok(SessionContext),
    Degraded(SessionContext),
}

impl Acquisition {
    pub fn is_degraded(&self) -> bool { matches!(self, Acquisition::Degraded(_)) }

    pub fn into_context(self) -> SessionContext {
        match self {
            Acquisition::Ok(ctx) | Acquisition::Degraded(ctx) => ctx,
        }
    }
}

/// Ask the credential source for a token. Never fails: an error or a panic in
/// the source is logged and turned into a degraded context expiring
/// `degraded_ttl` from now.
pub async fn acquire_session(source: &dyn CredentialSource, base_url: &str, degraded_ttl: Duration) -> Acquisition {
    match AssertUnwindSafe(source.acquire()).catch_unwind().await {
        Ok(Ok(cred)) => {
            info!(target: "session", "Authentication successful. Token expiry: {} token={}", cred.expires_at, redact_token(&cred.token));
            Acquisition::Ok(SessionContext::new(cred.token, cred.expires_at, base_url))
        }
        Ok(Err(e)) => {
            error!(target: "session", "Error during SharePoint authentication: {}", e);
            Acquisition::Degraded(SessionContext::degraded(base_url, Utc::now(), degraded_ttl))
        }
        Err(panic_payload) => {
            let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() { *s }
                      else if let Some(s) = panic_payload.downcast_ref::<String>() { s.as_str() }
                      else { "panic" };
            error!(target: "panic", "credential source panicked: {}", msg);
            Acquisition::Degraded(SessionContext::degraded(base_url, Utc::now(), degraded_ttl))
        }
    }
}

/// `acquire_session` bounded by `limit`; running out of time degrades too.
async fn acquire_bounded(source: Arc<dyn CredentialSource>, base_url: String, degraded_ttl: Duration, limit: Duration) -> Acquisition {
    match tokio::time::timeout(limit, acquire_session(source.as_ref(), &base_url, degraded_ttl)).await {
        Ok(acquired) => acquired,
        Err(_) => {
            error!(target: "session", "Error during SharePoint authentication: token request timed out after {:?}", limit);
            Acquisition::Degraded(SessionContext::degraded(base_url, Utc::now(), degraded_ttl))
        }
    }
}

type PendingRefresh = Shared<BoxFuture<'static, Arc<SessionContext>>>;

/// State shared with detached refresh tasks.
struct Slot {
    current: RwLock<Arc<SessionContext>>,
    /// At most one refresh in flight. Lock order: `inflight` before `current`.
    inflight: Mutex<Option<PendingRefresh>>,
    stopped: AtomicBool,
}

impl Slot {
    fn current(&self) -> Arc<SessionContext> { self.current.read().clone() }

    fn install(&self, ctx: SessionContext) -> Arc<SessionContext> {
        let ctx = Arc::new(ctx);
        *self.current.write() = ctx.clone();
        ctx
    }
}

/// Owns the single live `SessionContext` for the lifetime of the server.
///
/// Readers take a cheap `Arc` clone of the current context. Replacement (start,
/// refresh, stop) swaps the whole `Arc`; the context itself is never mutated.
/// A refresh runs on its own task, so a caller that gives up waiting does not
/// cancel it.
pub struct SessionLifecycle {
    source: Arc<dyn CredentialSource>,
    base_url: String,
    policy: RefreshPolicy,
    degraded_ttl: Duration,
    acquire_timeout: Duration,
    slot: Arc<Slot>,
    started: AtomicBool,
}

impl SessionLifecycle {
    pub fn new(source: Arc<dyn CredentialSource>, base_url: &str, policy: RefreshPolicy, degraded_ttl: Duration) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        // Unusable until start() installs a real context
        let placeholder = SessionContext::degraded(base_url.clone(), Utc::now(), Duration::ZERO);
        Self {
            source,
            base_url,
            policy,
            degraded_ttl,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            slot: Arc::new(Slot {
                current: RwLock::new(Arc::new(placeholder)),
                inflight: Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
            started: AtomicBool::new(false),
        }
    }

    /// Bound every token acquisition to `limit`.
    pub fn with_acquire_timeout(mut self, limit: Duration) -> Self {
        self.acquire_timeout = limit;
        self
    }

    pub fn policy(&self) -> RefreshPolicy { self.policy }

    pub fn acquire_timeout(&self) -> Duration { self.acquire_timeout }

    /// Acquire the startup context. Always completes; a failed or timed out
    /// acquisition installs the degraded context instead.
    pub async fn start(&self) -> Arc<SessionContext> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!(target: "session", "session lifecycle already started; returning current context");
            return self.current();
        }
        info!(target: "session", "Initializing SharePoint connection...");
        debug!(target: "session", "Attempting to get authentication context...");
        let acquired = acquire_bounded(self.source.clone(), self.base_url.clone(), self.degraded_ttl, self.acquire_timeout).await;
        if acquired.is_degraded() {
            warn!(target: "session", "starting with degraded session; repository operations will fail until a token is acquired");
        }
        self.slot.install(acquired.into_context())
    }

    /// The live context, whatever its validity.
    pub fn current(&self) -> Arc<SessionContext> { self.slot.current() }

    /// The context an operation should run with. Under `OnExpiry`, an expired
    /// context is re-acquired first; a degraded context is retried only after its
    /// forced expiry has passed. The result may still be invalid.
    pub async fn session(&self) -> Arc<SessionContext> {
        let ctx = self.current();
        if !self.needs_refresh(&ctx) {
            return ctx;
        }

        let pending = {
            let mut inflight = self.slot.inflight.lock();
            // Another task may have refreshed meanwhile
            let ctx = self.current();
            if !self.needs_refresh(&ctx) {
                return ctx;
            }
            match inflight.as_ref() {
                Some(pending) => pending.clone(),
                None => {
                    let pending = self.spawn_refresh(&ctx);
                    *inflight = Some(pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    /// Start a detached re-acquisition. The task installs its result itself and
    /// clears the in-flight marker.
    fn spawn_refresh(&self, expired: &SessionContext) -> PendingRefresh {
        info!(target: "session", "session expired at {}; re-acquiring token", expired.expires_at());
        let slot = self.slot.clone();
        let source = self.source.clone();
        let base_url = self.base_url.clone();
        let (ttl, limit) = (self.degraded_ttl, self.acquire_timeout);
        let task = tokio::spawn(async move {
            let acquired = acquire_bounded(source, base_url, ttl, limit).await;
            let mut inflight = slot.inflight.lock();
            inflight.take();
            if slot.stopped.load(Ordering::SeqCst) {
                return slot.current();
            }
            slot.install(acquired.into_context())
        });

        let slot = self.slot.clone();
        async move {
            match task.await {
                Ok(ctx) => ctx,
                Err(e) => {
                    error!(target: "session", "token refresh task failed: {}", e);
                    slot.inflight.lock().take();
                    slot.current()
                }
            }
        }
        .boxed()
        .shared()
    }

    fn needs_refresh(&self, ctx: &SessionContext) -> bool {
        self.policy == RefreshPolicy::OnExpiry
            && self.started.load(Ordering::SeqCst)
            && !self.slot.stopped.load(Ordering::SeqCst)
            && ctx.is_expired(Utc::now())
    }

    /// Tear down the session. Safe to call more than once; only the first call acts.
    pub async fn stop(&self) {
        if self.slot.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "session", "Ending SharePoint connection...");
        {
            // Serialised with a finishing refresh so it cannot reinstall a token
            let _inflight = self.slot.inflight.lock();
            self.slot.install(SessionContext::degraded(self.base_url.clone(), Utc::now(), Duration::ZERO));
        }
        self.source.release().await;
    }

    pub fn is_stopped(&self) -> bool { self.slot.stopped.load(Ordering::SeqCst) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthError;
    use crate::session::Credential;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    const BASE: &str = "https://graph.example/v1.0";

    /// Hands out scripted results in order, repeating the last one.
    struct Scripted {
        results: parking_lot::Mutex<Vec<Result<Credential, AuthError>>>,
        calls: AtomicUsize,
        released: AtomicBool,
    }

    impl Scripted {
        fn new(results: Vec<Result<Credential, AuthError>>) -> Arc<Self> {
            Arc::new(Self { results: parking_lot::Mutex::new(results), calls: AtomicUsize::new(0), released: AtomicBool::new(false) })
        }
        fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
    }

    #[async_trait]
    impl CredentialSource for Scripted {
        async fn acquire(&self) -> Result<Credential, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut r = self.results.lock();
            if r.len() > 1 { r.remove(0) } else { r[0].clone() }
        }
        async fn release(&self) { self.released.store(true, Ordering::SeqCst); }
    }

    fn token_valid_for(token: &str, secs: i64) -> Result<Credential, AuthError> {
        Ok(Credential { token: token.to_string(), expires_at: Utc::now() + chrono::Duration::seconds(secs) })
    }

    fn lifecycle(src: Arc<Scripted>, policy: RefreshPolicy) -> SessionLifecycle {
        SessionLifecycle::new(src, BASE, policy, Duration::from_secs(10))
    }

    #[tokio::test]
    async fn start_success_installs_real_context() {
        let src = Scripted::new(vec![token_valid_for("abc", 3600)]);
        let lc = lifecycle(src.clone(), RefreshPolicy::OnExpiry);
        let ctx = lc.start().await;
        assert_eq!(ctx.token(), "abc");
        assert!(ctx.is_valid(Utc::now()));
        assert_eq!(ctx.base_url(), BASE);
        assert!(Arc::ptr_eq(&ctx, &lc.current()));
    }

    #[tokio::test]
    async fn start_failure_installs_degraded_context() {
        let src = Scripted::new(vec![Err(AuthError::Network("connection refused".into()))]);
        let lc = lifecycle(src.clone(), RefreshPolicy::OnExpiry);
        let ctx = lc.start().await;
        assert!(ctx.is_degraded());
        assert!(!ctx.is_valid(Utc::now()));
        let remaining = ctx.expires_at() - Utc::now();
        assert!(remaining <= chrono::Duration::seconds(10));
        assert!(remaining > chrono::Duration::seconds(5));
    }

    #[tokio::test]
    async fn acquisition_result_is_explicit() {
        let ok = Scripted::new(vec![token_valid_for("t", 60)]);
        assert!(!acquire_session(ok.as_ref(), BASE, Duration::from_secs(10)).await.is_degraded());
        let bad = Scripted::new(vec![Err(AuthError::Rejected { status: 401, message: "bad secret".into() })]);
        let acq = acquire_session(bad.as_ref(), BASE, Duration::from_secs(10)).await;
        assert!(acq.is_degraded());
        assert_eq!(acq.into_context().token(), "error");
    }

    #[tokio::test]
    async fn unexpired_session_is_not_refreshed() {
        let src = Scripted::new(vec![token_valid_for("abc", 3600)]);
        let lc = lifecycle(src.clone(), RefreshPolicy::OnExpiry);
        lc.start().await;
        let a = lc.session().await;
        let b = lc.session().await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(src.calls(), 1);
    }

    #[tokio::test]
    async fn expired_session_is_refreshed_on_expiry_policy() {
        let src = Scripted::new(vec![token_valid_for("old", -1), token_valid_for("new", 3600)]);
        let lc = lifecycle(src.clone(), RefreshPolicy::OnExpiry);
        let first = lc.start().await;
        assert_eq!(first.token(), "old");
        let ctx = lc.session().await;
        assert_eq!(ctx.token(), "new");
        assert!(ctx.is_valid(Utc::now()));
        assert_eq!(src.calls(), 2);
        // The old context value is untouched
        assert_eq!(first.token(), "old");
    }

    #[tokio::test]
    async fn fixed_policy_never_refreshes() {
        let src = Scripted::new(vec![token_valid_for("old", -1), token_valid_for("new", 3600)]);
        let lc = lifecycle(src.clone(), RefreshPolicy::Fixed);
        lc.start().await;
        let ctx = lc.session().await;
        assert_eq!(ctx.token(), "old");
        assert!(!ctx.is_valid(Utc::now()));
        assert_eq!(src.calls(), 1);
    }

    #[tokio::test]
    async fn degraded_session_is_not_retried_before_forced_expiry() {
        let src = Scripted::new(vec![Err(AuthError::Network("down".into())), token_valid_for("late", 3600)]);
        let lc = lifecycle(src.clone(), RefreshPolicy::OnExpiry);
        lc.start().await;
        let ctx = lc.session().await;
        assert!(ctx.is_degraded());
        assert_eq!(src.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_refresh_acquires_once() {
        let src = Scripted::new(vec![token_valid_for("old", -1), token_valid_for("new", 3600)]);
        let lc = Arc::new(lifecycle(src.clone(), RefreshPolicy::OnExpiry));
        lc.start().await;
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let lc = lc.clone();
            tasks.push(tokio::spawn(async move { lc.session().await.token().to_string() }));
        }
        for t in tasks {
            assert_eq!(t.await.unwrap(), "new");
        }
        assert_eq!(src.calls(), 2);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_invalidates() {
        let src = Scripted::new(vec![token_valid_for("abc", 3600)]);
        let lc = lifecycle(src.clone(), RefreshPolicy::OnExpiry);
        lc.start().await;
        lc.stop().await;
        lc.stop().await;
        assert!(lc.is_stopped());
        assert!(src.released.load(Ordering::SeqCst));
        let ctx = lc.session().await;
        assert!(ctx.is_degraded());
        assert_eq!(src.calls(), 1);
    }

    /// Sleeps before answering; the first call can be scripted to fail fast.
    struct Slow {
        delay: Duration,
        fail_first: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialSource for Slow {
        async fn acquire(&self) -> Result<Credential, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 && self.fail_first {
                return Err(AuthError::Network("down".into()));
            }
            tokio::time::sleep(self.delay).await;
            if n == 0 {
                return token_valid_for("old", -1);
            }
            token_valid_for("new", 3600)
        }
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_cancel_refresh() {
        let src = Arc::new(Slow { delay: Duration::from_millis(100), fail_first: false, calls: AtomicUsize::new(0) });
        let lc = SessionLifecycle::new(src.clone(), BASE, RefreshPolicy::OnExpiry, Duration::from_secs(10));
        lc.start().await;
        assert_eq!(lc.current().token(), "old");

        assert!(tokio::time::timeout(Duration::from_millis(10), lc.session()).await.is_err());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(lc.current().token(), "new");
        assert_eq!(src.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn hung_refresh_degrades_within_acquire_timeout() {
        let src = Arc::new(Slow { delay: Duration::from_secs(60), fail_first: true, calls: AtomicUsize::new(0) });
        let lc = SessionLifecycle::new(src.clone(), BASE, RefreshPolicy::OnExpiry, Duration::from_millis(200))
            .with_acquire_timeout(Duration::from_millis(30));
        assert!(lc.start().await.is_degraded());
        tokio::time::sleep(Duration::from_millis(250)).await;

        let started = std::time::Instant::now();
        let ctx = lc.session().await;
        assert!(ctx.is_degraded());
        assert!(!ctx.is_valid(Utc::now()));
        assert!(started.elapsed() < Duration::from_secs(2));
        // The fresh sentinel holds off further attempts until it expires
        assert!(lc.session().await.is_degraded());
        assert_eq!(src.calls.load(Ordering::SeqCst), 2);
    }

    struct Panicking;

    #[async_trait]
    impl CredentialSource for Panicking {
        async fn acquire(&self) -> Result<Credential, AuthError> {
            panic!("token cache poisoned");
        }
    }

    #[tokio::test]
    async fn panicking_source_degrades_instead_of_aborting_start() {
        let lc = SessionLifecycle::new(Arc::new(Panicking), BASE, RefreshPolicy::OnExpiry, Duration::from_secs(10));
        let ctx = lc.start().await;
        assert!(ctx.is_degraded());
        assert_eq!(ctx.token(), "error");
    }

    #[tokio::test]
    async fn stop_after_failed_start_still_runs() {
        let src = Scripted::new(vec![Err(AuthError::NotConfigured("missing".into()))]);
        let lc = lifecycle(src.clone(), RefreshPolicy::OnExpiry);
        lc.start().await;
        lc.stop().await;
        assert!(src.released.load(Ordering::SeqCst));
    }
}

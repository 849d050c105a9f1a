//! Lazy, keyed backend connections.
//!
//! At most one persistent connection exists per backend id. First use of an id goes through a
//! per-id `OnceCell`, so concurrent callers coalesce onto a single `connect`. `per_call`
//! backends bypass the cache and are closed when the call scope ends.

use crate::backend::{BackendConnector, Capability, ConnectionHandle, TransportParams};
use crate::credentials::CredentialStatus;
use crate::error::{GatewayError, Result};
use crate::oauth::{AuthorizationChallenge, AuthorizationFlow};
use crate::registry::{BackendDescriptor, BackendRegistry, Lifecycle, TransportKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Result of a backend call at the gateway boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Completed(Value),
    AuthorizationRequired(AuthorizationChallenge),
}

impl CallOutcome {
    #[must_use]
    pub fn into_json(self) -> Value {
        match self {
            Self::Completed(v) => v,
            Self::AuthorizationRequired(c) => serde_json::to_value(c).unwrap_or(Value::Null),
        }
    }
}

/// Anything that can issue a single backend call. The chain executor only needs this.
#[async_trait]
pub trait ToolCaller: Send + Sync {
    async fn call(
        &self,
        backend_id: &str,
        operation: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallOutcome>;
}

type Slot = Arc<OnceCell<ConnectionHandle>>;

pub struct ConnectionManager {
    registry: Arc<BackendRegistry>,
    connector: Arc<dyn BackendConnector>,
    authorization: Arc<AuthorizationFlow>,
    /// `backend_id` -> slot holding the live persistent handle
    slots: Mutex<HashMap<String, Slot>>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(
        registry: Arc<BackendRegistry>,
        connector: Arc<dyn BackendConnector>,
        authorization: Arc<AuthorizationFlow>,
    ) -> Self {
        Self {
            registry,
            connector,
            authorization,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached handle for `id`, opening (and caching) it on first use.
    ///
    /// `per_call` backends always get a fresh, uncached handle.
    ///
    /// # Errors
    ///
    /// `UnknownBackend`, `UnsupportedTransport`, `Config` for incomplete descriptors, or the
    /// connector's failure.
    pub async fn connect(&self, id: &str) -> Result<ConnectionHandle> {
        let descriptor = self.registry.resolve(id)?;
        self.connect_descriptor(&descriptor).await
    }

    async fn connect_descriptor(&self, descriptor: &BackendDescriptor) -> Result<ConnectionHandle> {
        if descriptor.lifecycle == Lifecycle::PerCall {
            return self.open(descriptor).await;
        }

        let slot = self
            .slots
            .lock()
            .entry(descriptor.id.clone())
            .or_default()
            .clone();
        let handle = slot.get_or_try_init(|| self.open(descriptor)).await?;
        Ok(handle.clone())
    }

    async fn open(&self, descriptor: &BackendDescriptor) -> Result<ConnectionHandle> {
        let params = self.transport_params(descriptor)?;
        tracing::info!(
            backend_id = %descriptor.id,
            transport = %descriptor.transport.as_str(),
            "connecting to backend"
        );
        let handle = self.connector.connect(&descriptor.id, params).await?;
        tracing::debug!(backend_id = %descriptor.id, "backend connected");
        Ok(handle)
    }

    fn transport_params(&self, descriptor: &BackendDescriptor) -> Result<TransportParams> {
        match &descriptor.transport {
            TransportKind::Stdio => {
                let command = descriptor.command.clone().ok_or_else(|| {
                    GatewayError::Config(format!(
                        "backend '{}' uses stdio transport but has no command",
                        descriptor.id
                    ))
                })?;
                Ok(TransportParams::Process {
                    command,
                    args: descriptor.args.clone(),
                    env: descriptor.env.clone(),
                })
            }
            TransportKind::StreamableHttp => {
                let url = descriptor.url.clone().ok_or_else(|| {
                    GatewayError::Config(format!(
                        "backend '{}' uses http transport but has no url",
                        descriptor.id
                    ))
                })?;
                let bearer_token = match self.authorization.credentials().status(&descriptor.id) {
                    CredentialStatus::Valid(c) => Some(c.access_token),
                    CredentialStatus::Missing | CredentialStatus::Expired => None,
                };
                Ok(TransportParams::StreamableHttp { url, bearer_token })
            }
            TransportKind::Other(t) => Err(GatewayError::UnsupportedTransport {
                backend_id: descriptor.id.clone(),
                transport: t.clone(),
            }),
        }
    }

    /// Call `operation` on backend `id`.
    ///
    /// Authorization failures come back as [`CallOutcome::AuthorizationRequired`] when the
    /// backend has authorization settings; everything else propagates unchanged.
    ///
    /// # Errors
    ///
    /// Any connect or call failure that is not converted into a challenge.
    pub async fn call(
        &self,
        id: &str,
        operation: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallOutcome> {
        let descriptor = self.registry.resolve(id)?;

        if descriptor.authorization.is_some()
            && matches!(
                self.authorization.credentials().status(id),
                CredentialStatus::Expired
            )
        {
            tracing::info!(backend_id = %id, "cached credential expired; re-authorizing");
            self.evict(id).await;
            if let Some(challenge) = self.challenge(id) {
                return Ok(CallOutcome::AuthorizationRequired(challenge));
            }
        }

        match self.call_scoped(&descriptor, operation, arguments).await {
            Ok(v) => Ok(CallOutcome::Completed(v)),
            Err(e) if e.is_unauthorized() => {
                let Some(challenge) = self.challenge(id) else {
                    return Err(e);
                };
                tracing::info!(backend_id = %id, operation = %operation, "backend requires authorization");
                self.authorization.credentials().remove(id);
                self.evict(id).await;
                Ok(CallOutcome::AuthorizationRequired(challenge))
            }
            Err(e) => Err(e),
        }
    }

    async fn call_scoped(
        &self,
        descriptor: &BackendDescriptor,
        operation: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value> {
        let scope = CallScope::acquire(self, descriptor).await?;
        let result = scope.handle().call(operation, arguments).await;
        scope.release().await;
        result
    }

    fn challenge(&self, id: &str) -> Option<AuthorizationChallenge> {
        match self.authorization.initiate(id) {
            Ok(Some(authorization_url)) => Some(AuthorizationChallenge {
                authorization_url,
                backend_id: id.to_string(),
            }),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(backend_id = %id, error = %e, "failed to initiate authorization");
                None
            }
        }
    }

    /// List operations advertised by backend `id`.
    ///
    /// Sessions that do not support listing yield an empty list.
    ///
    /// # Errors
    ///
    /// Connect failures, or a failure of the listing call itself.
    pub async fn list_capabilities(&self, id: &str) -> Result<Vec<Capability>> {
        let descriptor = self.registry.resolve(id)?;
        let scope = CallScope::acquire(self, &descriptor).await?;
        let result = if scope.handle().capabilities().list_tools {
            scope.handle().list_capabilities().await
        } else {
            Ok(Vec::new())
        };
        scope.release().await;
        result
    }

    /// Drop and close the cached handle for `id`, if any.
    pub async fn evict(&self, id: &str) {
        let slot = self.slots.lock().remove(id);
        if let Some(handle) = slot.and_then(|s| s.get().cloned())
            && let Err(e) = handle.close().await
        {
            tracing::warn!(backend_id = %id, error = %e, "failed to close evicted connection");
        }
    }

    /// Close every cached handle. Never fails; close errors are logged and returned.
    pub async fn close_all(&self) -> Vec<(String, GatewayError)> {
        let slots: Vec<(String, Slot)> = self.slots.lock().drain().collect();

        let closes = slots.into_iter().filter_map(|(id, slot)| {
            let handle = slot.get().cloned()?;
            Some(async move { (id, handle.close().await) })
        });
        let results = futures::future::join_all(closes).await;

        let mut failures = Vec::new();
        for (id, result) in results {
            match result {
                Ok(()) => tracing::debug!(backend_id = %id, "connection closed"),
                Err(e) => {
                    tracing::warn!(backend_id = %id, error = %e, "failed to close connection");
                    failures.push((id, e));
                }
            }
        }
        failures
    }

    /// Ids with a live cached handle.
    #[must_use]
    pub fn cached_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl ToolCaller for ConnectionManager {
    async fn call(
        &self,
        backend_id: &str,
        operation: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallOutcome> {
        ConnectionManager::call(self, backend_id, operation, arguments).await
    }
}

/// A handle acquired for the duration of one call.
///
/// Ephemeral (`per_call`) handles are closed on `release`, or from `Drop` if the call future is
/// cancelled first.
struct CallScope {
    handle: ConnectionHandle,
    ephemeral: bool,
    released: bool,
    backend_id: String,
}

impl CallScope {
    async fn acquire(manager: &ConnectionManager, descriptor: &BackendDescriptor) -> Result<Self> {
        let handle = manager.connect_descriptor(descriptor).await?;
        Ok(Self {
            handle,
            ephemeral: descriptor.lifecycle == Lifecycle::PerCall,
            released: false,
            backend_id: descriptor.id.clone(),
        })
    }

    fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    async fn release(mut self) {
        self.released = true;
        if self.ephemeral
            && let Err(e) = self.handle.close().await
        {
            tracing::warn!(backend_id = %self.backend_id, error = %e, "failed to close per-call connection");
        }
    }
}

impl Drop for CallScope {
    fn drop(&mut self) {
        if self.released || !self.ephemeral {
            return;
        }
        let handle = self.handle.clone();
        let backend_id = std::mem::take(&mut self.backend_id);
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                if let Err(e) = handle.close().await {
                    tracing::warn!(backend_id = %backend_id, error = %e, "failed to close cancelled per-call connection");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CachedCredential, CredentialStore};
    use crate::oauth::DEFAULT_PENDING_TTL;
    use crate::oauth::tests::{FakeExchanger, authorized_descriptor};
    use crate::testing::{FakeConnector, stdio_descriptor};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    fn manager(
        descriptors: Vec<BackendDescriptor>,
        connector: Arc<FakeConnector>,
    ) -> ConnectionManager {
        let registry = Arc::new(BackendRegistry::from_descriptors(descriptors));
        let flow = Arc::new(AuthorizationFlow::new(
            registry.clone(),
            Arc::new(CredentialStore::new()),
            Arc::new(FakeExchanger::default()),
            DEFAULT_PENDING_TTL,
        ));
        ConnectionManager::new(registry, connector, flow)
    }

    fn args(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn unknown_backend_fails_and_caches_nothing() {
        let connector = Arc::new(FakeConnector::default());
        let mgr = manager(vec![stdio_descriptor("a")], connector.clone());

        let err = mgr.call("ghost", "echo", Map::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownBackend(id) if id == "ghost"));
        assert!(mgr.cached_ids().is_empty());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_first_use_connects_once() {
        let connector = Arc::new(FakeConnector {
            connect_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let mgr = Arc::new(manager(vec![stdio_descriptor("a")], connector.clone()));

        let (r1, r2) = tokio::join!(
            mgr.call("a", "whoami", Map::new()),
            mgr.call("a", "whoami", Map::new())
        );
        assert_eq!(r1.expect("first"), r2.expect("second"));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.cached_ids(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn connect_returns_cached_handle() {
        let connector = Arc::new(FakeConnector::default());
        let mgr = manager(vec![stdio_descriptor("a")], connector.clone());

        let h1 = mgr.connect("a").await.expect("connect");
        let h2 = mgr.connect("a").await.expect("connect");
        assert!(Arc::ptr_eq(&h1, &h2));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsupported_transport_is_surfaced() {
        let connector = Arc::new(FakeConnector::default());
        let mut legacy = stdio_descriptor("legacy");
        legacy.transport = TransportKind::Other("sse".into());
        let mgr = manager(vec![legacy], connector.clone());

        let Err(err) = mgr.connect("legacy").await else {
            panic!("expected unsupported transport");
        };
        assert!(matches!(
            err,
            GatewayError::UnsupportedTransport { ref transport, .. } if transport == "sse"
        ));
        assert!(mgr.cached_ids().is_empty());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stdio_descriptor_without_command_is_config_error() {
        let mut d = stdio_descriptor("a");
        d.command = None;
        let mgr = manager(vec![d], Arc::new(FakeConnector::default()));
        assert!(matches!(
            mgr.connect("a").await,
            Err(GatewayError::Config(_))
        ));
    }

    #[tokio::test]
    async fn close_all_then_call_reconnects() {
        let connector = Arc::new(FakeConnector::default());
        let mgr = manager(vec![stdio_descriptor("a")], connector.clone());

        let first = mgr.call("a", "whoami", Map::new()).await.expect("call");
        assert!(mgr.close_all().await.is_empty());
        assert!(mgr.cached_ids().is_empty());
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);

        let second = mgr.call("a", "whoami", Map::new()).await.expect("call");
        assert_ne!(first, second);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_all_collects_failures_and_still_clears() {
        let connector = Arc::new(FakeConnector {
            fail_close: true,
            ..Default::default()
        });
        let mgr = manager(
            vec![stdio_descriptor("a"), stdio_descriptor("b")],
            connector.clone(),
        );
        mgr.connect("a").await.expect("a");
        mgr.connect("b").await.expect("b");

        let failures = mgr.close_all().await;
        assert_eq!(failures.len(), 2);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 2);
        assert!(mgr.cached_ids().is_empty());
    }

    #[tokio::test]
    async fn other_failures_propagate_unchanged() {
        let mgr = manager(
            vec![stdio_descriptor("a")],
            Arc::new(FakeConnector::default()),
        );
        let err = mgr.call("a", "explode", Map::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Backend { ref message, .. } if message.contains("explode")));
    }

    #[tokio::test]
    async fn unauthorized_without_settings_propagates() {
        let mgr = manager(
            vec![stdio_descriptor("a")],
            Arc::new(FakeConnector::default()),
        );
        let err = mgr.call("a", "unauthorized", Map::new()).await.unwrap_err();
        assert!(err.is_unauthorized());
    }

    #[tokio::test]
    async fn unauthorized_with_settings_becomes_challenge() {
        let connector = Arc::new(FakeConnector::default());
        let mgr = manager(vec![authorized_descriptor("secure")], connector.clone());

        let outcome = mgr
            .call("secure", "unauthorized", Map::new())
            .await
            .expect("challenge, not error");
        let CallOutcome::AuthorizationRequired(challenge) = outcome else {
            panic!("expected authorization challenge");
        };
        assert_eq!(challenge.backend_id, "secure");
        assert!(
            challenge
                .authorization_url
                .starts_with("https://auth.example.com/authorize?")
        );

        let v = CallOutcome::AuthorizationRequired(challenge).into_json();
        assert_eq!(v["status"], json!("authorization_required"));
        assert!(mgr.cached_ids().is_empty(), "unauthorized handle is evicted");
    }

    #[tokio::test]
    async fn failure_text_mentioning_401_keeps_credential() {
        let connector = Arc::new(FakeConnector::default());
        let mgr = manager(vec![authorized_descriptor("secure")], connector.clone());
        mgr.authorization.credentials().insert(
            "secure",
            CachedCredential {
                access_token: "tok-1".into(),
                token_type: "Bearer".into(),
                expires_in: Some(3600),
                obtained_at: Instant::now(),
            },
        );

        let err = mgr
            .call("secure", "missing_invoice", Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ToolFailed { .. }));
        assert!(mgr.authorization.credentials().get("secure").is_some());
        assert_eq!(mgr.cached_ids(), vec!["secure".to_string()]);
        assert_eq!(mgr.authorization.pending_len(), 0);
    }

    #[tokio::test]
    async fn valid_credential_is_attached_to_http_transport() {
        let connector = Arc::new(FakeConnector::default());
        let mgr = manager(vec![authorized_descriptor("secure")], connector.clone());
        mgr.authorization.credentials().insert(
            "secure",
            CachedCredential {
                access_token: "tok-1".into(),
                token_type: "Bearer".into(),
                expires_in: Some(3600),
                obtained_at: Instant::now(),
            },
        );

        mgr.call("secure", "echo", Map::new()).await.expect("call");
        let seen = connector.seen_params.lock().clone();
        assert_eq!(
            seen,
            vec![TransportParams::StreamableHttp {
                url: "http://127.0.0.1:9/mcp".into(),
                bearer_token: Some("tok-1".into()),
            }]
        );
    }

    #[tokio::test]
    async fn expired_credential_triggers_proactive_challenge() {
        let connector = Arc::new(FakeConnector::default());
        let mgr = manager(vec![authorized_descriptor("secure")], connector.clone());
        mgr.authorization.credentials().insert(
            "secure",
            CachedCredential {
                access_token: "old".into(),
                token_type: "Bearer".into(),
                expires_in: Some(0),
                obtained_at: Instant::now(),
            },
        );

        let outcome = mgr.call("secure", "echo", Map::new()).await.expect("outcome");
        assert!(matches!(outcome, CallOutcome::AuthorizationRequired(_)));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
        assert!(mgr.authorization.credentials().get("secure").is_none());
    }

    #[tokio::test]
    async fn per_call_lifecycle_opens_and_closes_each_call() {
        let connector = Arc::new(FakeConnector::default());
        let mut d = stdio_descriptor("eph");
        d.lifecycle = Lifecycle::PerCall;
        let mgr = manager(vec![d], connector.clone());

        let a = mgr.call("eph", "whoami", Map::new()).await.expect("a");
        let b = mgr.call("eph", "whoami", Map::new()).await.expect("b");
        assert_ne!(a, b);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 2);
        assert!(mgr.cached_ids().is_empty());

        // Failure paths release too.
        let _ = mgr.call("eph", "explode", Map::new()).await;
        assert_eq!(connector.closes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn list_capabilities_respects_capability_flag() {
        let without = manager(
            vec![stdio_descriptor("a")],
            Arc::new(FakeConnector::default()),
        );
        assert!(without.list_capabilities("a").await.expect("list").is_empty());

        let with = manager(
            vec![stdio_descriptor("a")],
            Arc::new(FakeConnector {
                list_tools: true,
                ..Default::default()
            }),
        );
        let caps = with.list_capabilities("a").await.expect("list");
        let names: Vec<&str> = caps.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "whoami"]);
    }

    #[tokio::test]
    async fn echo_returns_arguments() {
        let mgr = manager(
            vec![stdio_descriptor("a")],
            Arc::new(FakeConnector::default()),
        );
        let out = mgr
            .call("a", "echo", args(json!({"x": 1})))
            .await
            .expect("call");
        assert_eq!(out, CallOutcome::Completed(json!({"x": 1})));
    }
}

//! The gateway facade: one object wiring registry, connections, authorization and chains.
//!
//! Both the MCP tool surface and the HTTP callback listener talk only to [`Gateway`].

use crate::backend::{BackendConnector, Capability};
use crate::chain::{ChainError, ChainOutcome, ChainStep, run_chain};
use crate::connections::{CallOutcome, ConnectionManager};
use crate::credentials::CredentialStore;
use crate::error::{GatewayError, Result};
use crate::oauth::{AuthorizationError, AuthorizationFlow, AuthorizationGrant, TokenExchanger};
use crate::registry::BackendRegistry;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;

pub struct Gateway {
    registry: Arc<BackendRegistry>,
    connections: ConnectionManager,
    authorization: Arc<AuthorizationFlow>,
}

impl Gateway {
    #[must_use]
    pub fn new(
        registry: Arc<BackendRegistry>,
        connector: Arc<dyn BackendConnector>,
        exchanger: Arc<dyn TokenExchanger>,
        authorization_ttl: Duration,
    ) -> Self {
        let authorization = Arc::new(AuthorizationFlow::new(
            registry.clone(),
            Arc::new(CredentialStore::new()),
            exchanger,
            authorization_ttl,
        ));
        let connections =
            ConnectionManager::new(registry.clone(), connector, authorization.clone());
        Self {
            registry,
            connections,
            authorization,
        }
    }

    #[must_use]
    pub fn list_backend_ids(&self) -> Vec<String> {
        self.registry.list_ids()
    }

    /// # Errors
    ///
    /// See [`ConnectionManager::call`].
    pub async fn call_backend_tool(
        &self,
        backend_id: &str,
        operation: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallOutcome> {
        self.connections.call(backend_id, operation, arguments).await
    }

    /// # Errors
    ///
    /// See [`ConnectionManager::list_capabilities`].
    pub async fn list_backend_capabilities(&self, backend_id: &str) -> Result<Vec<Capability>> {
        self.connections.list_capabilities(backend_id).await
    }

    /// # Errors
    ///
    /// Fails on the first failing step.
    pub async fn run_chain(
        &self,
        steps: &[ChainStep],
    ) -> std::result::Result<ChainOutcome, ChainError> {
        run_chain(&self.connections, steps).await
    }

    /// Start authorization for `backend_id` and return the URL to visit, or `None` when the
    /// backend has no authorization settings.
    ///
    /// # Errors
    ///
    /// `UnknownBackend`, or `Config` when the authorization URL cannot be built.
    pub fn begin_authorization(&self, backend_id: &str) -> Result<Option<String>> {
        self.authorization
            .initiate(backend_id)
            .map_err(|e| match e {
                AuthorizationError::UnknownBackend(id) => GatewayError::UnknownBackend(id),
                other => GatewayError::Config(other.to_string()),
            })
    }

    /// Finish an authorization attempt.
    ///
    /// On success the backend's cached connection is dropped, so the next call reconnects with
    /// the new credential.
    ///
    /// # Errors
    ///
    /// See [`AuthorizationFlow::complete`].
    pub async fn complete_authorization(
        &self,
        state: &str,
        code: &str,
    ) -> std::result::Result<AuthorizationGrant, AuthorizationError> {
        let grant = self.authorization.complete(state, code).await?;
        self.connections.evict(&grant.backend_id).await;
        Ok(grant)
    }

    /// Close all cached connections. Never fails.
    pub async fn shutdown(&self) {
        let failures = self.connections.close_all().await;
        if failures.is_empty() {
            tracing::info!("all backend connections closed");
        } else {
            tracing::warn!(failed = failures.len(), "some backend connections failed to close");
        }
    }

    #[must_use]
    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    #[must_use]
    pub fn authorization(&self) -> &AuthorizationFlow {
        &self.authorization
    }
}

/// JSON reply for an authorization completion: `{success, backend_id}` or `{error, message}`.
#[must_use]
pub fn completion_json(
    result: &std::result::Result<AuthorizationGrant, AuthorizationError>,
) -> Value {
    match result {
        Ok(grant) => json!({"success": true, "backend_id": grant.backend_id}),
        Err(e) => json!({"error": e.reason(), "message": e.to_string()}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::DEFAULT_PENDING_TTL;
    use crate::oauth::tests::{FakeExchanger, authorized_descriptor};
    use crate::testing::{FakeConnector, stdio_descriptor};
    use std::sync::atomic::Ordering;

    fn gateway(connector: Arc<FakeConnector>) -> Gateway {
        let registry = Arc::new(BackendRegistry::from_descriptors([
            stdio_descriptor("plain"),
            authorized_descriptor("secure"),
        ]));
        Gateway::new(
            registry,
            connector,
            Arc::new(FakeExchanger::default()),
            DEFAULT_PENDING_TTL,
        )
    }

    fn state_of(url: &str) -> String {
        url::Url::parse(url)
            .expect("url")
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .expect("state")
    }

    #[tokio::test]
    async fn completing_authorization_refreshes_the_connection() {
        let connector = Arc::new(FakeConnector::default());
        let gw = gateway(connector.clone());

        gw.call_backend_tool("secure", "echo", Map::new())
            .await
            .expect("call");
        assert_eq!(gw.connections().cached_ids(), vec!["secure".to_string()]);

        let url = gw
            .begin_authorization("secure")
            .expect("initiate")
            .expect("url");
        let result = gw.complete_authorization(&state_of(&url), "code-1").await;
        assert_eq!(
            completion_json(&result),
            json!({"success": true, "backend_id": "secure"})
        );
        assert!(gw.connections().cached_ids().is_empty());
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);

        gw.call_backend_tool("secure", "echo", Map::new())
            .await
            .expect("call");
        let seen = connector.seen_params.lock().clone();
        assert!(matches!(
            seen.last(),
            Some(crate::backend::TransportParams::StreamableHttp { bearer_token: Some(t), .. })
                if t == "access-for-code-1"
        ));
    }

    #[tokio::test]
    async fn invalid_state_reply_names_the_reason() {
        let gw = gateway(Arc::new(FakeConnector::default()));
        let result = gw.complete_authorization("bogus", "code").await;
        assert_eq!(completion_json(&result)["error"], json!("invalid_state"));
    }

    #[test]
    fn begin_authorization_without_settings_is_none() {
        let gw = gateway(Arc::new(FakeConnector::default()));
        assert_eq!(gw.begin_authorization("plain").expect("initiate"), None);
        assert!(matches!(
            gw.begin_authorization("ghost"),
            Err(GatewayError::UnknownBackend(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_closes_cached_connections() {
        let connector = Arc::new(FakeConnector::default());
        let gw = gateway(connector.clone());
        gw.call_backend_tool("plain", "echo", Map::new())
            .await
            .expect("call");
        gw.shutdown().await;
        assert!(gw.connections().cached_ids().is_empty());
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
    }
}

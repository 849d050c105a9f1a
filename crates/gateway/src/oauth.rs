//! Authorization-code flow with PKCE (S256) for backends that answer 401.
//!
//! Endpoints and client identity are per-backend configuration
//! ([`crate::registry::AuthorizationSettings`]). Pending attempts are single-use and expire after
//! a TTL; obtained credentials go to the shared [`CredentialStore`].

use crate::credentials::{CachedCredential, CredentialStore};
use crate::registry::BackendRegistry;
use anyhow::Context as _;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use parking_lot::Mutex;
use rand_core::{OsRng, TryRngCore as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use zeroize::Zeroize as _;

pub const CODE_CHALLENGE_METHOD: &str = "S256";
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(600);
const RANDOM_TOKEN_BYTES: usize = 32;

#[derive(Error, Debug)]
pub enum AuthorizationError {
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    /// Unknown, already consumed or expired `state`.
    #[error("invalid_state")]
    InvalidState,

    #[error("invalid authorization endpoint '{endpoint}': {message}")]
    InvalidEndpoint { endpoint: String, message: String },

    #[error("exchange_failed: {0}")]
    ExchangeFailed(String),

    #[error("secure random source unavailable: {0}")]
    Random(String),
}

impl AuthorizationError {
    /// Stable machine-readable reason code.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::UnknownBackend(_) => "unknown_backend",
            Self::InvalidState => "invalid_state",
            Self::InvalidEndpoint { .. } => "invalid_endpoint",
            Self::ExchangeFailed(_) => "exchange_failed",
            Self::Random(_) => "random_unavailable",
        }
    }
}

/// Returned in place of a call result when a backend needs authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename = "authorization_required")]
pub struct AuthorizationChallenge {
    pub authorization_url: String,
    pub backend_id: String,
}

/// Successful completion of an authorization attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationGrant {
    pub backend_id: String,
}

/// Everything remembered about one in-flight attempt, keyed by `state`.
struct PendingAuthorization {
    backend_id: String,
    code_verifier: String,
    redirect_uri: String,
    scopes: Vec<String>,
    token_endpoint: String,
    client_id: String,
    client_secret: Option<String>,
    created_at: Instant,
}

impl Drop for PendingAuthorization {
    fn drop(&mut self) {
        self.code_verifier.zeroize();
    }
}

/// Token endpoint request for the authorization-code grant.
#[derive(Debug)]
pub struct TokenRequest<'a> {
    pub token_endpoint: &'a str,
    pub client_id: &'a str,
    pub client_secret: Option<&'a str>,
    pub redirect_uri: &'a str,
    pub code: &'a str,
    pub code_verifier: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Exchanges an authorization code for a token.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(&self, request: TokenRequest<'_>) -> anyhow::Result<TokenResponse>;
}

/// Form-encoded POST to the backend's token endpoint.
#[derive(Clone, Default)]
pub struct HttpTokenExchanger {
    http: reqwest::Client,
}

impl HttpTokenExchanger {
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl TokenExchanger for HttpTokenExchanger {
    async fn exchange(&self, request: TokenRequest<'_>) -> anyhow::Result<TokenResponse> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", request.code),
            ("redirect_uri", request.redirect_uri),
            ("code_verifier", request.code_verifier),
            ("client_id", request.client_id),
        ];
        if let Some(secret) = request.client_secret {
            form.push(("client_secret", secret));
        }

        let resp = self
            .http
            .post(request.token_endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .with_context(|| format!("POST token endpoint {}", request.token_endpoint))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("token endpoint returned {status}: {body}");
        }
        resp.json::<TokenResponse>()
            .await
            .context("parse token response json")
    }
}

pub struct AuthorizationFlow {
    registry: Arc<BackendRegistry>,
    credentials: Arc<CredentialStore>,
    exchanger: Arc<dyn TokenExchanger>,
    pending: Mutex<HashMap<String, PendingAuthorization>>,
    ttl: Duration,
}

impl AuthorizationFlow {
    #[must_use]
    pub fn new(
        registry: Arc<BackendRegistry>,
        credentials: Arc<CredentialStore>,
        exchanger: Arc<dyn TokenExchanger>,
        ttl: Duration,
    ) -> Self {
        Self {
            registry,
            credentials,
            exchanger,
            pending: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    #[must_use]
    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Start an attempt and return the URL the user should visit.
    ///
    /// Returns `Ok(None)` when the backend has no authorization settings.
    ///
    /// # Errors
    ///
    /// Fails for unknown backends, unparsable authorization endpoints, or when the OS random
    /// source is unavailable.
    pub fn initiate(&self, backend_id: &str) -> Result<Option<String>, AuthorizationError> {
        let descriptor = self
            .registry
            .resolve(backend_id)
            .map_err(|_| AuthorizationError::UnknownBackend(backend_id.to_string()))?;
        let Some(settings) = descriptor.authorization.as_ref() else {
            return Ok(None);
        };

        let state = random_urlsafe(RANDOM_TOKEN_BYTES)?;
        let code_verifier = random_urlsafe(RANDOM_TOKEN_BYTES)?;
        let code_challenge = pkce_s256_challenge(&code_verifier);
        let scopes = dedup_scopes(&settings.scopes);

        let url = build_authorization_url(&AuthorizationUrlParams {
            authorization_endpoint: &settings.authorization_endpoint,
            client_id: &settings.client_id,
            redirect_uri: &settings.redirect_uri,
            scopes: &scopes,
            state: &state,
            code_challenge: &code_challenge,
        })?;

        let pending = PendingAuthorization {
            backend_id: backend_id.to_string(),
            code_verifier,
            redirect_uri: settings.redirect_uri.clone(),
            scopes,
            token_endpoint: settings.token_endpoint.clone(),
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            created_at: Instant::now(),
        };

        {
            let mut map = self.pending.lock();
            self.purge_expired(&mut map);
            map.insert(state, pending);
        }

        tracing::info!(backend_id = %backend_id, "authorization initiated");
        Ok(Some(url))
    }

    /// Finish an attempt: consume `state`, exchange `code`, cache the credential.
    ///
    /// # Errors
    ///
    /// [`AuthorizationError::InvalidState`] if `state` is unknown, consumed or expired;
    /// [`AuthorizationError::ExchangeFailed`] if the token endpoint rejects the code. Nothing is
    /// cached on failure.
    pub async fn complete(
        &self,
        state: &str,
        code: &str,
    ) -> Result<AuthorizationGrant, AuthorizationError> {
        let pending = {
            let mut map = self.pending.lock();
            let pending = map.remove(state);
            self.purge_expired(&mut map);
            pending
        };
        let Some(pending) = pending else {
            tracing::warn!("authorization callback with unknown or consumed state");
            return Err(AuthorizationError::InvalidState);
        };
        if pending.created_at.elapsed() > self.ttl {
            tracing::warn!(backend_id = %pending.backend_id, "authorization callback after expiry");
            return Err(AuthorizationError::InvalidState);
        }

        let response = self
            .exchanger
            .exchange(TokenRequest {
                token_endpoint: &pending.token_endpoint,
                client_id: &pending.client_id,
                client_secret: pending.client_secret.as_deref(),
                redirect_uri: &pending.redirect_uri,
                code,
                code_verifier: &pending.code_verifier,
            })
            .await
            .map_err(|e| {
                tracing::warn!(backend_id = %pending.backend_id, error = %e, "token exchange failed");
                AuthorizationError::ExchangeFailed(format!("{e:#}"))
            })?;

        if response.access_token.trim().is_empty() {
            return Err(AuthorizationError::ExchangeFailed(
                "token endpoint returned an empty access_token".to_string(),
            ));
        }

        self.credentials.insert(
            &pending.backend_id,
            CachedCredential {
                access_token: response.access_token,
                token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
                expires_in: response.expires_in,
                obtained_at: Instant::now(),
            },
        );

        tracing::info!(
            backend_id = %pending.backend_id,
            scopes = %pending.scopes.join(" "),
            "authorization completed"
        );
        Ok(AuthorizationGrant {
            backend_id: pending.backend_id.clone(),
        })
    }

    /// Number of attempts still awaiting a callback.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    fn purge_expired(&self, map: &mut HashMap<String, PendingAuthorization>) {
        let ttl = self.ttl;
        map.retain(|_, p| p.created_at.elapsed() <= ttl);
    }
}

pub struct AuthorizationUrlParams<'a> {
    pub authorization_endpoint: &'a str,
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub scopes: &'a [String],
    pub state: &'a str,
    pub code_challenge: &'a str,
}

/// Build the redirect URL for the authorization endpoint.
///
/// # Errors
///
/// Returns an error if the endpoint is not an absolute URL.
pub fn build_authorization_url(
    params: &AuthorizationUrlParams<'_>,
) -> Result<String, AuthorizationError> {
    let mut url = url::Url::parse(params.authorization_endpoint).map_err(|e| {
        AuthorizationError::InvalidEndpoint {
            endpoint: params.authorization_endpoint.to_string(),
            message: e.to_string(),
        }
    })?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", params.client_id)
        .append_pair("redirect_uri", params.redirect_uri)
        .append_pair("scope", &params.scopes.join(" "))
        .append_pair("state", params.state)
        .append_pair("code_challenge", params.code_challenge)
        .append_pair("code_challenge_method", CODE_CHALLENGE_METHOD);
    Ok(url.to_string())
}

/// `BASE64URL(SHA256(verifier))` without padding.
#[must_use]
pub fn pkce_s256_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

fn random_urlsafe(len: usize) -> Result<String, AuthorizationError> {
    let mut bytes = vec![0u8; len];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| AuthorizationError::Random(e.to_string()))?;
    let out = URL_SAFE_NO_PAD.encode(&bytes);
    bytes.zeroize();
    Ok(out)
}

fn dedup_scopes(scopes: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(scopes.len());
    for s in scopes.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if !out.iter().any(|o| o == s) {
            out.push(s.to_string());
        }
    }
    out
}

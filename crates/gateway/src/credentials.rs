//! In-memory credential cache, keyed by backend id.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Credentials this close to expiry are treated as expired.
pub const EXPIRY_SAFETY_WINDOW: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct CachedCredential {
    pub access_token: String,
    pub token_type: String,
    /// Lifetime reported by the token endpoint, in seconds.
    pub expires_in: Option<u64>,
    pub obtained_at: Instant,
}

impl CachedCredential {
    #[must_use]
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_in
            .map(|secs| self.obtained_at + Duration::from_secs(secs))
    }

    /// A credential without a reported lifetime never expires.
    #[must_use]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at()
            .is_some_and(|at| at <= now + EXPIRY_SAFETY_WINDOW)
    }
}

impl std::fmt::Debug for CachedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedCredential")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

/// What the cache holds for a backend right now.
#[derive(Debug, Clone)]
pub enum CredentialStatus {
    Missing,
    Valid(CachedCredential),
    Expired,
}

#[derive(Debug, Default)]
pub struct CredentialStore {
    inner: RwLock<HashMap<String, CachedCredential>>,
}

impl CredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, backend_id: &str, credential: CachedCredential) {
        self.inner.write().insert(backend_id.to_string(), credential);
    }

    #[must_use]
    pub fn get(&self, backend_id: &str) -> Option<CachedCredential> {
        self.inner.read().get(backend_id).cloned()
    }

    pub fn remove(&self, backend_id: &str) -> Option<CachedCredential> {
        self.inner.write().remove(backend_id)
    }

    /// Check the cached credential for `backend_id`, dropping it if it has expired.
    pub fn status(&self, backend_id: &str) -> CredentialStatus {
        let now = Instant::now();
        let mut map = self.inner.write();
        let Some(cred) = map.get(backend_id) else {
            return CredentialStatus::Missing;
        };
        if cred.is_expired_at(now) {
            map.remove(backend_id);
            return CredentialStatus::Expired;
        }
        CredentialStatus::Valid(cred.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

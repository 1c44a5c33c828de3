//! Session-scoped token cache
//!
//! Tokens are keyed by (session, issuer, scope). A token returned from the
//! cache is always valid at the time of return; refresh runs behind a
//! per-key singleflight so concurrent getters wait for one refresh instead
//! of racing their own.

use crate::Result;
use crate::model::TokenRecord;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Full cache key: all three parts must match on lookup
pub type TokenKey = (String, String, String);

fn key(session: &str, issuer: &str, scope: &str) -> TokenKey {
    (session.to_string(), issuer.to_string(), scope.to_string())
}

/// Refreshes an expiring token against its issuer
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, record: &TokenRecord) -> Result<TokenRecord>;
}

/// In-memory token cache with singleflight refresh
pub struct TokenStore {
    tokens: RwLock<HashMap<TokenKey, TokenRecord>>,
    /// Per-key refresh gates; holders re-check the cache after acquiring.
    refresh_gates: Mutex<HashMap<TokenKey, Arc<tokio::sync::Mutex<()>>>>,
    refresher: RwLock<Option<Arc<dyn TokenRefresher>>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            refresh_gates: Mutex::new(HashMap::new()),
            refresher: RwLock::new(None),
        }
    }

    /// Install the refresher used for expiring tokens
    pub fn set_refresher(&self, refresher: Arc<dyn TokenRefresher>) {
        *self.refresher.write() = Some(refresher);
    }

    /// Store a token record
    pub fn put(&self, record: TokenRecord) {
        let token_key = key(&record.session_id, &record.issuer_url, &record.scope);
        self.tokens.write().insert(token_key, record);
    }

    /// Get a valid token for an exact (session, issuer, scope) key,
    /// refreshing when it is inside the skew window.
    pub async fn get(&self, session: &str, issuer: &str, scope: &str) -> Option<TokenRecord> {
        let token_key = key(session, issuer, scope);
        self.get_by_key(&token_key).await
    }

    /// Get any valid token this session holds for the issuer, regardless of
    /// scope.
    pub async fn get_by_issuer(&self, session: &str, issuer: &str) -> Option<TokenRecord> {
        let candidates: Vec<TokenKey> = {
            let tokens = self.tokens.read();
            tokens
                .keys()
                .filter(|(s, i, _)| s == session && i == issuer)
                .cloned()
                .collect()
        };

        for token_key in candidates {
            if let Some(record) = self.get_by_key(&token_key).await {
                return Some(record);
            }
        }
        None
    }

    /// Fallback for token forwarding: any valid token this session holds
    /// that carries an ID token.
    pub async fn find_token_with_id_token(&self, session: &str) -> Option<TokenRecord> {
        let candidates: Vec<TokenKey> = {
            let tokens = self.tokens.read();
            tokens
                .iter()
                .filter(|((s, _, _), record)| s == session && record.id_token.is_some())
                .map(|(k, _)| k.clone())
                .collect()
        };

        for token_key in candidates {
            if let Some(record) = self.get_by_key(&token_key).await
                && record.id_token.is_some()
            {
                return Some(record);
            }
        }
        None
    }

    /// Drop every scope this session holds for the issuer
    pub fn clear_by_issuer(&self, session: &str, issuer: &str) {
        self.tokens
            .write()
            .retain(|(s, i, _), _| !(s == session && i == issuer));
    }

    async fn get_by_key(&self, token_key: &TokenKey) -> Option<TokenRecord> {
        let record = self.tokens.read().get(token_key).cloned()?;

        if !record.needs_refresh() {
            return Some(record);
        }

        // Refreshable: coalesce concurrent refreshes behind a per-key gate.
        if record.refresh_token.is_some() {
            let refresher = self.refresher.read().clone();
            if let Some(refresher) = refresher {
                return self.refresh_singleflight(token_key, refresher).await;
            }
        }

        // Not refreshable: still valid tokens inside the skew window are
        // served; expired ones are evicted.
        if record.is_expired() {
            self.tokens.write().remove(token_key);
            None
        } else {
            Some(record)
        }
    }

    async fn refresh_singleflight(
        &self,
        token_key: &TokenKey,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Option<TokenRecord> {
        let gate = {
            let mut gates = self.refresh_gates.lock();
            gates
                .entry(token_key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        let _held = gate.lock().await;

        // Another getter may have refreshed while this one waited.
        let current = self.tokens.read().get(token_key).cloned()?;
        if !current.needs_refresh() {
            return Some(current);
        }

        match refresher.refresh(&current).await {
            Ok(refreshed) => {
                // Readers observe either the old valid token or the new one,
                // never a partial.
                self.tokens.write().insert(token_key.clone(), refreshed.clone());
                Some(refreshed)
            }
            Err(e) => {
                tracing::warn!(
                    "token refresh failed for issuer '{}': {}",
                    token_key.1,
                    e
                );
                if current.is_expired() {
                    self.tokens.write().remove(token_key);
                    None
                } else {
                    Some(current)
                }
            }
        }
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("tokens", &self.tokens.read().len())
            .finish()
    }
}


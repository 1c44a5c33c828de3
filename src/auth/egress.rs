//! Egress authentication pipeline
//!
//! For each outgoing call the pipeline resolves a bearer in priority order:
//! token exchange, then ID-token forwarding, then SSO reuse. When nothing
//! yields a token the call goes out unadorned; a 401 response turns into an
//! auth challenge through the challenge manager.

use super::challenge::{ChallengeManager, CompletionCallback, OAuthClientConfig};
use super::token_store::{TokenRefresher, TokenStore};
use crate::error::NetworkError;
use crate::model::{
    AuthStatus, EgressMode, McpServerDefinition, TokenExchangeConfig, TokenRecord,
};
use crate::{MusterError, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;

/// RFC 8693 token endpoint response
#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Refresh endpoint response
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Resolves bearers for outgoing calls and turns 401s into challenges
pub struct EgressAuthenticator {
    store: Arc<TokenStore>,
    challenges: Arc<ChallengeManager>,
    config: OAuthClientConfig,
    http: reqwest::Client,
    /// Muster's own issuer, used to locate forwardable ID tokens by name
    own_issuer: Option<String>,
}

impl EgressAuthenticator {
    pub fn new(
        store: Arc<TokenStore>,
        challenges: Arc<ChallengeManager>,
        config: OAuthClientConfig,
        own_issuer: Option<String>,
    ) -> Result<Self> {
        let http = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| MusterError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            store,
            challenges,
            config,
            http,
            own_issuer,
        })
    }

    pub fn token_store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn challenges(&self) -> &Arc<ChallengeManager> {
        &self.challenges
    }

    /// Resolve the bearer for an outgoing call. None means the call goes out
    /// unadorned (and a 401 will produce a challenge).
    pub async fn resolve_bearer(
        &self,
        session: &str,
        definition: &McpServerDefinition,
    ) -> Result<Option<String>> {
        let Some(policy) = &definition.auth else {
            return Ok(None);
        };

        match policy.egress_mode() {
            EgressMode::NoAuth => Ok(None),
            EgressMode::TokenExchange => {
                let exchange = policy
                    .token_exchange
                    .as_ref()
                    .ok_or_else(|| MusterError::internal("exchange mode without config"))?;
                self.exchange_token(session, &definition.name, exchange)
                    .await
                    .map(Some)
            }
            EgressMode::ForwardToken => Ok(self.forward_token(session).await),
            EgressMode::SsoReuse => {
                let Some(ref issuer) = policy.issuer_url else {
                    return Ok(None);
                };
                Ok(self
                    .store
                    .get_by_issuer(session, issuer)
                    .await
                    .map(|record| record.access_token))
            }
        }
    }

    /// The session's muster-issued ID token, if one is cached.
    async fn forward_token(&self, session: &str) -> Option<String> {
        if let Some(ref own_issuer) = self.own_issuer
            && let Some(record) = self.store.get_by_issuer(session, own_issuer).await
            && record.id_token.is_some()
        {
            return record.id_token;
        }
        // Fallback when muster's own issuer is not known by name.
        self.store
            .find_token_with_id_token(session)
            .await
            .and_then(|record| record.id_token)
    }

    /// RFC 8693: swap the session's local ID token for one issued by the
    /// remote endpoint. Results are cached under the remote issuer.
    async fn exchange_token(
        &self,
        session: &str,
        server: &str,
        exchange: &TokenExchangeConfig,
    ) -> Result<String> {
        let remote_issuer = exchange
            .token_endpoint
            .trim_end_matches('/')
            .trim_end_matches("/token")
            .to_string();
        let scope = if exchange.scopes.is_empty() {
            "openid".to_string()
        } else {
            exchange.scopes.join(" ")
        };

        if let Some(cached) = self.store.get(session, &remote_issuer, &scope).await {
            return Ok(cached.access_token);
        }

        let subject = self
            .store
            .find_token_with_id_token(session)
            .await
            .and_then(|record| record.id_token)
            .ok_or_else(|| MusterError::AuthRequired {
                server: server.to_string(),
                auth_url: None,
            })?;

        let mut params = vec![
            ("grant_type", crate::constants::TOKEN_EXCHANGE_GRANT.to_string()),
            ("subject_token", subject),
            ("subject_token_type", crate::constants::ID_TOKEN_TYPE.to_string()),
            ("scope", scope.clone()),
        ];
        if let Some(ref connector_id) = exchange.connector_id {
            params.push(("connector_id", connector_id.clone()));
        }

        let mut request = self.http.post(&exchange.token_endpoint).form(&params);
        if let Some(ref client_id) = exchange.client_id {
            let secret = exchange
                .client_secret_ref
                .as_ref()
                .and_then(|name| std::env::var(name).ok());
            request = request.basic_auth(client_id, secret);
        }

        let response = request.send().await.map_err(|e| {
            MusterError::Network(NetworkError::Http(format!(
                "token exchange endpoint unreachable: {}",
                e
            )))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MusterError::auth(format!(
                "token exchange for '{}' failed with {}: {}",
                server, status, body
            )));
        }

        let exchanged: ExchangeResponse = response
            .json()
            .await
            .map_err(|e| MusterError::auth(format!("invalid exchange response: {}", e)))?;

        // Cached under the requested scope so the next resolve hits even
        // when the endpoint narrows the granted scope.
        let record = TokenRecord {
            session_id: session.to_string(),
            issuer_url: remote_issuer,
            scope,
            access_token: exchanged.access_token.clone(),
            refresh_token: None,
            id_token: None,
            expires_at: Utc::now() + Duration::seconds(exchanged.expires_in.unwrap_or(3600) as i64),
        };
        self.store.put(record);

        Ok(exchanged.access_token)
    }

    /// Turn a 401 from a backing server into an auth-required error carrying
    /// a challenge URL. The completion callback re-establishes the
    /// session-server connection once the browser returns.
    pub fn challenge_from_401(
        &self,
        session: &str,
        definition: &McpServerDefinition,
        www_authenticate: Option<&str>,
        on_complete: Option<CompletionCallback>,
    ) -> MusterError {
        let policy = definition.auth.clone().unwrap_or_default();

        let (issuer, scope) = www_authenticate
            .and_then(super::parse_www_authenticate)
            .or_else(|| {
                policy
                    .issuer_url
                    .clone()
                    .map(|issuer| (issuer, policy.scope.clone().unwrap_or_else(|| "openid".into())))
            })
            .unzip();

        let (Some(issuer), Some(scope)) = (issuer, scope) else {
            return MusterError::AuthRequired {
                server: definition.name.clone(),
                auth_url: None,
            };
        };

        match self.challenges.create_challenge(
            session,
            &definition.name,
            &issuer,
            &scope,
            &policy.required_audiences,
            on_complete,
        ) {
            Ok(challenge) => MusterError::AuthRequired {
                server: definition.name.clone(),
                auth_url: Some(challenge.auth_url),
            },
            Err(e) => e,
        }
    }

    /// Auth status for one endpoint, derived from the session's cached
    /// tokens.
    pub async fn auth_status(&self, session: &str, definition: &McpServerDefinition) -> AuthStatus {
        let issuer = definition
            .auth
            .as_ref()
            .and_then(|policy| policy.issuer_url.clone())
            .or_else(|| self.own_issuer.clone());

        let record = match issuer {
            Some(ref issuer) => self.store.get_by_issuer(session, issuer).await,
            None => self.store.find_token_with_id_token(session).await,
        };

        match record {
            Some(record) => {
                let claims = record
                    .id_token
                    .as_deref()
                    .and_then(|token| super::decode_id_token_claims(token).ok());
                AuthStatus {
                    endpoint: definition.name.clone(),
                    authenticated: true,
                    expires_at: Some(record.expires_at),
                    refresh_expires_at: None,
                    issuer_url: Some(record.issuer_url.clone()),
                    subject: claims.as_ref().and_then(|c| c.sub.clone()),
                    email: claims.as_ref().and_then(|c| c.email.clone()),
                    has_refresh_token: record.refresh_token.is_some(),
                    error: None,
                }
            }
            None => AuthStatus {
                endpoint: definition.name.clone(),
                authenticated: false,
                expires_at: None,
                refresh_expires_at: None,
                issuer_url: definition.auth.as_ref().and_then(|p| p.issuer_url.clone()),
                subject: None,
                email: None,
                has_refresh_token: false,
                error: None,
            },
        }
    }

}

#[async_trait]
impl TokenRefresher for EgressAuthenticator {
    async fn refresh(&self, record: &TokenRecord) -> Result<TokenRecord> {
        let refresh_token = record
            .refresh_token
            .as_ref()
            .ok_or_else(|| MusterError::auth("no refresh token available"))?;

        let token_endpoint = format!("{}/token", record.issuer_url.trim_end_matches('/'));
        let mut params = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.clone()),
            ("client_id", self.config.client_id.clone()),
        ];
        if let Some(ref secret) = self.config.client_secret {
            params.push(("client_secret", secret.clone()));
        }

        let response = self
            .http
            .post(&token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| MusterError::auth(format!("refresh endpoint unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(MusterError::auth(format!(
                "token refresh failed with {}",
                response.status()
            )));
        }

        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| MusterError::auth(format!("invalid refresh response: {}", e)))?;

        Ok(TokenRecord {
            session_id: record.session_id.clone(),
            issuer_url: record.issuer_url.clone(),
            scope: record.scope.clone(),
            access_token: refreshed.access_token,
            refresh_token: refreshed.refresh_token.or_else(|| record.refresh_token.clone()),
            id_token: refreshed.id_token.or_else(|| record.id_token.clone()),
            expires_at: Utc::now() + Duration::seconds(refreshed.expires_in.unwrap_or(3600) as i64),
        })
    }
}

/// Convenience: a challenge manager plus egress pipeline wired together
pub fn build_auth(
    config: OAuthClientConfig,
    own_issuer: Option<String>,
) -> Result<(Arc<TokenStore>, Arc<ChallengeManager>, Arc<EgressAuthenticator>)> {
    let store = Arc::new(TokenStore::new());
    let challenges = Arc::new(ChallengeManager::new(config.clone(), store.clone())?);
    let egress = Arc::new(EgressAuthenticator::new(
        store.clone(),
        challenges.clone(),
        config,
        own_issuer,
    )?);
    store.set_refresher(egress.clone());
    Ok((store, challenges, egress))
}

//! OAuth challenge lifecycle
//!
//! A 401 from a backing server turns into a pending challenge: an
//! authorization URL carrying a fresh state, registered here until the
//! browser callback returns with the matching state. Completion exchanges
//! the code, stores the token, and fires the registered callback exactly
//! once; late callbacks for the same state are no-ops.

use super::token_store::TokenStore;
use crate::model::TokenRecord;
use crate::{MusterError, Result};
use chrono::{DateTime, Duration, Utc};
use oauth2::basic::BasicClient;
use oauth2::{AuthUrl, ClientId, CsrfToken, PkceCodeChallenge, RedirectUrl, Scope, TokenUrl};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// OAuth client registration muster uses against issuers
#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
}

/// Challenge returned to a caller that must authenticate
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuthChallenge {
    pub state: String,
    pub auth_url: String,
    pub server: String,
    pub session_id: String,
    pub issuer_url: String,
    pub scope: String,
    pub created_at: DateTime<Utc>,
}

/// Fired after a successful callback, with the freshly stored token
pub type CompletionCallback = Arc<dyn Fn(TokenRecord) + Send + Sync>;

struct PendingChallenge {
    challenge: AuthChallenge,
    pkce_verifier: String,
    on_complete: Option<CompletionCallback>,
}

/// Token endpoint response for the authorization-code exchange.
///
/// Decoded manually (rather than through the oauth2 crate's typed response)
/// because the id_token is load-bearing for forwarding.
#[derive(Debug, Deserialize)]
struct CodeExchangeResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
}

/// Pending-state registry plus the code-exchange flow
pub struct ChallengeManager {
    config: OAuthClientConfig,
    store: Arc<TokenStore>,
    http: reqwest::Client,
    pending: Mutex<HashMap<String, PendingChallenge>>,
}

impl ChallengeManager {
    pub fn new(config: OAuthClientConfig, store: Arc<TokenStore>) -> Result<Self> {
        // Disable redirects to prevent authorization code interception.
        let http = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                MusterError::config(format!("Failed to build HTTP client for OAuth: {}", e))
            })?;

        Ok(Self {
            config,
            store,
            http,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Build an authorization URL with a fresh state and register the
    /// pending challenge.
    pub fn create_challenge(
        &self,
        session_id: &str,
        server: &str,
        issuer_url: &str,
        scope: &str,
        required_audiences: &[String],
        on_complete: Option<CompletionCallback>,
    ) -> Result<AuthChallenge> {
        self.prune_expired();

        let issuer = issuer_url.trim_end_matches('/');
        let client = BasicClient::new(ClientId::new(self.config.client_id.clone()))
            .set_auth_uri(
                AuthUrl::new(format!("{}/auth", issuer))
                    .map_err(|e| MusterError::auth(format!("Invalid auth URL: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new(format!("{}/token", issuer))
                    .map_err(|e| MusterError::auth(format!("Invalid token URL: {}", e)))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(self.config.redirect_uri.clone())
                    .map_err(|e| MusterError::auth(format!("Invalid redirect URI: {}", e)))?,
            );

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let state = generate_state();

        // The requested audiences travel as audience scopes so the issued
        // token carries the needed aud claims.
        let mut scopes: Vec<Scope> = scope
            .split_whitespace()
            .map(|s| Scope::new(s.to_string()))
            .collect();
        for audience in required_audiences {
            scopes.push(Scope::new(format!(
                "audience:server:client_id:{}",
                audience
            )));
        }

        let state_for_url = state.clone();
        let (auth_url, _) = client
            .authorize_url(move || CsrfToken::new(state_for_url.clone()))
            .add_scopes(scopes)
            .set_pkce_challenge(pkce_challenge)
            .url();

        let challenge = AuthChallenge {
            state: state.clone(),
            auth_url: auth_url.to_string(),
            server: server.to_string(),
            session_id: session_id.to_string(),
            issuer_url: issuer.to_string(),
            scope: scope.to_string(),
            created_at: Utc::now(),
        };

        self.pending.lock().insert(
            state,
            PendingChallenge {
                challenge: challenge.clone(),
                pkce_verifier: pkce_verifier.secret().clone(),
                on_complete,
            },
        );

        tracing::info!(
            "created auth challenge for session '{}' against '{}'",
            session_id,
            issuer
        );
        Ok(challenge)
    }

    /// Complete the flow for a callback. Returns None when the state is
    /// unknown (already completed or expired) - the callback is a no-op then.
    pub async fn complete(&self, state: &str, code: &str) -> Result<Option<TokenRecord>> {
        let Some(pending) = self.pending.lock().remove(state) else {
            tracing::debug!("callback for unknown or already-completed state");
            return Ok(None);
        };

        let challenge = pending.challenge;
        let token_endpoint = format!("{}/token", challenge.issuer_url);

        let mut params = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", self.config.redirect_uri.clone()),
            ("client_id", self.config.client_id.clone()),
            ("code_verifier", pending.pkce_verifier),
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
            .map_err(|e| MusterError::auth(format!("token endpoint unreachable: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MusterError::auth(format!(
                "code exchange failed with {}: {}",
                status, body
            )));
        }

        let exchanged: CodeExchangeResponse = response
            .json()
            .await
            .map_err(|e| MusterError::auth(format!("invalid token response: {}", e)))?;

        let record = TokenRecord {
            session_id: challenge.session_id.clone(),
            issuer_url: challenge.issuer_url.clone(),
            scope: exchanged.scope.unwrap_or(challenge.scope.clone()),
            access_token: exchanged.access_token,
            refresh_token: exchanged.refresh_token,
            id_token: exchanged.id_token,
            expires_at: Utc::now() + Duration::seconds(exchanged.expires_in.unwrap_or(3600) as i64),
        };

        self.store.put(record.clone());

        tracing::info!(
            "auth flow completed for session '{}' against '{}'",
            challenge.session_id,
            challenge.issuer_url
        );

        if let Some(on_complete) = pending.on_complete {
            on_complete(record.clone());
        }

        Ok(Some(record))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn prune_expired(&self) {
        let ttl = Duration::from_std(crate::constants::CHALLENGE_TTL)
            .unwrap_or_else(|_| Duration::seconds(600));
        let cutoff = Utc::now() - ttl;
        self.pending
            .lock()
            .retain(|_, pending| pending.challenge.created_at > cutoff);
    }
}

/// Secure random state parameter
fn generate_state() -> String {
    use base64::Engine;
    use rand::Rng;
    let mut rng = rand::rng();
    let bytes: Vec<u8> = (0..32).map(|_| rng.random()).collect();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&bytes)
}

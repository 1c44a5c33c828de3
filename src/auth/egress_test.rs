use super::*;
use crate::model::{
    AuthPolicy, McpServerDefinition, TokenExchangeConfig, TokenRecord, Transport,
};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn oauth_config() -> OAuthClientConfig {
    OAuthClientConfig {
        client_id: "muster".to_string(),
        client_secret: None,
        redirect_uri: "http://localhost:8090/oauth/proxy/callback".to_string(),
    }
}

fn server_def(name: &str, auth: Option<AuthPolicy>) -> McpServerDefinition {
    McpServerDefinition {
        name: name.to_string(),
        description: None,
        transport: Transport::RemoteHttp {
            url: "https://mcp.example/mcp".to_string(),
            headers: HashMap::new(),
        },
        tool_prefix: None,
        auto_start: false,
        auth,
        health: None,
        dependencies: vec![],
    }
}

fn id_token_record(session: &str, issuer: &str) -> TokenRecord {
    TokenRecord {
        session_id: session.to_string(),
        issuer_url: issuer.to_string(),
        scope: "openid".to_string(),
        access_token: "access".to_string(),
        refresh_token: None,
        id_token: Some("local-id-token".to_string()),
        expires_at: Utc::now() + Duration::hours(1),
    }
}

#[tokio::test]
async fn test_no_auth_policy_sends_unadorned() {
    let (_, _, egress) = build_auth(oauth_config(), None).unwrap();
    let def = server_def("plain", None);

    let bearer = egress.resolve_bearer("s1", &def).await.unwrap();
    assert!(bearer.is_none());
}

#[tokio::test]
async fn test_sso_reuse_finds_issuer_token() {
    let (store, _, egress) = build_auth(oauth_config(), None).unwrap();
    store.put(id_token_record("s1", "https://dex.local"));

    let def = server_def(
        "sso-server",
        Some(AuthPolicy {
            issuer_url: Some("https://dex.local".to_string()),
            ..Default::default()
        }),
    );

    let bearer = egress.resolve_bearer("s1", &def).await.unwrap();
    assert_eq!(bearer.as_deref(), Some("access"));

    // Another session sees nothing: the full key must match.
    let bearer = egress.resolve_bearer("s2", &def).await.unwrap();
    assert!(bearer.is_none());
}

#[tokio::test]
async fn test_forward_token_attaches_id_token() {
    let (store, _, egress) =
        build_auth(oauth_config(), Some("https://dex.local".to_string())).unwrap();
    store.put(id_token_record("s1", "https://dex.local"));

    let def = server_def(
        "gazelle-mcp-kubernetes",
        Some(AuthPolicy {
            forward_token: true,
            required_audiences: vec!["dex-k8s-authenticator".to_string()],
            ..Default::default()
        }),
    );

    let bearer = egress.resolve_bearer("s1", &def).await.unwrap();
    assert_eq!(bearer.as_deref(), Some("local-id-token"));
}

#[tokio::test]
async fn test_forward_token_fallback_without_known_issuer() {
    let (store, _, egress) = build_auth(oauth_config(), None).unwrap();
    store.put(id_token_record("s1", "https://anything.example"));

    let def = server_def(
        "forwarding",
        Some(AuthPolicy {
            forward_token: true,
            ..Default::default()
        }),
    );

    let bearer = egress.resolve_bearer("s1", &def).await.unwrap();
    assert_eq!(bearer.as_deref(), Some("local-id-token"));
}

#[tokio::test]
async fn test_token_exchange_rfc8693() {
    let dex_b = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains(
            "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Atoken-exchange",
        ))
        .and(body_string_contains("subject_token=local-id-token"))
        .and(body_string_contains("connector_id=cluster-a-dex"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "exchanged-access",
            "issued_token_type": "urn:ietf:params:oauth:token-type:access_token",
            "token_type": "bearer",
            "expires_in": 600
        })))
        .expect(1)
        .mount(&dex_b)
        .await;

    let (store, _, egress) = build_auth(oauth_config(), None).unwrap();
    store.put(id_token_record("s1", "https://dex.a.example"));

    let def = server_def(
        "remote-cluster",
        Some(AuthPolicy {
            token_exchange: Some(TokenExchangeConfig {
                enabled: true,
                token_endpoint: format!("{}/token", dex_b.uri()),
                connector_id: Some("cluster-a-dex".to_string()),
                client_id: None,
                client_secret_ref: None,
                scopes: vec![],
            }),
            ..Default::default()
        }),
    );

    let bearer = egress.resolve_bearer("s1", &def).await.unwrap();
    assert_eq!(bearer.as_deref(), Some("exchanged-access"));

    // Cached under the remote issuer: the second resolve skips the network.
    let bearer = egress.resolve_bearer("s1", &def).await.unwrap();
    assert_eq!(bearer.as_deref(), Some("exchanged-access"));
    let cached = store.get_by_issuer("s1", &dex_b.uri()).await.unwrap();
    assert_eq!(cached.access_token, "exchanged-access");
}

#[tokio::test]
async fn test_token_exchange_without_subject_requires_auth() {
    let (_, _, egress) = build_auth(oauth_config(), None).unwrap();

    let def = server_def(
        "remote-cluster",
        Some(AuthPolicy {
            token_exchange: Some(TokenExchangeConfig {
                enabled: true,
                token_endpoint: "https://dex.b.example/token".to_string(),
                connector_id: None,
                client_id: None,
                client_secret_ref: None,
                scopes: vec![],
            }),
            ..Default::default()
        }),
    );

    let err = egress.resolve_bearer("s1", &def).await.unwrap_err();
    assert!(matches!(
        err,
        crate::MusterError::AuthRequired { ref server, .. } if server == "remote-cluster"
    ));
}

#[tokio::test]
async fn test_challenge_from_401_parses_realm() {
    let (_, challenges, egress) = build_auth(oauth_config(), None).unwrap();

    let def = server_def("remote-server", Some(AuthPolicy::default()));
    let err = egress.challenge_from_401(
        "s1",
        &def,
        Some(r#"Bearer realm="https://idp.example/", scope="openid""#),
        None,
    );

    match err {
        crate::MusterError::AuthRequired { server, auth_url } => {
            assert_eq!(server, "remote-server");
            let auth_url = auth_url.expect("challenge must carry an auth URL");
            assert!(auth_url.starts_with("https://idp.example/auth?"));
        }
        other => panic!("expected AuthRequired, got {:?}", other),
    }
    assert_eq!(challenges.pending_count(), 1);
}

#[tokio::test]
async fn test_challenge_without_issuer_has_no_url() {
    let (_, _, egress) = build_auth(oauth_config(), None).unwrap();

    let def = server_def("remote-server", None);
    let err = egress.challenge_from_401("s1", &def, None, None);

    assert!(matches!(
        err,
        crate::MusterError::AuthRequired { auth_url: None, .. }
    ));
}

#[tokio::test]
async fn test_refresh_via_issuer_token_endpoint() {
    let idp = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "new-access",
            "refresh_token": "new-refresh",
            "token_type": "bearer",
            "expires_in": 3600
        })))
        .mount(&idp)
        .await;

    let (_, _, egress) = build_auth(oauth_config(), None).unwrap();

    let stale = TokenRecord {
        session_id: "s1".to_string(),
        issuer_url: idp.uri(),
        scope: "openid".to_string(),
        access_token: "old-access".to_string(),
        refresh_token: Some("old-refresh".to_string()),
        id_token: Some("keep-me".to_string()),
        expires_at: Utc::now() + Duration::seconds(5),
    };

    use crate::auth::TokenRefresher;
    let refreshed = egress.refresh(&stale).await.unwrap();
    assert_eq!(refreshed.access_token, "new-access");
    assert_eq!(refreshed.refresh_token.as_deref(), Some("new-refresh"));
    // Claims carried over when the issuer omits a new id_token.
    assert_eq!(refreshed.id_token.as_deref(), Some("keep-me"));
}

#[tokio::test]
async fn test_auth_status_reports_claims() {
    use base64::Engine;
    let b64 = |v: serde_json::Value| {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(serde_json::to_vec(&v).unwrap())
    };
    let id_token = format!(
        "{}.{}.sig",
        b64(serde_json::json!({"alg": "RS256"})),
        b64(serde_json::json!({"sub": "user-1", "email": "dev@example.com"}))
    );

    let (store, _, egress) =
        build_auth(oauth_config(), Some("https://dex.local".to_string())).unwrap();
    let mut record = id_token_record("s1", "https://dex.local");
    record.id_token = Some(id_token);
    record.refresh_token = Some("r".to_string());
    store.put(record);

    let def = server_def("gazelle-mcp-kubernetes", Some(AuthPolicy::default()));
    let status = egress.auth_status("s1", &def).await;

    assert!(status.authenticated);
    assert_eq!(status.subject.as_deref(), Some("user-1"));
    assert_eq!(status.email.as_deref(), Some("dev@example.com"));
    assert!(status.has_refresh_token);

    let anon = egress.auth_status("nobody", &def).await;
    assert!(!anon.authenticated);
}

//! OAuth 2.0 Authorization Code + PKCE state machine.
//!
//! One engine driven by [`ProviderConfig`] handles every provider's quirks
//! (CSRF-state-only vs. PKCE, extra authorization-URL params, post vs.
//! basic client auth) through a small per-provider extras table rather
//! than a separate handler per provider.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use url::Url;

use crate::config::{AuthMethod, ProviderConfig};
use crate::error::{SdkError, SdkResult};
use crate::model::{PkceChallenge, TokenSet};

const DEFAULT_PKCE_TTL: chrono::Duration = chrono::Duration::minutes(10);

pub struct AuthCore {
    providers: RwLock<HashMap<String, ProviderConfig>>,
    pkce: RwLock<HashMap<String, PkceChallenge>>,
    http: reqwest::Client,
    pkce_ttl: chrono::Duration,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
    token_type: Option<String>,
    id_token: Option<String>,
}

#[derive(Deserialize)]
struct DiscoveryDocument {
    authorization_endpoint: String,
    token_endpoint: String,
    revocation_endpoint: Option<String>,
}

#[derive(Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl AuthCore {
    pub fn new(providers: HashMap<String, ProviderConfig>) -> Self {
        Self {
            providers: RwLock::new(providers),
            pkce: RwLock::new(HashMap::new()),
            http: reqwest::Client::new(),
            pkce_ttl: DEFAULT_PKCE_TTL,
        }
    }

    /// Resolve `discoveryUrl` for any provider that has one into concrete
    /// authorization/token/revocation endpoints.
    pub async fn initialize(&self) -> SdkResult<()> {
        let needing_discovery: Vec<(String, String)> = {
            let providers = self.providers.read().await;
            providers
                .iter()
                .filter_map(|(key, cfg)| {
                    cfg.discovery_url.clone().map(|url| (key.clone(), url))
                })
                .collect()
        };

        for (key, discovery_url) in needing_discovery {
            let doc: DiscoveryDocument = self
                .http
                .get(&discovery_url)
                .send()
                .await
                .map_err(|e| SdkError::OAuth(format!("discovery fetch failed for {key}: {e}")))?
                .json()
                .await
                .map_err(|e| SdkError::OAuth(format!("discovery document malformed for {key}: {e}")))?;

            let mut providers = self.providers.write().await;
            if let Some(cfg) = providers.get_mut(&key) {
                cfg.authorization_endpoint = Some(doc.authorization_endpoint);
                cfg.token_endpoint = Some(doc.token_endpoint);
                cfg.revocation_endpoint = doc.revocation_endpoint;
            }
        }

        Ok(())
    }

    /// Remove any PKCE challenges older than the configured TTL. Intended
    /// to run on a periodic sweeper (default every 60s).
    pub async fn sweep_expired_pkce(&self) {
        let ttl = self.pkce_ttl;
        self.pkce
            .write()
            .await
            .retain(|_, challenge| !challenge.is_expired(ttl));
    }

    pub async fn create_auth_url(&self, provider_key: &str, user_id: &str) -> SdkResult<(String, String)> {
        let providers = self.providers.read().await;
        let config = providers
            .get(provider_key)
            .ok_or_else(|| SdkError::Config(format!("unknown provider: {provider_key}")))?;
        let authorization_endpoint = config.authorization_endpoint.clone().ok_or_else(|| {
            SdkError::Config(format!("provider {provider_key} has no authorizationEndpoint"))
        })?;

        let state = random_base64url(32);
        let code_verifier = random_base64url(48);
        let code_challenge = sha256_base64url(&code_verifier);
        let nonce = config.oidc.then(|| random_base64url(16));

        let mut url = Url::parse(&authorization_endpoint)
            .map_err(|e| SdkError::Config(format!("invalid authorizationEndpoint: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &config.client_id)
                .append_pair("redirect_uri", &config.redirect_uri)
                .append_pair("state", &state);
            if !config.scopes.is_empty() {
                query.append_pair("scope", &config.scopes.join(" "));
            }
            if config.use_pkce {
                query
                    .append_pair("code_challenge", &code_challenge)
                    .append_pair("code_challenge_method", "S256");
            }
            if let Some(nonce) = &nonce {
                query.append_pair("nonce", nonce);
            }
            for (key, value) in provider_extras(provider_key) {
                query.append_pair(key, value);
            }
        }

        self.pkce.write().await.insert(
            state.clone(),
            PkceChallenge {
                code_verifier,
                code_challenge,
                method: "S256",
                nonce,
                created_at: Utc::now(),
                user_id: user_id.to_string(),
                provider: provider_key.to_string(),
            },
        );

        Ok((url.to_string(), state))
    }

    pub async fn exchange_code(
        &self,
        provider_key: &str,
        code: &str,
        state: &str,
    ) -> SdkResult<(String, TokenSet)> {
        let challenge = {
            let mut pkce = self.pkce.write().await;
            pkce.remove(state)
                .ok_or_else(|| SdkError::OAuthDenied("unknown or already-consumed state".into()))?
        };

        if challenge.is_expired(self.pkce_ttl) {
            return Err(SdkError::OAuthDenied("authorization state expired".into()));
        }
        if challenge.provider != provider_key {
            return Err(SdkError::OAuthDenied("state/provider mismatch".into()));
        }

        let providers = self.providers.read().await;
        let config = providers
            .get(provider_key)
            .ok_or_else(|| SdkError::Config(format!("unknown provider: {provider_key}")))?;
        let token_endpoint = config
            .token_endpoint
            .clone()
            .ok_or_else(|| SdkError::Config(format!("provider {provider_key} has no tokenEndpoint")))?;

        let mut form: Vec<(&str, String)> = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", config.redirect_uri.clone()),
        ];
        if config.use_pkce {
            form.push(("code_verifier", challenge.code_verifier.clone()));
        }

        let token_set = self
            .post_token_request(config, &token_endpoint, form)
            .await?;

        if config.oidc {
            if let (Some(id_token), Some(expected_nonce)) = (&token_set.id_token, &challenge.nonce) {
                validate_nonce(id_token, expected_nonce)?;
            }
        }

        Ok((challenge.user_id, token_set))
    }

    pub async fn refresh_token(&self, provider_key: &str, refresh_token: &str) -> SdkResult<TokenSet> {
        let providers = self.providers.read().await;
        let config = providers
            .get(provider_key)
            .ok_or_else(|| SdkError::Config(format!("unknown provider: {provider_key}")))?;
        let token_endpoint = config
            .token_endpoint
            .clone()
            .ok_or_else(|| SdkError::Config(format!("provider {provider_key} has no tokenEndpoint")))?;

        let form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];

        self.post_token_request(config, &token_endpoint, form).await
    }

    /// Best-effort revocation: swallows transport/4xx failures since a
    /// provider rejecting an already-invalid token isn't actionable.
    pub async fn revoke_token(&self, provider_key: &str, token: &str) {
        let providers = self.providers.read().await;
        let Some(config) = providers.get(provider_key) else {
            return;
        };
        let Some(endpoint) = &config.revocation_endpoint else {
            return;
        };

        let mut request = self
            .http
            .post(endpoint)
            .form(&[("token", token), ("client_id", &config.client_id)]);
        if let Some(secret) = &config.client_secret {
            request = request.form(&[("client_secret", secret.expose_secret())]);
        }

        if let Err(e) = request.send().await {
            tracing::debug!(provider = provider_key, error = %e, "token revocation request failed");
        }
    }

    async fn post_token_request(
        &self,
        config: &ProviderConfig,
        token_endpoint: &str,
        mut form: Vec<(&str, String)>,
    ) -> SdkResult<TokenSet> {
        let method = auth_method_for(config);
        let mut request = self.http.post(token_endpoint);

        match method {
            AuthMethod::ClientSecretBasic => {
                let secret = config
                    .client_secret
                    .as_ref()
                    .map(|s| s.expose_secret().to_string())
                    .unwrap_or_default();
                request = request.basic_auth(&config.client_id, Some(secret));
            }
            AuthMethod::ClientSecretPost => {
                form.push(("client_id", config.client_id.clone()));
                if let Some(secret) = &config.client_secret {
                    form.push(("client_secret", secret.expose_secret().to_string()));
                }
            }
        }

        let response = request
            .form(&form)
            .send()
            .await
            .map_err(|e| SdkError::OAuth(format!("token request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SdkError::OAuth(format!("token response unreadable: {e}")))?;

        if !status.is_success() {
            if let Ok(err_body) = serde_json::from_str::<OAuthErrorBody>(&body) {
                return Err(SdkError::OAuth(format!(
                    "{}: {}",
                    err_body.error,
                    err_body.error_description.unwrap_or_default()
                )));
            }
            return Err(SdkError::OAuth(format!(
                "token endpoint returned {}: {body}",
                status.as_u16()
            )));
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| SdkError::OAuth(format!("token response malformed: {e}")))?;

        Ok(TokenSet {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_at: parsed
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            scope: parsed.scope,
            token_type: parsed.token_type,
            id_token: parsed.id_token,
        })
    }
}

/// Post then basic, unless the provider forces one explicitly. Some
/// providers post `client_secret` in the form body; others mandate
/// HTTP Basic.
fn auth_method_for(config: &ProviderConfig) -> AuthMethod {
    config.forced_auth_method.unwrap_or(AuthMethod::ClientSecretPost)
}

/// Per-provider authorization-URL extras (Google's offline-access consent
/// prompt, a social aggregator's permanent-duration request token
/// equivalent).
fn provider_extras(provider_key: &str) -> Vec<(&'static str, &'static str)> {
    match provider_key {
        "google" | "google-calendar" | "gmail" => {
            vec![("access_type", "offline"), ("prompt", "consent")]
        }
        "social-link-aggregator" => vec![("duration", "permanent")],
        _ => Vec::new(),
    }
}

/// Checks the `nonce` claim of an id_token's JSON payload segment against
/// the one minted for this auth attempt. Signature verification is left
/// to a dedicated JWT library at the consuming application's boundary;
/// this guards replay of the authorization response, not token forgery.
fn validate_nonce(id_token: &str, expected: &str) -> SdkResult<()> {
    let mut parts = id_token.split('.');
    let _header = parts.next();
    let payload_b64 = parts
        .next()
        .ok_or_else(|| SdkError::OAuth("id_token missing payload segment".into()))?;
    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|e| SdkError::OAuth(format!("id_token payload not base64url: {e}")))?;
    let payload: serde_json::Value = serde_json::from_slice(&payload_bytes)
        .map_err(|e| SdkError::OAuth(format!("id_token payload not json: {e}")))?;

    match payload.get("nonce").and_then(|v| v.as_str()) {
        Some(nonce) if nonce == expected => Ok(()),
        _ => Err(SdkError::OAuthDenied("id_token nonce mismatch".into())),
    }
}

fn random_base64url(len_bytes: usize) -> String {
    let mut bytes = vec![0u8; len_bytes];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn sha256_base64url(input: &str) -> String {
    let hash = Sha256::digest(input.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(use_pkce: bool, oidc: bool) -> ProviderConfig {
        ProviderConfig {
            client_id: "client-123".to_string(),
            client_secret: Some(SecretString::from("secret-456".to_string())),
            authorization_endpoint: Some("https://example.test/authorize".to_string()),
            token_endpoint: Some("https://example.test/token".to_string()),
            revocation_endpoint: None,
            discovery_url: None,
            scopes: vec!["read".to_string(), "write".to_string()],
            redirect_uri: "https://app.test/callback".to_string(),
            use_pkce,
            forced_auth_method: None,
            oidc,
        }
    }

    fn core(key: &str, use_pkce: bool, oidc: bool) -> AuthCore {
        let mut providers = HashMap::new();
        providers.insert(key.to_string(), provider(use_pkce, oidc));
        AuthCore::new(providers)
    }

    #[tokio::test]
    async fn create_auth_url_includes_pkce_challenge() {
        let core = core("github", true, false);
        let (url, state) = core.create_auth_url("github", "user-1").await.unwrap();
        assert!(url.contains("code_challenge="));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains(&format!("state={state}")));
    }

    #[tokio::test]
    async fn create_auth_url_without_pkce_omits_challenge() {
        let core = core("vercel", false, false);
        let (url, _) = core.create_auth_url("vercel", "user-1").await.unwrap();
        assert!(!url.contains("code_challenge"));
    }

    #[tokio::test]
    async fn create_auth_url_adds_google_extras() {
        let core = core("google", true, false);
        let (url, _) = core.create_auth_url("google", "user-1").await.unwrap();
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("prompt=consent"));
    }

    #[tokio::test]
    async fn exchange_code_rejects_unknown_state() {
        let core = core("github", true, false);
        let result = core.exchange_code("github", "some-code", "never-issued").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn exchange_code_rejects_provider_mismatch() {
        let core = core("github", true, false);
        let (_, state) = core.create_auth_url("github", "user-1").await.unwrap();
        let result = core.exchange_code("google", "some-code", &state).await;
        assert!(result.is_err());
    }

    #[test]
    fn nonce_validation_accepts_matching_nonce() {
        let payload = URL_SAFE_NO_PAD.encode(br#"{"nonce":"abc123"}"#);
        let token = format!("header.{payload}.signature");
        assert!(validate_nonce(&token, "abc123").is_ok());
    }

    #[test]
    fn nonce_validation_rejects_mismatch() {
        let payload = URL_SAFE_NO_PAD.encode(br#"{"nonce":"abc123"}"#);
        let token = format!("header.{payload}.signature");
        assert!(validate_nonce(&token, "different").is_err());
    }
}
